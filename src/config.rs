use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::series::reconcile::ReconcileConfig;
use crate::series::{CandidateOrder, SizeBounds};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PHOTOSERIES_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub grouping: GroupingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    #[serde(default = "default_min_images")]
    pub min_images: usize,

    #[serde(default = "default_max_images")]
    pub max_images: usize,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Analyze the biggest candidates first.
    #[serde(default = "default_true")]
    pub largest_first: bool,
}

fn default_min_images() -> usize {
    2
}

fn default_max_images() -> usize {
    14
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "tiff", "webp"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            min_images: default_min_images(),
            max_images: default_max_images(),
            image_extensions: default_image_extensions(),
            largest_first: default_true(),
        }
    }
}

impl GroupingConfig {
    pub fn bounds(&self) -> SizeBounds {
        SizeBounds {
            min: self.min_images,
            max: self.max_images,
        }
    }

    pub fn candidate_order(&self) -> CandidateOrder {
        if self.largest_first {
            CandidateOrder::LargestFirst
        } else {
            CandidateOrder::Discovery
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    #[default]
    Gemini,
    OpenAI,
    LmStudio,
    Anthropic,
    Ollama,
}

impl LlmProviderType {
    fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProviderType::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            LlmProviderType::OpenAI => "https://api.openai.com/v1",
            LlmProviderType::LmStudio => "http://127.0.0.1:1234/v1",
            LlmProviderType::Anthropic => "https://api.anthropic.com/v1",
            LlmProviderType::Ollama => "http://127.0.0.1:11434",
        }
    }

    fn key_env_vars(&self) -> &'static [&'static str] {
        match self {
            LlmProviderType::Gemini => &["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"],
            LlmProviderType::OpenAI => &["OPENAI_API_KEY"],
            LlmProviderType::Anthropic => &["ANTHROPIC_API_KEY"],
            LlmProviderType::LmStudio | LlmProviderType::Ollama => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderType,

    /// Provider base URL; the provider's public endpoint when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Longest edge of images sent to the provider.
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension: u32,

    /// Replaces the built-in instructions. The image id list is still appended.
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

fn default_llm_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_image_dimension() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderType::default(),
            endpoint: None,
            model: default_llm_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_image_dimension: default_max_image_dimension(),
            custom_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| self.provider.default_endpoint().to_string())
    }

    /// Configured key, else the first non-empty provider env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    fn resolve_api_key_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.provider
            .key_env_vars()
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Concurrent verifier calls.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_fallback_caption")]
    pub fallback_caption: String,

    #[serde(default = "default_true")]
    pub enforce_sequence_phrasing: bool,

    /// Pause after each verifier call, per worker.
    #[serde(default)]
    pub request_delay_ms: u64,
}

fn default_workers() -> usize {
    1
}

fn default_fallback_caption() -> String {
    ReconcileConfig::default().fallback_caption
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fallback_caption: default_fallback_caption(),
            enforce_sequence_phrasing: default_true(),
            request_delay_ms: 0,
        }
    }
}

impl AnalysisConfig {
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            fallback_caption: self.fallback_caption.clone(),
            enforce_sequence_phrasing: self.enforce_sequence_phrasing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Minimum frames per exported series; `grouping.min_images` when unset.
    #[serde(default)]
    pub min_length: Option<usize>,

    /// Series longer than this are left out of the export.
    #[serde(default)]
    pub max_length: Option<usize>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("training_data")
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            min_length: None,
            max_length: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photoseries")
        .join("photoseries.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            grouping: GroupingConfig::default(),
            llm: LlmConfig::default(),
            analysis: AnalysisConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Config {
    /// Load from `PHOTOSERIES_CONFIG` or the default location, writing a
    /// default file when none exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("parsing config {}", path.display()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!(path = %path.display(), "Wrote default config");
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let g = &self.grouping;
        if g.min_images == 0 {
            bail!("grouping.min_images must be at least 1");
        }
        if g.min_images > g.max_images {
            bail!(
                "grouping.min_images ({}) is larger than grouping.max_images ({})",
                g.min_images,
                g.max_images
            );
        }
        if g.image_extensions.is_empty() {
            bail!("grouping.image_extensions is empty");
        }
        if self.analysis.workers == 0 {
            bail!("analysis.workers must be at least 1");
        }
        if let Some(max) = self.export.max_length {
            if self.export_min_length() > max {
                bail!(
                    "export minimum length ({}) is larger than export.max_length ({})",
                    self.export_min_length(),
                    max
                );
            }
        }
        Ok(())
    }

    /// Minimum export length, falling back to the grouping minimum.
    pub fn export_min_length(&self) -> usize {
        self.export.min_length.unwrap_or(self.grouping.min_images)
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photoseries")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.grouping.bounds(), SizeBounds { min: 2, max: 14 });
        assert_eq!(config.grouping.candidate_order(), CandidateOrder::LargestFirst);
        assert_eq!(config.llm.provider, LlmProviderType::Gemini);
        assert_eq!(config.llm.model, "gemini-2.5-flash");
        assert_eq!(config.analysis.workers, 1);
        assert_eq!(config.export_min_length(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [grouping]
            max_images = 30
            largest_first = false

            [llm]
            provider = "ollama"
            model = "llava"
            "#,
        )
        .unwrap();

        assert_eq!(config.grouping.min_images, 2);
        assert_eq!(config.grouping.max_images, 30);
        assert_eq!(config.grouping.candidate_order(), CandidateOrder::Discovery);
        assert_eq!(config.llm.provider, LlmProviderType::Ollama);
        assert_eq!(config.llm.endpoint(), "http://127.0.0.1:11434");
        assert_eq!(config.llm.timeout_secs, 120);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = Config::default();
        config.grouping.min_images = 0;
        assert!(config.validate().is_err());

        config.grouping.min_images = 5;
        config.grouping.max_images = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.max_length = Some(1);
        assert!(config.validate().is_err());
        config.export.max_length = Some(2);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_writes_default_then_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let first = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let mut edited = first.clone();
        edited.grouping.min_images = 3;
        edited.save_to(&path).unwrap();

        let second = Config::load_from(&path).unwrap();
        assert_eq!(second.grouping.min_images, 3);
    }

    #[test]
    fn test_api_key_resolution() {
        let env = |name: &str| match name {
            "GEMINI_API_KEY" => Some("  ".to_string()),
            "GOOGLE_AI_API_KEY" => Some("google-key".to_string()),
            _ => None,
        };

        let mut llm = LlmConfig::default();
        assert_eq!(llm.resolve_api_key_with(env).as_deref(), Some("google-key"));

        llm.api_key = Some("configured".to_string());
        assert_eq!(llm.resolve_api_key_with(env).as_deref(), Some("configured"));

        let local = LlmConfig {
            provider: LlmProviderType::LmStudio,
            ..Default::default()
        };
        assert_eq!(local.resolve_api_key_with(env), None);
    }
}
