use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::{LlmConfig, LlmProviderType};

/// An image ready to be embedded in a request body.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: String,
    pub mime_type: &'static str,
}

/// Text returned by a provider plus whatever usage it reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service could not be reached or refused the request.
    #[error("request failed: {0}")]
    Request(String),
    /// The service answered with a body we could not understand.
    #[error("unexpected response: {0}")]
    Response(String),
}

/// A vision-capable completion service.
pub trait VisionProvider: Send + Sync {
    /// Send one prompt with all `images` attached, in order.
    fn complete(&self, prompt: &str, images: &[EncodedImage]) -> Result<Completion, ProviderError>;

    /// Provider name for display.
    fn provider_name(&self) -> &'static str;
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn request_error(provider: &str, err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            ProviderError::Request(format!("{} returned HTTP {}: {}", provider, code, snippet))
        }
        ureq::Error::Transport(t) => ProviderError::Request(format!("{}: {}", provider, t)),
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    provider: &str,
    response: ureq::Response,
) -> Result<T, ProviderError> {
    response.into_json().map_err(|e| {
        ProviderError::Response(format!("failed to parse {} response: {}", provider, e))
    })
}

// ============================================================================
// Gemini provider (generateContent REST API)
// ============================================================================

pub struct GeminiProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiBlob },
}

#[derive(Debug, Serialize)]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

impl GeminiProvider {
    pub fn new(endpoint: &str, model: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl VisionProvider for GeminiProvider {
    fn complete(&self, prompt: &str, images: &[EncodedImage]) -> Result<Completion, ProviderError> {
        let mut parts = vec![GeminiPart::Text {
            text: prompt.to_string(),
        }];
        parts.extend(images.iter().map(|img| GeminiPart::InlineData {
            inline_data: GeminiBlob {
                mime_type: img.mime_type.to_string(),
                data: img.data.clone(),
            },
        }));

        let request = GeminiRequest {
            contents: vec![GeminiContent { parts }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.2,
                response_mime_type: "application/json".to_string(),
            },
        };

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("x-goog-api-key", &self.api_key)
            .send_json(&request)
            .map_err(|e| request_error("Gemini", e))?;

        let gemini_response: GeminiResponse = decode("Gemini", response)?;

        let text: String = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ProviderError::Response("no text in Gemini response".to_string()));
        }

        Ok(Completion {
            text,
            tokens_used: gemini_response.usage_metadata.and_then(|u| u.total_token_count),
        })
    }

    fn provider_name(&self) -> &'static str {
        "Gemini"
    }
}

// ============================================================================
// OpenAI-compatible provider (works with LM Studio, OpenAI, and compatible APIs)
// ============================================================================

pub struct OpenAICompatibleProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    total_tokens: Option<u64>,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }
}

impl VisionProvider for OpenAICompatibleProvider {
    fn complete(&self, prompt: &str, images: &[EncodedImage]) -> Result<Completion, ProviderError> {
        let mut content = vec![OpenAIContentPart::Text {
            text: prompt.to_string(),
        }];
        content.extend(images.iter().map(|img| OpenAIContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", img.mime_type, img.data),
            },
        }));

        let request = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: 1000,
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = self.agent.post(&url).set("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response = req
            .send_json(&request)
            .map_err(|e| request_error("OpenAI-compatible", e))?;

        let chat_response: OpenAIChatResponse = decode("OpenAI-compatible", response)?;

        let text = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ProviderError::Response("no choices in response".to_string()))?;

        Ok(Completion {
            text,
            tokens_used: chat_response.usage.and_then(|u| u.total_tokens),
        })
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

// ============================================================================
// Anthropic Claude provider
// ============================================================================

pub struct AnthropicProvider {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(endpoint: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

impl VisionProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, images: &[EncodedImage]) -> Result<Completion, ProviderError> {
        let mut content: Vec<AnthropicContent> = images
            .iter()
            .map(|img| AnthropicContent::Image {
                source: AnthropicImageSource {
                    source_type: "base64".to_string(),
                    media_type: img.mime_type.to_string(),
                    data: img.data.clone(),
                },
            })
            .collect();
        content.push(AnthropicContent::Text {
            text: prompt.to_string(),
        });

        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: 1000,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content,
            }],
        };

        let url = format!("{}/messages", self.endpoint);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(&request)
            .map_err(|e| request_error("Anthropic", e))?;

        let anthropic_response: AnthropicResponse = decode("Anthropic", response)?;

        let text = anthropic_response
            .content
            .first()
            .and_then(|c| c.text.clone())
            .ok_or_else(|| ProviderError::Response("no text in Anthropic response".to_string()))?;

        Ok(Completion {
            text,
            tokens_used: anthropic_response
                .usage
                .map(|u| u.input_tokens + u.output_tokens),
        })
    }

    fn provider_name(&self) -> &'static str {
        "Anthropic Claude"
    }
}

// ============================================================================
// Ollama provider
// ============================================================================

pub struct OllamaProvider {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    format: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

impl OllamaProvider {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

impl VisionProvider for OllamaProvider {
    fn complete(&self, prompt: &str, images: &[EncodedImage]) -> Result<Completion, ProviderError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            images: images.iter().map(|img| img.data.clone()).collect(),
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/generate", self.endpoint);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| request_error("Ollama", e))?;

        let ollama_response: OllamaResponse = decode("Ollama", response)?;

        let tokens_used = match (ollama_response.prompt_eval_count, ollama_response.eval_count) {
            (None, None) => None,
            (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
        };

        Ok(Completion {
            text: ollama_response.response,
            tokens_used,
        })
    }

    fn provider_name(&self) -> &'static str {
        "Ollama"
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Load an image, resize if either dimension exceeds `max_dimension`, and
/// re-encode it as base64 JPEG.
pub fn load_and_encode_image(image_path: &Path, max_dimension: u32) -> Result<EncodedImage> {
    let img = image::open(image_path)
        .map_err(|e| anyhow!("Failed to open image {}: {}", image_path.display(), e))?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    // JPEG has no alpha channel.
    let img = image::DynamicImage::ImageRgb8(img.to_rgb8());

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    img.write_with_encoder(encoder)
        .map_err(|e| anyhow!("Failed to encode image as JPEG: {}", e))?;

    Ok(EncodedImage {
        data: BASE64.encode(buf.into_inner()),
        mime_type: "image/jpeg",
    })
}

/// Extract the JSON object from a response that may wrap it in a markdown
/// code block or surrounding prose.
pub fn extract_json(content: &str) -> Option<&str> {
    let mut trimmed = content.trim();

    if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            let after_first_line = &trimmed[start + 1..];
            if let Some(end) = after_first_line.rfind("```") {
                trimmed = after_first_line[..end].trim();
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

// ============================================================================
// Factory function
// ============================================================================

/// Create a provider from configuration. Hosted providers need an API key.
pub fn create_provider(config: &LlmConfig) -> Result<Box<dyn VisionProvider>> {
    let endpoint = config.endpoint();
    let timeout = Duration::from_secs(config.timeout_secs);
    let api_key = config.resolve_api_key();

    let provider: Box<dyn VisionProvider> = match config.provider {
        LlmProviderType::Gemini => {
            let Some(key) = api_key else {
                bail!(
                    "Gemini needs an API key: set llm.api_key, GEMINI_API_KEY or GOOGLE_AI_API_KEY"
                );
            };
            Box::new(GeminiProvider::new(&endpoint, &config.model, &key, timeout))
        }
        LlmProviderType::OpenAI => {
            let Some(key) = api_key else {
                bail!("OpenAI needs an API key: set llm.api_key or OPENAI_API_KEY");
            };
            Box::new(OpenAICompatibleProvider::new(
                &endpoint,
                &config.model,
                Some(&key),
                timeout,
            ))
        }
        LlmProviderType::LmStudio => Box::new(OpenAICompatibleProvider::new(
            &endpoint,
            &config.model,
            api_key.as_deref(),
            timeout,
        )),
        LlmProviderType::Anthropic => {
            let Some(key) = api_key else {
                bail!("Anthropic needs an API key: set llm.api_key or ANTHROPIC_API_KEY");
            };
            Box::new(AnthropicProvider::new(&endpoint, &key, &config.model, timeout))
        }
        LlmProviderType::Ollama => Box::new(OllamaProvider::new(&endpoint, &config.model, timeout)),
    };

    tracing::debug!(
        provider = provider.provider_name(),
        model = %config.model,
        "Created vision provider"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
        assert_eq!(
            extract_json("```json\n{\"is_series\": true}\n```"),
            Some("{\"is_series\": true}")
        );
        assert_eq!(
            extract_json("Here you go: {\"x\": {\"y\": 2}} hope that helps"),
            Some("{\"x\": {\"y\": 2}}")
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[test]
    fn test_load_and_encode_resizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        image::RgbaImage::from_pixel(64, 16, image::Rgba([200, 10, 10, 255]))
            .save(&path)
            .unwrap();

        let encoded = load_and_encode_image(&path, 32).unwrap();
        assert_eq!(encoded.mime_type, "image/jpeg");

        let bytes = BASE64.decode(encoded.data).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (32, 8));
    }

    #[test]
    fn test_load_missing_image_fails() {
        let dir = tempdir().unwrap();
        assert!(load_and_encode_image(&dir.path().join("missing.jpg"), 32).is_err());
    }

    #[test]
    fn test_hosted_providers_need_key() {
        let config = LlmConfig {
            provider: LlmProviderType::Anthropic,
            api_key: Some("   ".to_string()),
            ..Default::default()
        };
        // Only fails when ANTHROPIC_API_KEY is not set in the test environment.
        if std::env::var("ANTHROPIC_API_KEY").map_or(true, |v| v.trim().is_empty()) {
            assert!(create_provider(&config).is_err());
        }

        let local = LlmConfig {
            provider: LlmProviderType::Ollama,
            ..Default::default()
        };
        assert_eq!(create_provider(&local).unwrap().provider_name(), "Ollama");
    }
}
