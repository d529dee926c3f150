//! Asking a vision model whether a candidate is a real photo series.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::provider::{extract_json, load_and_encode_image, ProviderError, VisionProvider};
use crate::config::LlmConfig;
use crate::series::{CandidateSeries, VerificationVerdict};

/// Why a candidate could not be verified. Both kinds leave nothing stored
/// and the candidate is retried on the next run.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
    #[error("malformed verifier response: {0}")]
    MalformedResponse(String),
}

impl From<ProviderError> for VerifyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Request(msg) => VerifyError::Unavailable(msg),
            ProviderError::Response(msg) => VerifyError::MalformedResponse(msg),
        }
    }
}

pub trait SeriesVerifier: Send + Sync {
    fn verify(&self, candidate: &CandidateSeries) -> Result<VerificationVerdict, VerifyError>;
}

/// Short id shown to the model for each member, in scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIds {
    ids: Vec<(String, PathBuf)>,
}

impl ImageIds {
    /// `_<digits>` from the filename's numeric suffix, or `img_<n>` when that
    /// suffix is missing or already taken.
    pub fn for_candidate(candidate: &CandidateSeries) -> Self {
        let mut taken = HashSet::new();
        let mut ids = Vec::with_capacity(candidate.image_count());

        for (i, path) in candidate.paths().enumerate() {
            let id = numeric_suffix(path)
                .map(|digits| format!("_{}", digits))
                .filter(|id| !taken.contains(id))
                .unwrap_or_else(|| format!("img_{}", i + 1));
            taken.insert(id.clone());
            ids.push((id, path.to_path_buf()));
        }

        Self { ids }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.ids.iter().map(|(id, p)| (id.as_str(), p.as_path()))
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn lookup(&self) -> HashMap<&str, &Path> {
        let mut map = HashMap::new();
        for (id, path) in &self.ids {
            map.insert(id.as_str(), path.as_path());
            // Models sometimes echo the filename instead of the id.
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                map.entry(name).or_insert(path.as_path());
            }
        }
        map
    }
}

fn numeric_suffix(path: &Path) -> Option<&str> {
    let stem = path.file_stem()?.to_str()?;
    let (_, digits) = stem.rsplit_once('_')?;
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(digits)
}

const DEFAULT_INSTRUCTIONS: &str = "\
You are curating a training dataset of photo series: several photos taken in one \
session that can be played back as a very low frame rate video.

Decide whether ALL of the attached images belong to one coherent photo session: the \
same subject, location, lighting and outfit, with natural progression between poses. \
If any image clearly does not belong, or the images are unrelated, answer with \
is_series false.

If it is a series, order every image into the most natural sequence. Put the image \
that shows the main subject most clearly and closest to the camera first, and \
landscape or context shots without the subject last. Then write a 10-35 word caption \
in natural language describing what happens across the whole series.";

fn response_format(ids: &ImageIds) -> String {
    let first = ids.iter().next().map(|(id, _)| id).unwrap_or("_01");
    format!(
        r#"Respond with JSON only, in exactly this format:
{{
  "is_series": true,
  "images": [{{"path": "{first}", "order": 1}}],
  "excluded_images": [],
  "series_caption": "sequence of photos showing ...",
  "reason": "short justification",
  "confidence": 0.9
}}
"images" must list every image id exactly once when is_series is true."#
    )
}

/// Full prompt text: instructions, the id mapping and the response format.
pub fn build_prompt(custom_prompt: Option<&str>, ids: &ImageIds) -> String {
    let instructions = custom_prompt.unwrap_or(DEFAULT_INSTRUCTIONS);
    let mapping: Vec<String> = ids
        .iter()
        .enumerate()
        .map(|(i, (id, _))| format!("Image {}: ID {}", i + 1, id))
        .collect();
    let id_list: Vec<&str> = ids.iter().map(|(id, _)| id).collect();

    format!(
        "{}\n\nThe {} images are attached in this order:\n{}\n\nRefer to images ONLY by these ids: {}\n\n{}",
        instructions.trim(),
        ids.len(),
        mapping.join("\n"),
        id_list.join(", "),
        response_format(ids)
    )
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    is_series: Option<bool>,
    #[serde(default)]
    images: Vec<RawImage>,
    #[serde(default)]
    excluded_images: Vec<String>,
    #[serde(default)]
    series_caption: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    path: String,
    #[serde(default)]
    order: Option<i64>,
}

/// Turn the model's text into a verdict. Ids are mapped back to member
/// paths; unknown ids are kept verbatim so reconciliation rejects them.
pub fn parse_response(
    text: &str,
    ids: &ImageIds,
    tokens_used: Option<u64>,
) -> Result<VerificationVerdict, VerifyError> {
    let json = extract_json(text)
        .ok_or_else(|| VerifyError::MalformedResponse("no JSON object in response".to_string()))?;
    let raw: RawVerdict = serde_json::from_str(json)
        .map_err(|e| VerifyError::MalformedResponse(format!("invalid JSON: {}", e)))?;
    let is_series = raw
        .is_series
        .ok_or_else(|| VerifyError::MalformedResponse("missing is_series".to_string()))?;

    let ordered_paths = if raw.images.is_empty() {
        None
    } else {
        let lookup = ids.lookup();
        let mut images: Vec<(usize, RawImage)> = raw.images.into_iter().enumerate().collect();
        // Listed position breaks ties and orders entries without "order".
        images.sort_by_key(|(pos, img)| (img.order.unwrap_or(i64::MAX), *pos));
        Some(
            images
                .into_iter()
                .map(|(_, img)| {
                    let key = img.path.trim();
                    lookup
                        .get(key)
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| PathBuf::from(key))
                })
                .collect(),
        )
    };

    let caption = raw
        .series_caption
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    Ok(VerificationVerdict {
        is_series,
        caption,
        ordered_paths,
        reason: raw.reason,
        confidence: raw.confidence,
        excluded: raw.excluded_images,
        raw_response: Some(text.to_string()),
        tokens_used,
    })
}

/// Verifier backed by a [`VisionProvider`].
#[derive(Clone)]
pub struct LlmVerifier {
    provider: Arc<dyn VisionProvider>,
    max_image_dimension: u32,
    custom_prompt: Option<String>,
}

impl LlmVerifier {
    pub fn new(provider: Arc<dyn VisionProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            max_image_dimension: config.max_image_dimension,
            custom_prompt: config.custom_prompt.clone(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }
}

impl SeriesVerifier for LlmVerifier {
    fn verify(&self, candidate: &CandidateSeries) -> Result<VerificationVerdict, VerifyError> {
        let ids = ImageIds::for_candidate(candidate);

        let images = ids
            .iter()
            .map(|(_, path)| load_and_encode_image(path, self.max_image_dimension))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        let prompt = build_prompt(self.custom_prompt.as_deref(), &ids);
        tracing::debug!(
            series = candidate.base_name(),
            images = images.len(),
            provider = self.provider.provider_name(),
            "Requesting verification"
        );

        let completion = self.provider.complete(&prompt, &images)?;
        if let Some(tokens) = completion.tokens_used {
            tracing::debug!(series = candidate.base_name(), tokens, "Verifier usage");
        }

        parse_response(&completion.text, &ids, completion.tokens_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{Completion, EncodedImage};
    use crate::series::{CandidateOrder, FilenameKeyParser, SeriesGrouper, SizeBounds};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn candidate(dir: &Path, names: &[&str]) -> CandidateSeries {
        let listing: Vec<PathBuf> = names.iter().map(|n| dir.join(n)).collect();
        SeriesGrouper::new(
            FilenameKeyParser::new(&["jpg".to_string()]),
            SizeBounds { min: 1, max: 20 },
            CandidateOrder::Discovery,
        )
        .group(&listing)
        .remove(0)
    }

    fn jenny(dir: &Path) -> CandidateSeries {
        candidate(
            dir,
            &[
                "2025_08_28_15_09_21_jenny_vienna_01.jpg",
                "2025_08_28_15_09_21_jenny_vienna_02.jpg",
                "2025_08_28_15_09_21_jenny_vienna_03.jpg",
            ],
        )
    }

    #[test]
    fn test_ids_from_numeric_suffix() {
        let c = jenny(Path::new("pics"));
        let image_ids = ImageIds::for_candidate(&c);
        let ids: Vec<&str> = image_ids.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["_01", "_02", "_03"]);
    }

    #[test]
    fn test_duplicate_suffixes_get_fallback_ids() {
        let c = candidate(
            Path::new("pics"),
            &[
                "2025_01_01_00_00_00_a_x_1.jpg",
                "2025_01_01_00_00_00_a_x_01.jpg",
                "2025_01_01_00_00_00_a_x_1.JPG",
            ],
        );
        let image_ids = ImageIds::for_candidate(&c);
        let ids: Vec<&str> = image_ids.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["_1", "_01", "img_3"]);
    }

    #[test]
    fn test_parse_maps_ids_and_sorts_by_order() {
        let dir = Path::new("pics");
        let ids = ImageIds::for_candidate(&jenny(dir));
        let text = r#"```json
{
  "is_series": true,
  "images": [
    {"path": "_01", "order": 2},
    {"path": "_03", "order": 1},
    {"path": "_02", "order": 3}
  ],
  "excluded_images": [],
  "series_caption": "  woman walking along the canal  ",
  "reason": "same session",
  "confidence": 0.91
}
```"#;

        let verdict = parse_response(text, &ids, Some(1234)).unwrap();

        assert!(verdict.is_series);
        assert_eq!(verdict.caption.as_deref(), Some("woman walking along the canal"));
        assert_eq!(
            verdict.ordered_paths.unwrap(),
            vec![
                dir.join("2025_08_28_15_09_21_jenny_vienna_03.jpg"),
                dir.join("2025_08_28_15_09_21_jenny_vienna_01.jpg"),
                dir.join("2025_08_28_15_09_21_jenny_vienna_02.jpg"),
            ]
        );
        assert_eq!(verdict.confidence, Some(0.91));
        assert_eq!(verdict.tokens_used, Some(1234));
        assert!(verdict.raw_response.unwrap().contains("canal"));
    }

    #[test]
    fn test_parse_keeps_unknown_ids_and_accepts_filenames() {
        let dir = Path::new("pics");
        let ids = ImageIds::for_candidate(&jenny(dir));
        let text = r#"{"is_series": true, "images": [
            {"path": "2025_08_28_15_09_21_jenny_vienna_02.jpg", "order": 1},
            {"path": "unknown.jpg", "order": 2}
        ], "excluded_images": ["_01", "_03"]}"#;

        let verdict = parse_response(text, &ids, None).unwrap();

        assert_eq!(
            verdict.ordered_paths.unwrap(),
            vec![
                dir.join("2025_08_28_15_09_21_jenny_vienna_02.jpg"),
                PathBuf::from("unknown.jpg"),
            ]
        );
        assert_eq!(verdict.excluded, vec!["_01", "_03"]);
        assert_eq!(verdict.caption, None);
    }

    #[test]
    fn test_parse_rejection_without_images() {
        let ids = ImageIds::for_candidate(&jenny(Path::new("pics")));
        let verdict =
            parse_response(r#"{"is_series": false, "reason": "unrelated"}"#, &ids, None).unwrap();
        assert!(!verdict.is_series);
        assert_eq!(verdict.ordered_paths, None);
        assert_eq!(verdict.reason.as_deref(), Some("unrelated"));
    }

    #[test]
    fn test_parse_malformed() {
        let ids = ImageIds::for_candidate(&jenny(Path::new("pics")));
        for text in [
            "I cannot help with that.",
            r#"{"is_series": tru}"#,
            r#"{"images": []}"#,
        ] {
            assert!(
                matches!(
                    parse_response(text, &ids, None),
                    Err(VerifyError::MalformedResponse(_))
                ),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_prompt_lists_ids() {
        let ids = ImageIds::for_candidate(&jenny(Path::new("pics")));
        let prompt = build_prompt(Some("Custom instructions."), &ids);
        assert!(prompt.starts_with("Custom instructions."));
        assert!(prompt.contains("Image 2: ID _02"));
        assert!(prompt.contains("_01, _02, _03"));
    }

    struct ScriptedProvider {
        reply: Result<String, String>,
        seen_images: Mutex<usize>,
    }

    impl VisionProvider for ScriptedProvider {
        fn complete(
            &self,
            _prompt: &str,
            images: &[EncodedImage],
        ) -> Result<Completion, ProviderError> {
            *self.seen_images.lock().unwrap() = images.len();
            match &self.reply {
                Ok(text) => Ok(Completion {
                    text: text.clone(),
                    tokens_used: Some(42),
                }),
                Err(msg) => Err(ProviderError::Request(msg.clone())),
            }
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn write_images(dir: &Path, c: &CandidateSeries) {
        for path in c.paths() {
            image::RgbImage::from_pixel(8, 8, image::Rgb([30, 60, 90]))
                .save_with_format(path, image::ImageFormat::Jpeg)
                .unwrap();
        }
        assert!(dir.exists());
    }

    #[test]
    fn test_llm_verifier_round_trip() {
        let dir = tempdir().unwrap();
        let c = jenny(dir.path());
        write_images(dir.path(), &c);

        let reply = r#"{
            "is_series": true,
            "images": [
                {"path": "_02", "order": 1},
                {"path": "_01", "order": 2},
                {"path": "_03", "order": 3}
            ],
            "series_caption": "sequence of photos"
        }"#;
        let provider = Arc::new(ScriptedProvider {
            reply: Ok(reply.to_string()),
            seen_images: Mutex::new(0),
        });
        let verifier = LlmVerifier::new(provider.clone(), &LlmConfig::default());

        let verdict = verifier.verify(&c).unwrap();

        assert_eq!(*provider.seen_images.lock().unwrap(), 3);
        assert_eq!(verdict.tokens_used, Some(42));
        let ordered = verdict.ordered_paths.unwrap();
        assert_eq!(ordered[0], dir.path().join("2025_08_28_15_09_21_jenny_vienna_02.jpg"));
    }

    #[test]
    fn test_llm_verifier_errors() {
        let dir = tempdir().unwrap();
        let c = jenny(dir.path());

        let provider = Arc::new(ScriptedProvider {
            reply: Ok("{}".to_string()),
            seen_images: Mutex::new(0),
        });
        let verifier = LlmVerifier::new(provider, &LlmConfig::default());
        // Files were never written.
        assert!(matches!(verifier.verify(&c), Err(VerifyError::Unavailable(_))));

        write_images(dir.path(), &c);
        let offline = LlmVerifier::new(
            Arc::new(ScriptedProvider {
                reply: Err("connection refused".to_string()),
                seen_images: Mutex::new(0),
            }),
            &LlmConfig::default(),
        );
        assert!(matches!(offline.verify(&c), Err(VerifyError::Unavailable(_))));
    }
}
