//! Merging an external verdict into a persistable series record.
//!
//! The verifier's answer is untrusted data. Its proposed ordering is only
//! used when it is an exact permutation of the candidate's members; anything
//! else degrades to scan order. Accepted series always leave here with a
//! caption and a contiguous `1..=N` ordering.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::CandidateSeries;

/// Phrases that already mark a caption as describing a sequence.
const SEQUENCE_TERMS: &[&str] = &[
    "sequence of",
    "series of",
    "photo session",
    "consecutive shots",
    "multiple frames",
    "progression of",
];

const SUBJECT_PREFIXES: &[&str] = &["woman", "man", "person", "model", "influencer"];

/// The verifier's decision for one candidate, as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub is_series: bool,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub ordered_paths: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Image ids the verifier chose to leave out of its ordering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Why a proposed ordering was not usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderingFallback {
    Missing,
    WrongLength { expected: usize, got: usize },
    Duplicate { path: PathBuf },
    Foreign { path: PathBuf },
}

/// Where the stored image order came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OrderingSource {
    /// The verifier's permutation, validated.
    Verifier,
    /// Scan order, because the verifier's ordering was unusable.
    ScanOrder { fallback: OrderingFallback },
    /// Scan order of a rejected candidate, kept for audit.
    Rejected,
}

impl OrderingSource {
    /// Column value stored alongside the series row.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingSource::Verifier => "verifier",
            OrderingSource::ScanOrder { .. } => "scan_order_fallback",
            OrderingSource::Rejected => "rejected",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, OrderingSource::ScanOrder { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionSource {
    Verifier,
    /// Verifier caption with a sequence phrase prepended.
    Normalized,
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedImage {
    pub path: PathBuf,
    /// 1-based.
    pub order_in_series: u32,
}

/// Result of reconciliation; the unit the store persists.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedSeries {
    /// Assigned by the store.
    pub id: Option<i64>,
    pub base_name: String,
    pub directory: String,
    pub is_series: bool,
    pub caption: Option<String>,
    /// Audit envelope with the verdict serialized verbatim.
    pub raw_verdict: String,
    pub image_count: usize,
    pub ordering: OrderingSource,
    pub images: Vec<VerifiedImage>,
}

impl VerifiedSeries {
    pub fn ordered_paths(&self) -> impl Iterator<Item = &Path> {
        self.images.iter().map(|i| i.path.as_path())
    }
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    verdict: &'a VerificationVerdict,
    ordering: &'a OrderingSource,
    caption_source: CaptionSource,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub fallback_caption: String,
    pub enforce_sequence_phrasing: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fallback_caption: "sequence of photos from a single photo session".to_string(),
            enforce_sequence_phrasing: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn reconcile(
        &self,
        candidate: &CandidateSeries,
        verdict: &VerificationVerdict,
    ) -> VerifiedSeries {
        let scan_order: Vec<PathBuf> = candidate.paths().map(Path::to_path_buf).collect();

        let (order, ordering, caption, caption_source) = if verdict.is_series {
            let proposed = verdict.ordered_paths.as_deref();
            let (order, ordering) = match validate_ordering(&scan_order, proposed) {
                Ok(order) => (order, OrderingSource::Verifier),
                Err(fallback) => {
                    tracing::warn!(
                        series = candidate.base_name(),
                        ?fallback,
                        "Verifier ordering rejected, using scan order"
                    );
                    (scan_order, OrderingSource::ScanOrder { fallback })
                }
            };
            let (caption, source) = self.accepted_caption(verdict.caption.as_deref());
            (order, ordering, Some(caption), source)
        } else {
            (scan_order, OrderingSource::Rejected, None, CaptionSource::None)
        };

        let images = order
            .into_iter()
            .enumerate()
            .map(|(i, path)| VerifiedImage {
                path,
                order_in_series: (i + 1) as u32,
            })
            .collect::<Vec<_>>();

        let raw_verdict = audit_payload(verdict, &ordering, caption_source);

        VerifiedSeries {
            id: None,
            base_name: candidate.base_name().to_string(),
            directory: candidate.directory(),
            is_series: verdict.is_series,
            caption,
            raw_verdict,
            image_count: images.len(),
            ordering,
            images,
        }
    }

    fn accepted_caption(&self, caption: Option<&str>) -> (String, CaptionSource) {
        let trimmed = caption.map(str::trim).unwrap_or_default();
        if trimmed.is_empty() {
            return (self.config.fallback_caption.clone(), CaptionSource::Fallback);
        }
        if !self.config.enforce_sequence_phrasing {
            return (trimmed.to_string(), CaptionSource::Verifier);
        }
        match with_sequence_phrase(trimmed) {
            Some(normalized) => (normalized, CaptionSource::Normalized),
            None => (trimmed.to_string(), CaptionSource::Verifier),
        }
    }
}

/// Check that `proposed` is exactly a permutation of `members`.
fn validate_ordering(
    members: &[PathBuf],
    proposed: Option<&[PathBuf]>,
) -> Result<Vec<PathBuf>, OrderingFallback> {
    let proposed = proposed.ok_or(OrderingFallback::Missing)?;

    let known: HashSet<&Path> = members.iter().map(PathBuf::as_path).collect();
    let mut seen: HashSet<&Path> = HashSet::with_capacity(proposed.len());

    for path in proposed {
        if !known.contains(path.as_path()) {
            return Err(OrderingFallback::Foreign { path: path.clone() });
        }
        if !seen.insert(path.as_path()) {
            return Err(OrderingFallback::Duplicate { path: path.clone() });
        }
    }

    if proposed.len() != members.len() {
        return Err(OrderingFallback::WrongLength {
            expected: members.len(),
            got: proposed.len(),
        });
    }

    Ok(proposed.to_vec())
}

/// Prefix a caption that lacks any sequence wording. Returns `None` when the
/// caption already reads as a sequence.
fn with_sequence_phrase(caption: &str) -> Option<String> {
    let lower = caption.to_lowercase();
    if SEQUENCE_TERMS.iter().any(|t| lower.contains(t)) {
        return None;
    }
    if SUBJECT_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        Some(format!("sequence of photos showing {}", caption))
    } else {
        Some(format!("photo session capturing {}", caption))
    }
}

fn audit_payload(
    verdict: &VerificationVerdict,
    ordering: &OrderingSource,
    caption_source: CaptionSource,
) -> String {
    let record = AuditRecord {
        verdict,
        ordering,
        caption_source,
    };
    match serde_json::to_string(&record) {
        Ok(json) => json,
        Err(e) => {
            // Only reachable with non-UTF-8 paths in the verdict.
            tracing::warn!(error = %e, "Could not serialize verdict for audit");
            serde_json::json!({
                "audit_error": e.to_string(),
                "is_series": verdict.is_series,
                "ordering": ordering.as_str(),
            })
            .to_string()
        }
    }
}
