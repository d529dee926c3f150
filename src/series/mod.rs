//! Candidate series: parsing, grouping and verdict reconciliation.
//!
//! Nothing in this module performs I/O. Paths go in, [`CandidateSeries`]
//! come out of the grouper, and the reconciler turns a candidate plus an
//! untrusted verdict into a [`VerifiedSeries`] ready for the store.

pub mod filename;
pub mod grouper;
pub mod reconcile;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use filename::{FilenameKeyParser, SequenceIndex, SeriesKey, UnparsableFilename};
pub use grouper::{GroupingStats, SeriesGrouper};
pub use reconcile::{
    CaptionSource, OrderingFallback, OrderingSource, Reconciler, VerificationVerdict,
    VerifiedImage, VerifiedSeries,
};

/// Inclusive bounds on the number of images in a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeBounds {
    pub min: usize,
    pub max: usize,
}

impl SizeBounds {
    pub fn contains(&self, count: usize) -> bool {
        self.min <= count && count <= self.max
    }
}

/// Sequence in which the grouper yields candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidateOrder {
    /// Order in which each key was first seen in the listing.
    Discovery,
    /// Descending member count; ties keep discovery order.
    #[default]
    LargestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMember {
    pub path: PathBuf,
    pub sequence: SequenceIndex,
}

/// A group of files sharing one [`SeriesKey`], not yet verified.
///
/// Only the grouper constructs these, so the member list is always sorted
/// by sequence index and within the configured size bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSeries {
    key: SeriesKey,
    base_name: String,
    members: Vec<SeriesMember>,
}

impl CandidateSeries {
    pub(crate) fn new(key: SeriesKey, members: Vec<SeriesMember>) -> Self {
        let base_name = key.base_name();
        Self {
            key,
            base_name,
            members,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn members(&self) -> &[SeriesMember] {
        &self.members
    }

    pub fn image_count(&self) -> usize {
        self.members.len()
    }

    /// Member paths in scan (sequence index) order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.members.iter().map(|m| m.path.as_path())
    }

    /// Parent directory of the first member, recorded for audit.
    pub fn directory(&self) -> String {
        self.members
            .first()
            .and_then(|m| m.path.parent())
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
