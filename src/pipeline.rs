//! One analysis run: scan, select, verify, store, log.

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use crate::db::{AnalysisRun, Database};
use crate::llm::{AnalysisSummary, VerificationQueue};
use crate::scanner::Scanner;
use crate::series::{CandidateSeries, GroupingStats};
use crate::tasks::TaskUpdate;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Process at most this many candidates.
    pub limit: Option<usize>,
    /// Verify candidates that already have a stored verdict.
    pub reanalyze: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub total_images: usize,
    pub grouping: GroupingStats,
    pub skipped_existing: usize,
    pub summary: AnalysisSummary,
}

/// Drop candidates whose base name is in `existing` (unless reanalyzing),
/// then apply the limit. Returns the kept candidates and the skip count.
pub fn select_candidates(
    candidates: Vec<CandidateSeries>,
    existing: &HashSet<String>,
    options: AnalyzeOptions,
) -> (Vec<CandidateSeries>, usize) {
    let before = candidates.len();
    let mut selected: Vec<CandidateSeries> = if options.reanalyze {
        candidates
    } else {
        candidates
            .into_iter()
            .filter(|c| !existing.contains(c.base_name()))
            .collect()
    };
    let skipped = before - selected.len();

    if let Some(limit) = options.limit {
        selected.truncate(limit);
    }
    (selected, skipped)
}

/// Candidates `analyze` would send to the verifier, without calling it.
pub fn plan(
    db: &Database,
    scanner: &Scanner,
    directory: &Path,
    options: AnalyzeOptions,
) -> Result<(Vec<CandidateSeries>, usize)> {
    let scan = scanner.scan_directory(directory)?;
    let existing = db.stored_base_names()?;
    Ok(select_candidates(scan.candidates, &existing, options))
}

pub fn analyze_directory(
    db: &Database,
    scanner: &Scanner,
    queue: &VerificationQueue,
    directory: &Path,
    options: AnalyzeOptions,
    tx: Option<&mpsc::Sender<TaskUpdate>>,
    cancel_flag: Arc<AtomicBool>,
) -> Result<AnalysisReport> {
    let scan = scanner.scan_directory(directory)?;
    let existing = db.stored_base_names()?;
    let (candidates, skipped_existing) = select_candidates(scan.candidates, &existing, options);

    if skipped_existing > 0 {
        tracing::info!(skipped = skipped_existing, "Skipping already analyzed series");
    }

    let summary = queue.process_all_cancellable(&candidates, db, tx, cancel_flag)?;

    db.log_analysis(&AnalysisRun {
        directory: directory.to_string_lossy().to_string(),
        total_images: scan.total_images as i64,
        total_series: candidates.len() as i64,
        accepted: summary.accepted as i64,
        deferred: summary.deferred as i64,
    })?;

    Ok(AnalysisReport {
        total_images: scan.total_images,
        grouping: scan.stats,
        skipped_existing,
        summary,
    })
}
