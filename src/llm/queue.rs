use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::verifier::{SeriesVerifier, VerifyError};
use crate::db::SeriesStore;
use crate::series::{CandidateSeries, Reconciler, VerificationVerdict};
use crate::tasks::{TaskProgress, TaskUpdate};

/// Outcome counts for one batch of candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub candidates: usize,
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Verifier failures; nothing stored, retried next run.
    pub deferred: usize,
    pub fallback_ordered: usize,
    pub cancelled: bool,
}

/// Verifies candidates and persists the reconciled results.
///
/// Verifier calls may run on a bounded rayon pool; reconciliation and store
/// writes always happen on the calling thread, one candidate at a time.
pub struct VerificationQueue {
    verifier: Arc<dyn SeriesVerifier>,
    reconciler: Reconciler,
    workers: usize,
    request_delay: Duration,
}

impl VerificationQueue {
    pub fn new(verifier: Arc<dyn SeriesVerifier>, reconciler: Reconciler) -> Self {
        Self {
            verifier,
            reconciler,
            workers: 1,
            request_delay: Duration::ZERO,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Process every candidate, stopping early when `cancel_flag` is set.
    /// A store failure aborts the batch and is returned.
    pub fn process_all_cancellable(
        &self,
        candidates: &[CandidateSeries],
        store: &dyn SeriesStore,
        tx: Option<&mpsc::Sender<TaskUpdate>>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Result<AnalysisSummary> {
        let mut summary = AnalysisSummary {
            candidates: candidates.len(),
            ..Default::default()
        };
        send(tx, TaskUpdate::Started {
            total: candidates.len(),
        });

        let result = if self.workers <= 1 {
            self.run_sequential(candidates, store, tx, &cancel_flag, &mut summary)
        } else {
            self.run_parallel(candidates, store, tx, &cancel_flag, &mut summary)
        };

        match &result {
            Err(e) => send(tx, TaskUpdate::Failed {
                error: e.to_string(),
            }),
            Ok(()) if summary.cancelled => send(tx, TaskUpdate::Cancelled),
            Ok(()) => send(tx, TaskUpdate::Completed {
                message: format!(
                    "{} processed: {} accepted, {} rejected, {} deferred",
                    summary.processed, summary.accepted, summary.rejected, summary.deferred
                ),
            }),
        }

        result.map(|()| summary)
    }

    fn run_sequential(
        &self,
        candidates: &[CandidateSeries],
        store: &dyn SeriesStore,
        tx: Option<&mpsc::Sender<TaskUpdate>>,
        cancel_flag: &AtomicBool,
        summary: &mut AnalysisSummary,
    ) -> Result<()> {
        for candidate in candidates {
            if cancel_flag.load(Ordering::SeqCst) {
                summary.cancelled = true;
                return Ok(());
            }
            let outcome = self.verify_one(candidate);
            self.record(candidate, outcome, store, tx, summary)?;
        }
        Ok(())
    }

    fn run_parallel(
        &self,
        candidates: &[CandidateSeries],
        store: &dyn SeriesStore,
        tx: Option<&mpsc::Sender<TaskUpdate>>,
        cancel_flag: &AtomicBool,
        summary: &mut AnalysisSummary,
    ) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("verifier-{}", i))
            .build()
            .map_err(|e| anyhow!("failed to start verifier pool: {}", e))?;

        let (result_tx, result_rx) =
            mpsc::channel::<(usize, Result<VerificationVerdict, VerifyError>)>();
        // Set on a store failure; the caller's flag is left alone.
        let abort = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                pool.install(|| {
                    candidates
                        .par_iter()
                        .enumerate()
                        .for_each_with(result_tx, |results, (index, candidate)| {
                            let stopped = cancel_flag.load(Ordering::SeqCst)
                                || abort.load(Ordering::SeqCst);
                            if stopped {
                                return;
                            }
                            let _ = results.send((index, self.verify_one(candidate)));
                        });
                });
            });

            for (index, outcome) in result_rx {
                if cancel_flag.load(Ordering::SeqCst) {
                    summary.cancelled = true;
                    break;
                }
                if let Err(e) = self.record(&candidates[index], outcome, store, tx, summary) {
                    abort.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    fn verify_one(&self, candidate: &CandidateSeries) -> Result<VerificationVerdict, VerifyError> {
        let outcome = self.verifier.verify(candidate);
        if !self.request_delay.is_zero() {
            std::thread::sleep(self.request_delay);
        }
        outcome
    }

    fn record(
        &self,
        candidate: &CandidateSeries,
        outcome: Result<VerificationVerdict, VerifyError>,
        store: &dyn SeriesStore,
        tx: Option<&mpsc::Sender<TaskUpdate>>,
        summary: &mut AnalysisSummary,
    ) -> Result<()> {
        summary.processed += 1;
        let progress = TaskProgress::new(summary.processed, summary.candidates)
            .with_item(candidate.base_name());

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(e) => {
                summary.deferred += 1;
                tracing::warn!(series = candidate.base_name(), error = %e, "Verification deferred");
                send(tx, TaskUpdate::Progress(progress.with_message("deferred")));
                return Ok(());
            }
        };

        let verified = self.reconciler.reconcile(candidate, &verdict);
        store.upsert(&verified)?;

        let label = if verified.is_series {
            summary.accepted += 1;
            if verified.ordering.is_fallback() {
                summary.fallback_ordered += 1;
            }
            "accepted"
        } else {
            summary.rejected += 1;
            "rejected"
        };

        tracing::info!(
            series = %verified.base_name,
            images = verified.image_count,
            verdict = label,
            ordering = verified.ordering.as_str(),
            "Stored verdict"
        );
        send(tx, TaskUpdate::Progress(progress.with_message(label)));
        Ok(())
    }
}

fn send(tx: Option<&mpsc::Sender<TaskUpdate>>, update: TaskUpdate) {
    if let Some(tx) = tx {
        let _ = tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SeriesFilter, SeriesId, StoreError};
    use crate::series::VerifiedSeries;
    use crate::series::{CandidateOrder, FilenameKeyParser, SeriesGrouper, SizeBounds};
    use std::path::PathBuf;

    /// Accepts owners starting with "ok", rejects "no", fails the rest.
    struct OwnerVerifier;

    impl SeriesVerifier for OwnerVerifier {
        fn verify(&self, candidate: &CandidateSeries) -> Result<VerificationVerdict, VerifyError> {
            let owner = &candidate.key().owner;
            if owner.starts_with("ok") {
                let mut order: Vec<PathBuf> =
                    candidate.paths().map(|p| p.to_path_buf()).collect();
                order.reverse();
                Ok(VerificationVerdict {
                    is_series: true,
                    caption: Some("sequence of photos".to_string()),
                    ordered_paths: Some(order),
                    ..Default::default()
                })
            } else if owner.starts_with("no") {
                Ok(VerificationVerdict::default())
            } else {
                Err(VerifyError::Unavailable("offline".to_string()))
            }
        }
    }

    fn candidates(owners: &[&str]) -> Vec<CandidateSeries> {
        let listing: Vec<PathBuf> = owners
            .iter()
            .flat_map(|o| {
                (1..=3).map(move |i| {
                    PathBuf::from(format!("p/2025_01_01_00_00_00_{}_c_{:02}.jpg", o, i))
                })
            })
            .collect();
        SeriesGrouper::new(
            FilenameKeyParser::new(&["jpg".to_string()]),
            SizeBounds { min: 2, max: 10 },
            CandidateOrder::Discovery,
        )
        .group(&listing)
    }

    /// Database that refuses to store one base name.
    struct FailingStore {
        db: Database,
        refuse: String,
    }

    impl SeriesStore for FailingStore {
        fn upsert(&self, series: &VerifiedSeries) -> Result<SeriesId, StoreError> {
            if series.base_name == self.refuse {
                return Err(StoreError::UpsertFailed {
                    base_name: series.base_name.clone(),
                    source: rusqlite::Error::InvalidQuery,
                });
            }
            self.db.upsert(series)
        }

        fn list(&self, filter: SeriesFilter) -> Result<Vec<VerifiedSeries>, StoreError> {
            self.db.list(filter)
        }

        fn contains(&self, base_name: &str) -> Result<bool, StoreError> {
            self.db.contains(base_name)
        }
    }

    fn store() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_sequential_counts_and_persists() {
        let db = store();
        let queue = VerificationQueue::new(Arc::new(OwnerVerifier), Reconciler::default());
        let (tx, rx) = mpsc::channel();

        let summary = queue
            .process_all_cancellable(
                &candidates(&["ok1", "no1", "down", "ok2"]),
                &db,
                Some(&tx),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.deferred, 1);
        assert!(!summary.cancelled);
        assert_eq!(db.list(SeriesFilter::Any).unwrap().len(), 3);
        assert!(!db.contains("2025_01_01_00_00_00_down_c").unwrap());

        drop(tx);
        let updates: Vec<TaskUpdate> = rx.iter().collect();
        assert_eq!(updates.first(), Some(&TaskUpdate::Started { total: 4 }));
        assert!(matches!(updates.last(), Some(TaskUpdate::Completed { .. })));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let db = store();
        let queue = VerificationQueue::new(Arc::new(OwnerVerifier), Reconciler::default())
            .with_workers(3);
        let owners = ["ok1", "no1", "down", "ok2", "ok3", "no2", "ok4"];

        let summary = queue
            .process_all_cancellable(
                &candidates(&owners),
                &db,
                None,
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();

        assert_eq!(summary.processed, 7);
        assert_eq!(summary.accepted, 4);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.deferred, 1);
        assert_eq!(db.list(SeriesFilter::Accepted).unwrap().len(), 4);
    }

    #[test]
    fn test_cancelled_before_start_stores_nothing() {
        let db = store();
        let queue = VerificationQueue::new(Arc::new(OwnerVerifier), Reconciler::default());
        let (tx, rx) = mpsc::channel();

        let summary = queue
            .process_all_cancellable(
                &candidates(&["ok1", "ok2"]),
                &db,
                Some(&tx),
                Arc::new(AtomicBool::new(true)),
            )
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert!(db.list(SeriesFilter::Any).unwrap().is_empty());
        drop(tx);
        assert_eq!(rx.iter().last(), Some(TaskUpdate::Cancelled));
    }

    #[test]
    fn test_parallel_store_failure_aborts_run() {
        let store = FailingStore {
            db: store(),
            refuse: "2025_01_01_00_00_00_ok2_c".to_string(),
        };
        let queue = VerificationQueue::new(Arc::new(OwnerVerifier), Reconciler::default())
            .with_workers(3);
        let owners = ["ok1", "ok2", "ok3", "no1", "ok4", "no2"];
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let err = queue
            .process_all_cancellable(&candidates(&owners), &store, Some(&tx), cancel.clone())
            .unwrap_err();

        assert!(err.to_string().contains("ok2"));
        assert!(!cancel.load(Ordering::SeqCst));
        assert!(!store.db.contains("2025_01_01_00_00_00_ok2_c").unwrap());
        let stored = store.db.list(SeriesFilter::Any).unwrap();
        assert!(stored.len() < owners.len());

        drop(tx);
        assert!(matches!(rx.iter().last(), Some(TaskUpdate::Failed { .. })));
    }
}
