mod schema;
pub mod series;
pub mod stats;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

use crate::series::VerifiedSeries;

pub use schema::SCHEMA;
pub use series::{CleanReport, SeriesSummary};
pub use stats::{AnalysisRun, SeriesStats, TopSeries};

/// Row id of a persisted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesId(pub i64);

/// Acceptance filter for listing series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesFilter {
    #[default]
    Any,
    Accepted,
    Rejected,
}

impl SeriesFilter {
    fn sql_clause(&self) -> &'static str {
        match self {
            SeriesFilter::Any => "1 = 1",
            SeriesFilter::Accepted => "is_series = 1",
            SeriesFilter::Rejected => "is_series = 0",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to store series {base_name}: {source}")]
    UpsertFailed {
        base_name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("corrupt series row {base_name}: {message}")]
    Corrupt { base_name: String, message: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistence contract the analysis pipeline relies on.
pub trait SeriesStore {
    /// Replace the verdict and full image set stored under the series'
    /// base name. Either everything is written or nothing is.
    fn upsert(&self, series: &VerifiedSeries) -> Result<SeriesId, StoreError>;

    /// Stored series with their ordered images, largest first.
    fn list(&self, filter: SeriesFilter) -> Result<Vec<VerifiedSeries>, StoreError>;

    /// Whether a verdict is already stored for `base_name`.
    fn contains(&self, base_name: &str) -> Result<bool, StoreError>;
}

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Self { conn })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}
