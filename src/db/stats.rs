use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use super::Database;

/// Aggregate view of everything stored.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeriesStats {
    pub total: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub image_rows: i64,
    /// Mean `image_count` over accepted series.
    pub mean_accepted_size: Option<f64>,
    /// `(image_count, number of accepted series)` ascending by size.
    pub size_distribution: Vec<(i64, i64)>,
    /// Accepted series stored in scan order because the verifier's ordering was unusable.
    pub fallback_ordered: i64,
}

/// Accepted series entry for the largest-series listing.
#[derive(Debug, Clone, Serialize)]
pub struct TopSeries {
    pub base_name: String,
    pub caption: Option<String>,
    pub image_count: i64,
}

/// One row of analysis history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisRun {
    pub directory: String,
    pub total_images: i64,
    pub total_series: i64,
    pub accepted: i64,
    pub deferred: i64,
}

impl Database {
    pub fn get_stats(&self) -> Result<SeriesStats> {
        let (total, accepted, fallback_ordered, mean_accepted_size): (i64, i64, i64, Option<f64>) =
            self.conn.query_row(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN is_series = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ordering_source = 'scan_order_fallback' THEN 1 ELSE 0 END), 0),
                    AVG(CASE WHEN is_series = 1 THEN image_count END)
                FROM series
                "#,
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let image_rows: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM series_images", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT image_count, COUNT(*)
            FROM series
            WHERE is_series = 1
            GROUP BY image_count
            ORDER BY image_count
            "#,
        )?;
        let size_distribution = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(SeriesStats {
            total,
            accepted,
            rejected: total - accepted,
            image_rows,
            mean_accepted_size,
            size_distribution,
            fallback_ordered,
        })
    }

    /// The `limit` largest accepted series.
    pub fn top_series(&self, limit: usize) -> Result<Vec<TopSeries>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT base_name, caption, image_count
            FROM series
            WHERE is_series = 1
            ORDER BY image_count DESC, base_name ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(TopSeries {
                    base_name: row.get(0)?,
                    caption: row.get(1)?,
                    image_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn log_analysis(&self, run: &AnalysisRun) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO analysis_log (directory, total_images, total_series, accepted, deferred)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                run.directory,
                run.total_images,
                run.total_series,
                run.accepted,
                run.deferred
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent runs first.
    pub fn recent_analyses(&self, limit: usize) -> Result<Vec<AnalysisRun>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT directory, total_images, total_series, accepted, deferred
            FROM analysis_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(AnalysisRun {
                    directory: row.get(0)?,
                    total_images: row.get(1)?,
                    total_series: row.get(2)?,
                    accepted: row.get(3)?,
                    deferred: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
