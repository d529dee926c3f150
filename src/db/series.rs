//! Series persistence on SQLite.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use super::{Database, SeriesFilter, SeriesId, SeriesStore, StoreError};
use crate::series::{OrderingFallback, OrderingSource, VerifiedImage, VerifiedSeries};

/// Listing row without images.
#[derive(Debug, Clone)]
pub struct SeriesSummary {
    pub id: i64,
    pub base_name: String,
    pub is_series: bool,
    pub caption: Option<String>,
    pub image_count: i64,
    pub ordering_source: String,
    pub updated_at: String,
}

/// Outcome of removing references to files that no longer exist.
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub checked: usize,
    pub missing: Vec<String>,
    /// Series that lost images but kept at least one.
    pub series_renumbered: usize,
    pub empty_series_removed: usize,
}

#[derive(Deserialize)]
struct StoredAudit {
    ordering: OrderingSource,
}

impl SeriesStore for Database {
    fn upsert(&self, series: &VerifiedSeries) -> Result<SeriesId, StoreError> {
        self.upsert_in_transaction(series)
            .map_err(|source| StoreError::UpsertFailed {
                base_name: series.base_name.clone(),
                source,
            })
    }

    fn list(&self, filter: SeriesFilter) -> Result<Vec<VerifiedSeries>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, base_name, directory, is_series, caption, raw_verdict, image_count, ordering_source
            FROM series
            WHERE {}
            ORDER BY image_count DESC, base_name ASC
            "#,
            filter.sql_clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_series)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for mut series in rows {
            self.attach_images(&mut series)?;
            out.push(series);
        }
        Ok(out)
    }

    fn contains(&self, base_name: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM series WHERE base_name = ?",
                [base_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl Database {
    fn upsert_in_transaction(&self, series: &VerifiedSeries) -> rusqlite::Result<SeriesId> {
        // Dropping the transaction without commit rolls everything back.
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO series (
                base_name, directory, is_series, caption, raw_verdict, image_count, ordering_source
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(base_name) DO UPDATE SET
                directory = excluded.directory,
                is_series = excluded.is_series,
                caption = excluded.caption,
                raw_verdict = excluded.raw_verdict,
                image_count = excluded.image_count,
                ordering_source = excluded.ordering_source,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                series.base_name,
                series.directory,
                series.is_series,
                series.caption,
                series.raw_verdict,
                series.image_count as i64,
                series.ordering.as_str(),
            ],
        )?;

        let id: i64 = tx.query_row(
            "SELECT id FROM series WHERE base_name = ?",
            [&series.base_name],
            |row| row.get(0),
        )?;

        tx.execute("DELETE FROM series_images WHERE series_id = ?", [id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO series_images (series_id, image_path, order_in_series) VALUES (?, ?, ?)",
            )?;
            for image in &series.images {
                stmt.execute(params![
                    id,
                    image.path.to_string_lossy().to_string(),
                    image.order_in_series
                ])?;
            }
        }

        tx.commit()?;
        Ok(SeriesId(id))
    }

    fn attach_images(&self, series: &mut VerifiedSeries) -> Result<(), StoreError> {
        let id = series.id.ok_or_else(|| StoreError::Corrupt {
            base_name: series.base_name.clone(),
            message: "row without id".to_string(),
        })?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT image_path, order_in_series
            FROM series_images
            WHERE series_id = ?
            ORDER BY order_in_series ASC
            "#,
        )?;
        series.images = stmt
            .query_map([id], |row| {
                Ok(VerifiedImage {
                    path: PathBuf::from(row.get::<_, String>(0)?),
                    order_in_series: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }

    /// A single stored series with its images.
    pub fn get_series(&self, base_name: &str) -> Result<Option<VerifiedSeries>, StoreError> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, base_name, directory, is_series, caption, raw_verdict, image_count, ordering_source
                FROM series
                WHERE base_name = ?
                "#,
                [base_name],
                row_to_series,
            )
            .optional()?;

        match row {
            Some(mut series) => {
                self.attach_images(&mut series)?;
                Ok(Some(series))
            }
            None => Ok(None),
        }
    }

    pub fn stored_base_names(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT base_name FROM series")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }

    pub fn list_summaries(&self, filter: SeriesFilter, limit: usize) -> Result<Vec<SeriesSummary>> {
        let sql = format!(
            r#"
            SELECT id, base_name, is_series, caption, image_count, ordering_source, updated_at
            FROM series
            WHERE {}
            ORDER BY updated_at DESC, id DESC
            LIMIT ?
            "#,
            filter.sql_clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(SeriesSummary {
                    id: row.get(0)?,
                    base_name: row.get(1)?,
                    is_series: row.get(2)?,
                    caption: row.get(3)?,
                    image_count: row.get(4)?,
                    ordering_source: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete a series and its images. Returns the number of image rows removed.
    pub fn remove_series(&self, base_name: &str) -> Result<Option<usize>> {
        let tx = self.conn.unchecked_transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM series WHERE base_name = ?",
                [base_name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };

        let images = tx.execute("DELETE FROM series_images WHERE series_id = ?", [id])?;
        tx.execute("DELETE FROM series WHERE id = ?", [id])?;
        tx.commit()?;
        Ok(Some(images))
    }

    /// Drop image rows whose files are gone, then series left without images.
    pub fn clean_missing_images(&self) -> Result<CleanReport> {
        self.clean_missing_images_with(|p| p.exists())
    }

    pub(crate) fn clean_missing_images_with<F>(&self, exists: F) -> Result<CleanReport>
    where
        F: Fn(&Path) -> bool,
    {
        let rows: Vec<(i64, i64, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, series_id, image_path FROM series_images")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut report = CleanReport {
            checked: rows.len(),
            ..Default::default()
        };
        let mut touched = BTreeSet::new();

        let tx = self.conn.unchecked_transaction()?;
        for (id, series_id, path) in rows {
            if !exists(Path::new(&path)) {
                tracing::info!(path = %path, "Removing reference to missing image");
                tx.execute("DELETE FROM series_images WHERE id = ?", [id])?;
                report.missing.push(path);
                touched.insert(series_id);
            }
        }
        if !report.missing.is_empty() {
            report.empty_series_removed = tx.execute(
                "DELETE FROM series WHERE id NOT IN (SELECT DISTINCT series_id FROM series_images)",
                [],
            )?;
        }
        for series_id in touched {
            if renumber_images(&tx, series_id)? > 0 {
                report.series_renumbered += 1;
            }
        }
        tx.commit()?;

        Ok(report)
    }
}

/// Close gaps left by deleted rows so `order_in_series` is 1..N again and
/// `image_count` matches. Returns the surviving image count.
fn renumber_images(tx: &rusqlite::Transaction, series_id: i64) -> rusqlite::Result<usize> {
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM series_images WHERE series_id = ? ORDER BY order_in_series ASC",
        )?;
        let ids = stmt
            .query_map([series_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };

    // Ascending order only ever moves a row to a slot already vacated.
    for (position, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE series_images SET order_in_series = ? WHERE id = ?",
            params![(position + 1) as i64, id],
        )?;
    }
    if !ids.is_empty() {
        tx.execute(
            "UPDATE series SET image_count = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![ids.len() as i64, series_id],
        )?;
    }
    Ok(ids.len())
}

fn row_to_series(row: &rusqlite::Row) -> rusqlite::Result<VerifiedSeries> {
    let raw_verdict: String = row.get(5)?;
    let ordering_column: String = row.get(7)?;
    let ordering = serde_json::from_str::<StoredAudit>(&raw_verdict)
        .map(|audit| audit.ordering)
        .unwrap_or_else(|_| ordering_from_column(&ordering_column));

    Ok(VerifiedSeries {
        id: Some(row.get(0)?),
        base_name: row.get(1)?,
        directory: row.get(2)?,
        is_series: row.get(3)?,
        caption: row.get(4)?,
        raw_verdict,
        image_count: row.get::<_, i64>(6)? as usize,
        ordering,
        images: Vec::new(),
    })
}

/// Best effort when the audit payload is unreadable; the fallback reason is lost.
fn ordering_from_column(value: &str) -> OrderingSource {
    match value {
        "verifier" => OrderingSource::Verifier,
        "rejected" => OrderingSource::Rejected,
        _ => OrderingSource::ScanOrder {
            fallback: OrderingFallback::Missing,
        },
    }
}
