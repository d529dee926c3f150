//! Dataset export and raw database dumps.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::db::{Database, SeriesFilter, SeriesStore};
use crate::series::VerifiedSeries;

const MAX_DIR_NAME_BYTES: usize = 100;

/// One copied frame of an exported series.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedFrame {
    pub order: u32,
    pub file: String,
    pub source: String,
}

/// Contents of each series' `metadata.json`, and one entry of `dataset.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedSeries {
    pub base_name: String,
    /// Directory under the output root holding the frames.
    pub export_dir: String,
    pub directory: String,
    pub caption: String,
    pub frame_count: usize,
    pub ordering_source: String,
    pub frames: Vec<ExportedFrame>,
}

#[derive(Debug, Serialize)]
struct PromptEntry<'a> {
    id: &'a str,
    prompt: &'a str,
    frame_count: usize,
}

/// Series left out because some of their files are gone.
#[derive(Debug, Clone)]
pub struct SkippedSeries {
    pub base_name: String,
    pub missing: Vec<PathBuf>,
}

/// Frame-count window for exported series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportLimits {
    pub min_length: usize,
    pub max_length: Option<usize>,
}

impl ExportLimits {
    pub fn at_least(min_length: usize) -> Self {
        Self {
            min_length,
            max_length: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetReport {
    pub exported: Vec<ExportedSeries>,
    pub skipped_missing: Vec<SkippedSeries>,
    pub too_short: usize,
    pub too_long: usize,
}

impl DatasetReport {
    pub fn frames_copied(&self) -> usize {
        self.exported.iter().map(|s| s.frame_count).sum()
    }
}

/// Directory-safe form of a base name.
pub fn sanitize_base_name(name: &str) -> String {
    let cleaned = name.replace("...", "").replace(['/', '\\'], "_");
    let cleaned = cleaned.trim();

    let mut end = cleaned.len().min(MAX_DIR_NAME_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let cut = cleaned[..end].trim_end();

    if cut.is_empty() || cut == "." || cut == ".." {
        "series".to_string()
    } else {
        cut.to_string()
    }
}

/// Directory name for `series` that no earlier series of this run has taken.
fn unique_dir_name(series: &VerifiedSeries, taken: &mut HashSet<String>) -> String {
    let base = sanitize_base_name(&series.base_name);
    let mut name = base.clone();
    let mut attempt = 0u32;
    while taken.contains(&name) {
        attempt += 1;
        name = match (series.id, attempt) {
            (Some(id), 1) => format!("{}_{}", base, id),
            _ => format!("{}_{}", base, attempt),
        };
    }
    taken.insert(name.clone());
    name
}

/// Copy every accepted series within `limits` into `output_dir`, one
/// directory per series. Existing series directories are replaced.
pub fn export_dataset(
    db: &Database,
    output_dir: &Path,
    limits: ExportLimits,
) -> Result<DatasetReport> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let mut report = DatasetReport::default();
    let mut taken = HashSet::new();

    for series in db.list(SeriesFilter::Accepted)? {
        if series.image_count < limits.min_length {
            report.too_short += 1;
            continue;
        }
        if limits.max_length.is_some_and(|max| series.image_count > max) {
            report.too_long += 1;
            continue;
        }

        let missing: Vec<PathBuf> = series
            .ordered_paths()
            .filter(|p| !p.exists())
            .map(Path::to_path_buf)
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                series = %series.base_name,
                missing = missing.len(),
                "Skipping series with missing files"
            );
            report.skipped_missing.push(SkippedSeries {
                base_name: series.base_name.clone(),
                missing,
            });
            continue;
        }

        let dir_name = unique_dir_name(&series, &mut taken);
        let exported = export_series(&series, output_dir, dir_name)?;
        tracing::info!(
            series = %exported.base_name,
            frames = exported.frame_count,
            "Exported series"
        );
        report.exported.push(exported);
    }

    write_json(&output_dir.join("dataset.json"), &report.exported)?;

    let prompts: Vec<PromptEntry> = report
        .exported
        .iter()
        .map(|s| PromptEntry {
            id: &s.base_name,
            prompt: &s.caption,
            frame_count: s.frame_count,
        })
        .collect();
    write_json(&output_dir.join("prompts.json"), &prompts)?;

    Ok(report)
}

fn export_series(
    series: &VerifiedSeries,
    output_dir: &Path,
    dir_name: String,
) -> Result<ExportedSeries> {
    let series_dir = output_dir.join(&dir_name);
    // Frames from an earlier export may carry a different order.
    if series_dir.exists() {
        std::fs::remove_dir_all(&series_dir)
            .with_context(|| format!("clearing {}", series_dir.display()))?;
    }
    std::fs::create_dir_all(&series_dir)?;

    let mut frames = Vec::with_capacity(series.images.len());
    for image in &series.images {
        let original = image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file = format!("frame_{:03}_{}", image.order_in_series, original);
        std::fs::copy(&image.path, series_dir.join(&file))
            .with_context(|| format!("copying {}", image.path.display()))?;
        frames.push(ExportedFrame {
            order: image.order_in_series,
            file,
            source: image.path.to_string_lossy().to_string(),
        });
    }

    let caption = series.caption.clone().unwrap_or_default();
    std::fs::write(series_dir.join("caption.txt"), &caption)?;

    let exported = ExportedSeries {
        base_name: series.base_name.clone(),
        export_dir: dir_name,
        directory: series.directory.clone(),
        caption,
        frame_count: frames.len(),
        ordering_source: series.ordering.as_str().to_string(),
        frames,
    };
    write_json(&series_dir.join("metadata.json"), &exported)?;

    Ok(exported)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let mut file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Row counts written by [`dump_database`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub series_rows: usize,
    pub image_rows: usize,
    pub accepted_series: usize,
}

#[derive(Debug, Serialize)]
struct DumpedSeries {
    base_name: String,
    caption: Option<String>,
    image_count: usize,
    ordering_source: String,
    images: Vec<DumpedImage>,
}

#[derive(Debug, Serialize)]
struct DumpedImage {
    path: String,
    order: u32,
}

/// Write `series.csv`, `series_images.csv` and `series.json` (accepted
/// series with ordered images) into `output_dir`.
pub fn dump_database(db: &Database, output_dir: &Path) -> Result<DumpReport> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let series_rows = dump_series_csv(db, &output_dir.join("series.csv"))?;
    let image_rows = dump_images_csv(db, &output_dir.join("series_images.csv"))?;

    let accepted: Vec<DumpedSeries> = db
        .list(SeriesFilter::Accepted)?
        .into_iter()
        .map(|s| DumpedSeries {
            ordering_source: s.ordering.as_str().to_string(),
            images: s
                .images
                .iter()
                .map(|i| DumpedImage {
                    path: i.path.to_string_lossy().to_string(),
                    order: i.order_in_series,
                })
                .collect(),
            base_name: s.base_name,
            caption: s.caption,
            image_count: s.image_count,
        })
        .collect();
    write_json(&output_dir.join("series.json"), &accepted)?;

    Ok(DumpReport {
        series_rows,
        image_rows,
        accepted_series: accepted.len(),
    })
}

fn dump_series_csv(db: &Database, output_path: &Path) -> Result<usize> {
    let mut stmt = db.conn.prepare(
        r#"
        SELECT id, base_name, directory, is_series, caption, image_count,
               ordering_source, created_at, updated_at, raw_verdict
        FROM series
        ORDER BY id
        "#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok([
                row.get::<_, i64>(0)?.to_string(),
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?.to_string(),
                row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                row.get::<_, i64>(5)?.to_string(),
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ])
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record([
        "id",
        "base_name",
        "directory",
        "is_series",
        "caption",
        "image_count",
        "ordering_source",
        "created_at",
        "updated_at",
        "raw_verdict",
    ])?;
    for row in &rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;

    Ok(rows.len())
}

fn dump_images_csv(db: &Database, output_path: &Path) -> Result<usize> {
    let mut stmt = db.conn.prepare(
        r#"
        SELECT si.series_id, s.base_name, si.image_path, si.order_in_series
        FROM series_images si
        JOIN series s ON s.id = si.series_id
        ORDER BY si.series_id, si.order_in_series
        "#,
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok([
                row.get::<_, i64>(0)?.to_string(),
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?.to_string(),
            ])
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record(["series_id", "base_name", "image_path", "order_in_series"])?;
    for row in &rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;

    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{OrderingSource, VerifiedImage};
    use tempfile::tempdir;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn accepted(base_name: &str, paths: &[PathBuf]) -> VerifiedSeries {
        VerifiedSeries {
            id: None,
            base_name: base_name.to_string(),
            directory: "src".to_string(),
            is_series: true,
            caption: Some(format!("sequence of photos for {}", base_name)),
            raw_verdict: "{}".to_string(),
            image_count: paths.len(),
            ordering: OrderingSource::Verifier,
            images: paths
                .iter()
                .enumerate()
                .map(|(i, p)| VerifiedImage {
                    path: p.clone(),
                    order_in_series: (i + 1) as u32,
                })
                .collect(),
        }
    }

    fn touch(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_sanitize_base_name() {
        assert_eq!(sanitize_base_name("a/b\\c...d"), "a_b_cd");
        assert_eq!(sanitize_base_name("..."), "series");
        let long = "é".repeat(80);
        let cut = sanitize_base_name(&long);
        assert!(cut.len() <= MAX_DIR_NAME_BYTES);
        assert_eq!(cut.chars().count(), 50);
    }

    #[test]
    fn test_export_dataset_layout() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let db = db();

        let second = touch(src.path(), "b_02.jpg", "second");
        let first = touch(src.path(), "b_01.jpg", "first");
        db.upsert(&accepted("good", &[second.clone(), first.clone()])).unwrap();
        db.upsert(&accepted("short", &[first.clone()])).unwrap();
        db.upsert(&accepted("broken", &[first.clone(), src.path().join("gone.jpg")]))
            .unwrap();

        let report = export_dataset(&db, out.path(), ExportLimits::at_least(2)).unwrap();

        assert_eq!(report.exported.len(), 1);
        assert_eq!(report.too_short, 1);
        assert_eq!(report.skipped_missing.len(), 1);
        assert_eq!(report.skipped_missing[0].base_name, "broken");
        assert_eq!(report.frames_copied(), 2);

        let series_dir = out.path().join("good");
        assert_eq!(
            std::fs::read_to_string(series_dir.join("frame_001_b_02.jpg")).unwrap(),
            "second"
        );
        assert_eq!(
            std::fs::read_to_string(series_dir.join("frame_002_b_01.jpg")).unwrap(),
            "first"
        );
        assert_eq!(
            std::fs::read_to_string(series_dir.join("caption.txt")).unwrap(),
            "sequence of photos for good"
        );
        assert!(!out.path().join("broken").exists());

        let metadata = std::fs::read_to_string(series_dir.join("metadata.json")).unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata["frame_count"], 2);
        assert_eq!(metadata["ordering_source"], "verifier");

        let prompts: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join("prompts.json")).unwrap())
                .unwrap();
        assert_eq!(prompts[0]["id"], "good");
        assert!(out.path().join("dataset.json").exists());
    }

    #[test]
    fn test_max_length_skips_long_series() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let db = db();

        let frames: Vec<PathBuf> = (1..=4)
            .map(|i| touch(src.path(), &format!("f_{:02}.jpg", i), "x"))
            .collect();
        db.upsert(&accepted("long", &frames)).unwrap();
        db.upsert(&accepted("fits", &frames[..2])).unwrap();

        let limits = ExportLimits {
            min_length: 2,
            max_length: Some(3),
        };
        let report = export_dataset(&db, out.path(), limits).unwrap();

        assert_eq!(report.too_long, 1);
        assert_eq!(report.exported.len(), 1);
        assert_eq!(report.exported[0].base_name, "fits");
        assert!(!out.path().join("long").exists());
    }

    #[test]
    fn test_reexport_replaces_stale_frames() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let db = db();

        let frames: Vec<PathBuf> = (1..=3)
            .map(|i| touch(src.path(), &format!("s_{:02}.jpg", i), &i.to_string()))
            .collect();
        db.upsert(&accepted("s", &frames)).unwrap();
        export_dataset(&db, out.path(), ExportLimits::at_least(2)).unwrap();

        let reordered = vec![frames[2].clone(), frames[0].clone(), frames[1].clone()];
        db.upsert(&accepted("s", &reordered)).unwrap();
        export_dataset(&db, out.path(), ExportLimits::at_least(2)).unwrap();

        let series_dir = out.path().join("s");
        let mut names: Vec<String> = std::fs::read_dir(&series_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("frame_"))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["frame_001_s_03.jpg", "frame_002_s_01.jpg", "frame_003_s_02.jpg"]
        );
    }

    #[test]
    fn test_truncated_names_get_distinct_dirs() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let db = db();

        let frames: Vec<PathBuf> = (1..=2)
            .map(|i| touch(src.path(), &format!("t_{:02}.jpg", i), "x"))
            .collect();
        let prefix = format!("2025_01_01_00_00_00_anna_{}", "long_caption_".repeat(8));
        let first = format!("{}first", prefix);
        let second = format!("{}second", prefix);
        assert_eq!(sanitize_base_name(&first), sanitize_base_name(&second));
        db.upsert(&accepted(&first, &frames)).unwrap();
        db.upsert(&accepted(&second, &frames)).unwrap();

        let report = export_dataset(&db, out.path(), ExportLimits::at_least(2)).unwrap();

        assert_eq!(report.exported.len(), 2);
        let dirs: HashSet<&str> = report.exported.iter().map(|s| s.export_dir.as_str()).collect();
        assert_eq!(dirs.len(), 2);
        for exported in &report.exported {
            let caption =
                std::fs::read_to_string(out.path().join(&exported.export_dir).join("caption.txt"))
                    .unwrap();
            assert_eq!(caption, exported.caption);
        }
        let series_dirs = std::fs::read_dir(out.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count();
        assert_eq!(series_dirs, 2);
    }

    #[test]
    fn test_export_after_clean_has_contiguous_frames() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let db = db();

        let frames: Vec<PathBuf> = (1..=3)
            .map(|i| touch(src.path(), &format!("c_{:02}.jpg", i), &i.to_string()))
            .collect();
        db.upsert(&accepted("c", &frames)).unwrap();
        std::fs::remove_file(&frames[0]).unwrap();

        let cleaned = db.clean_missing_images().unwrap();
        assert_eq!(cleaned.missing.len(), 1);

        let report = export_dataset(&db, out.path(), ExportLimits::at_least(2)).unwrap();

        assert!(report.skipped_missing.is_empty());
        let exported = &report.exported[0];
        assert_eq!(exported.frame_count, 2);
        let orders: Vec<u32> = exported.frames.iter().map(|f| f.order).collect();
        assert_eq!(orders, vec![1, 2]);
        let series_dir = out.path().join("c");
        assert_eq!(
            std::fs::read_to_string(series_dir.join("frame_001_c_02.jpg")).unwrap(),
            "2"
        );
        assert_eq!(
            std::fs::read_to_string(series_dir.join("frame_002_c_03.jpg")).unwrap(),
            "3"
        );
    }

    #[test]
    fn test_dump_database() {
        let out = tempdir().unwrap();
        let db = db();
        db.upsert(&accepted("a", &[PathBuf::from("x/1.jpg"), PathBuf::from("x/2.jpg")]))
            .unwrap();
        let mut rejected = accepted("b", &[PathBuf::from("y/1.jpg"), PathBuf::from("y/2.jpg")]);
        rejected.is_series = false;
        rejected.caption = None;
        rejected.ordering = OrderingSource::Rejected;
        db.upsert(&rejected).unwrap();

        let report = dump_database(&db, out.path()).unwrap();

        assert_eq!(
            report,
            DumpReport {
                series_rows: 2,
                image_rows: 4,
                accepted_series: 1
            }
        );

        let mut rdr = csv::Reader::from_path(out.path().join("series_images.csv")).unwrap();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[0][2], "x/1.jpg");
        assert_eq!(&rows[0][3], "1");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join("series.json")).unwrap())
                .unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["images"][1]["path"], "x/2.jpg");
    }
}
