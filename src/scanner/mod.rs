pub mod discovery;

use anyhow::Result;
use std::path::Path;

use crate::config::GroupingConfig;
use crate::series::{
    CandidateOrder, CandidateSeries, FilenameKeyParser, GroupingStats, SeriesGrouper,
};

pub use discovery::discover_images;

/// Candidates found under one directory.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub total_images: usize,
    pub candidates: Vec<CandidateSeries>,
    pub stats: GroupingStats,
}

/// Directory listing plus grouping, configured from `[grouping]`.
pub struct Scanner {
    extensions: Vec<String>,
    grouper: SeriesGrouper,
}

impl Scanner {
    pub fn new(config: &GroupingConfig) -> Self {
        Self::with_order(config, config.candidate_order())
    }

    pub fn with_order(config: &GroupingConfig, order: CandidateOrder) -> Self {
        let parser = FilenameKeyParser::new(&config.image_extensions);
        Self {
            extensions: config.image_extensions.clone(),
            grouper: SeriesGrouper::new(parser, config.bounds(), order),
        }
    }

    pub fn scan_directory(&self, directory: &Path) -> Result<ScanResult> {
        let images = discover_images(directory, &self.extensions)?;
        let (candidates, stats) = self.grouper.group_with_stats(&images);

        tracing::info!(
            directory = %directory.display(),
            images = images.len(),
            candidates = candidates.len(),
            unparsable = stats.unparsable,
            out_of_bounds = stats.out_of_bounds(),
            "Scanned directory"
        );

        Ok(ScanResult {
            total_images: images.len(),
            candidates,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_scan_groups_files_on_disk() {
        let dir = tempdir().unwrap();
        for name in [
            "2025_08_28_15_09_21_jenny_vienna_02.jpg",
            "2025_08_28_15_09_21_jenny_vienna_01.jpg",
            "2025_08_28_15_09_21_jenny_vienna_03.JPG",
            "2025_08_28_15_09_21_solo_shot_01.jpg",
            "holiday.jpg",
            "readme.md",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }

        let scanner = Scanner::new(&GroupingConfig::default());
        let result = scanner.scan_directory(dir.path()).unwrap();

        assert_eq!(result.total_images, 5);
        assert_eq!(result.stats.unparsable, 1);
        assert_eq!(result.stats.below_min, 1);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].base_name(), "2025_08_28_15_09_21_jenny_vienna");
        assert_eq!(result.candidates[0].image_count(), 3);
    }
}
