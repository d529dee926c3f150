use std::collections::HashMap;
use std::path::PathBuf;

use super::filename::FilenameKeyParser;
use super::{CandidateOrder, CandidateSeries, SeriesKey, SeriesMember, SizeBounds};

/// Counts of files and partitions that did not become candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupingStats {
    pub files_seen: usize,
    pub unparsable: usize,
    pub groups_found: usize,
    pub below_min: usize,
    pub above_max: usize,
}

impl GroupingStats {
    pub fn out_of_bounds(&self) -> usize {
        self.below_min + self.above_max
    }
}

/// Clusters a directory listing into candidate series.
#[derive(Debug, Clone)]
pub struct SeriesGrouper {
    parser: FilenameKeyParser,
    bounds: SizeBounds,
    order: CandidateOrder,
}

impl SeriesGrouper {
    pub fn new(parser: FilenameKeyParser, bounds: SizeBounds, order: CandidateOrder) -> Self {
        Self {
            parser,
            bounds,
            order,
        }
    }

    pub fn group(&self, paths: &[PathBuf]) -> Vec<CandidateSeries> {
        self.group_with_stats(paths).0
    }

    pub fn group_with_stats(&self, paths: &[PathBuf]) -> (Vec<CandidateSeries>, GroupingStats) {
        let mut stats = GroupingStats {
            files_seen: paths.len(),
            ..Default::default()
        };

        // Keys in first-seen order, members in listing order.
        let mut slots: HashMap<SeriesKey, usize> = HashMap::new();
        let mut partitions: Vec<(SeriesKey, Vec<SeriesMember>)> = Vec::new();

        for path in paths {
            let (key, sequence) = match self.parser.parse_path(path) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::trace!(path = %path.display(), error = %e, "Skipping file");
                    stats.unparsable += 1;
                    continue;
                }
            };

            let member = SeriesMember {
                path: path.clone(),
                sequence,
            };
            match slots.get(&key) {
                Some(&slot) => partitions[slot].1.push(member),
                None => {
                    slots.insert(key.clone(), partitions.len());
                    partitions.push((key, vec![member]));
                }
            }
        }

        stats.groups_found = partitions.len();

        let mut candidates: Vec<CandidateSeries> = partitions
            .into_iter()
            .filter_map(|(key, mut members)| {
                let count = members.len();
                if count < self.bounds.min {
                    stats.below_min += 1;
                    return None;
                }
                if count > self.bounds.max {
                    stats.above_max += 1;
                    return None;
                }
                // Stable sort keeps listing order for duplicate indices.
                members.sort_by_key(|m| m.sequence);
                Some(CandidateSeries::new(key, members))
            })
            .collect();

        if self.order == CandidateOrder::LargestFirst {
            candidates.sort_by(|a, b| b.image_count().cmp(&a.image_count()));
        }

        tracing::debug!(
            files = stats.files_seen,
            unparsable = stats.unparsable,
            groups = stats.groups_found,
            candidates = candidates.len(),
            "Grouped directory listing"
        );

        (candidates, stats)
    }
}
