//! Structured burst filenames.
//!
//! Scraped posts are saved as
//! `YYYY_MM_DD_HH_MM_SS_<owner>_<caption>_<NN>.<ext>`, where the leading
//! fields are the post time, `owner` is the account name, `caption` is a
//! free-text slug (possibly empty, possibly containing underscores) and `NN`
//! is the zero-padded position of the image inside the post.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Position of an image within its post. Only ever used as a sort key.
pub type SequenceIndex = u32;

const DATE_FIELD_WIDTHS: [usize; 6] = [4, 2, 2, 2, 2, 2];

/// Identity of a candidate session, derived from the filename alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Normalized `YYYY-MM-DDTHH:MM:SS`.
    pub timestamp: String,
    pub owner: String,
    pub caption_token: String,
}

impl SeriesKey {
    /// Stable name used as the persistence key for a series.
    pub fn base_name(&self) -> String {
        let compact = self.timestamp.replace(['-', 'T', ':'], "_");
        format!("{}_{}_{}", compact, self.owner, self.caption_token)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnparsableFilename {
    #[error("filename is not valid UTF-8")]
    NotUtf8,
    #[error("unsupported extension in {0:?}")]
    Extension(String),
    #[error("missing or malformed date/time fields in {0:?}")]
    Timestamp(String),
    #[error("missing owner, caption or sequence field in {0:?}")]
    FieldCount(String),
    #[error("non-numeric sequence token in {0:?}")]
    Sequence(String),
}

/// Parses burst filenames against a fixed extension allow-list.
#[derive(Debug, Clone)]
pub struct FilenameKeyParser {
    extensions: Vec<String>,
}

impl FilenameKeyParser {
    pub fn new(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Parse the final component of `path`.
    pub fn parse_path(
        &self,
        path: &Path,
    ) -> Result<(SeriesKey, SequenceIndex), UnparsableFilename> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(UnparsableFilename::NotUtf8)?;
        self.parse(name)
    }

    pub fn parse(&self, filename: &str) -> Result<(SeriesKey, SequenceIndex), UnparsableFilename> {
        let (stem, ext) = filename
            .rsplit_once('.')
            .ok_or_else(|| UnparsableFilename::Extension(filename.to_string()))?;
        if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return Err(UnparsableFilename::Extension(filename.to_string()));
        }

        let (timestamp, rest) = split_timestamp(stem)
            .ok_or_else(|| UnparsableFilename::Timestamp(filename.to_string()))?;

        let (owner, after_owner) = rest
            .split_once('_')
            .ok_or_else(|| UnparsableFilename::FieldCount(filename.to_string()))?;
        if owner.is_empty() {
            return Err(UnparsableFilename::FieldCount(filename.to_string()));
        }

        // after_owner is "<caption>_<seq>"; the separator must be present.
        let (caption, seq) = after_owner
            .rsplit_once('_')
            .ok_or_else(|| UnparsableFilename::FieldCount(filename.to_string()))?;

        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(UnparsableFilename::Sequence(filename.to_string()));
        }
        let index: SequenceIndex = seq
            .parse()
            .map_err(|_| UnparsableFilename::Sequence(filename.to_string()))?;

        Ok((
            SeriesKey {
                timestamp,
                owner: owner.to_string(),
                caption_token: caption.to_string(),
            },
            index,
        ))
    }
}

/// Split the six date/time fields off the front of `stem`, returning the
/// normalized timestamp and the remainder after the separating underscore.
fn split_timestamp(stem: &str) -> Option<(String, &str)> {
    let mut fields = Vec::with_capacity(DATE_FIELD_WIDTHS.len());
    let mut rest = stem;

    for width in DATE_FIELD_WIDTHS {
        let (field, tail) = rest.split_once('_')?;
        if field.len() != width || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        fields.push(field);
        rest = tail;
    }

    let joined = format!(
        "{}-{}-{}T{}:{}:{}",
        fields[0], fields[1], fields[2], fields[3], fields[4], fields[5]
    );
    let parsed = NaiveDateTime::parse_from_str(&joined, "%Y-%m-%dT%H:%M:%S").ok()?;

    Some((parsed.format("%Y-%m-%dT%H:%M:%S").to_string(), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> FilenameKeyParser {
        FilenameKeyParser::new(&["jpg".to_string(), "jpeg".to_string(), "png".to_string()])
    }

    #[test]
    fn test_parse_basic_filename() {
        let (key, index) = parser()
            .parse("2025_08_28_15_09_21_jenny_vienna_03.jpg")
            .unwrap();

        assert_eq!(key.timestamp, "2025-08-28T15:09:21");
        assert_eq!(key.owner, "jenny");
        assert_eq!(key.caption_token, "vienna");
        assert_eq!(index, 3);
        assert_eq!(key.base_name(), "2025_08_28_15_09_21_jenny_vienna");
    }

    #[test]
    fn test_caption_keeps_underscores() {
        let (key, index) = parser()
            .parse("2025_08_28_15_16_56_jenny.lbx_vienna_has_my_heart__wien_12.jpg")
            .unwrap();

        assert_eq!(key.owner, "jenny.lbx");
        assert_eq!(key.caption_token, "vienna_has_my_heart__wien");
        assert_eq!(index, 12);
    }

    #[test]
    fn test_empty_caption_slug() {
        let (key, index) = parser()
            .parse("2025_08_28_15_09_21_unfashDN5zem3DKwP______04.jpg")
            .unwrap();

        assert_eq!(key.owner, "unfashDN5zem3DKwP");
        assert_eq!(key.caption_token, "____");
        assert_eq!(index, 4);

        let (key, _) = parser().parse("2025_08_28_15_09_21_anna__01.png").unwrap();
        assert_eq!(key.caption_token, "");
    }

    #[test]
    fn test_parse_is_deterministic() {
        let name = "2024_01_02_03_04_05_Owner_Trip_007.JPG";
        assert_eq!(parser().parse(name), parser().parse(name));
    }

    #[test]
    fn test_case_is_preserved() {
        let (a, _) = parser().parse("2024_01_02_03_04_05_Owner_Trip_01.jpg").unwrap();
        let (b, _) = parser().parse("2024_01_02_03_04_05_owner_trip_01.jpg").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_malformed_names() {
        let p = parser();
        assert!(matches!(
            p.parse("2025_08_28_15_09_21_jenny_vienna_01.txt"),
            Err(UnparsableFilename::Extension(_))
        ));
        assert!(matches!(
            p.parse("IMG_1234.jpg"),
            Err(UnparsableFilename::Timestamp(_))
        ));
        assert!(matches!(
            p.parse("2025_13_28_15_09_21_jenny_vienna_01.jpg"),
            Err(UnparsableFilename::Timestamp(_))
        ));
        assert!(matches!(
            p.parse("2025_08_28_15_09_21_jenny_01.jpg"),
            Err(UnparsableFilename::FieldCount(_))
        ));
        assert!(matches!(
            p.parse("2025_08_28_15_09_21_jenny_vienna_0a.jpg"),
            Err(UnparsableFilename::Sequence(_))
        ));
        assert!(matches!(
            p.parse("2025_08_28_15_09_21_jenny_vienna_99999999999.jpg"),
            Err(UnparsableFilename::Sequence(_))
        ));
        assert!(p.parse("2025_08_28_15_09_21__vienna_01.jpg").is_err());
        assert!(p.parse("no_extension").is_err());
    }
}
