//! Curate photo series from burst-style filenames into training datasets.
//!
//! Files named `YYYY_MM_DD_HH_MM_SS_<owner>_<caption>_<n>.<ext>` are grouped
//! into candidate series, checked by a vision model, stored in SQLite and
//! exported as ordered frame directories.

pub mod config;
pub mod db;
pub mod export;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod scanner;
pub mod series;
pub mod tasks;
