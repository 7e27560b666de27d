//! Data models for collected articles and the sheet row layout.
//!
//! - [`ArticleRecord`]: one finished article, one sheet row
//! - [`RunSnapshot`]: the records of a single run, as written to JSON
//!
//! The sheet layout is fixed: [`HEADER`] is the first row and every following
//! row is an [`ArticleRecord::to_row`] with the URL in column [`URL_COLUMN`].

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Header row written to an empty sheet.
pub const HEADER: [&str; 8] = [
    "ID",
    "収集時刻",
    "タイトル",
    "情報源",
    "掲載時刻",
    "URL",
    "ジャンル",
    "本文",
];

/// Zero-based column holding the article URL, the cross-run dedup key.
pub const URL_COLUMN: usize = 5;

/// Format of the collection timestamp column.
pub const COLLECTED_AT_FORMAT: &str = "%Y/%m/%d %H:%M";

/// A fully extracted article with its resolved genre.
///
/// Records are never mutated; a better candidate for the same URL replaces
/// the stored record as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArticleRecord {
    pub id: String,
    pub collected_at: DateTime<FixedOffset>,
    pub title: String,
    pub provider: String,
    /// Best-effort publication time as found on the page; may be empty.
    pub published_at: String,
    pub url: String,
    pub genre: String,
    pub body: String,
}

impl ArticleRecord {
    /// The sheet row for this record, in [`HEADER`] order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.collected_at.format(COLLECTED_AT_FORMAT).to_string(),
            self.title.clone(),
            self.provider.clone(),
            self.published_at.clone(),
            self.url.clone(),
            self.genre.clone(),
            self.body.clone(),
        ]
    }
}

/// The header as an owned row.
pub fn header_row() -> Vec<String> {
    HEADER.iter().map(|h| h.to_string()).collect()
}

/// The records collected by one run.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunSnapshot {
    pub collected_at: DateTime<FixedOffset>,
    pub records: Vec<ArticleRecord>,
}
