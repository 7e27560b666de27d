//! The persistent sheet: backend selection, known-URL loading and the append
//! pass.
//!
//! A sheet is a grid of string cells. Row 0 is [`HEADER`]; every other row is
//! an [`ArticleRecord::to_row`]. Column [`URL_COLUMN`] is the dedup key used
//! across runs.

use super::csv::CsvSheet;
use super::google::GoogleSheet;
use crate::models::{ArticleRecord, URL_COLUMN, header_row};
use clap::ValueEnum;
use reqwest::StatusCode;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument};

/// Errors returned by a [`SheetStore`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to read credentials {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service account key: {0}")]
    InvalidKey(String),
    #[error("failed to sign token request: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{context} returned status {status}: {body}")]
    Api {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("spreadsheet {0:?} not found")]
    NotFound(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Row-level access to a tabular store.
pub trait SheetStore {
    /// Every row currently in the sheet, header included.
    async fn read_all(&mut self) -> Result<Vec<Vec<String>>, SinkError>;

    /// Append `rows` after the last row, as raw values.
    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SinkError>;
}

/// Which backend holds the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Google Sheets, authenticated with a service account key.
    Google,
    /// A local CSV file, `<csv-dir>/<sheet-name>.csv`.
    Csv,
}

/// Where to find the sheet.
#[derive(Debug, Clone)]
pub struct SheetTarget {
    pub backend: StoreBackend,
    pub sheet_name: String,
    pub credentials: PathBuf,
    pub csv_dir: PathBuf,
}

/// An opened sheet of either backend.
#[derive(Debug)]
pub enum Sheet {
    Google(GoogleSheet),
    Csv(CsvSheet),
}

impl SheetStore for Sheet {
    async fn read_all(&mut self) -> Result<Vec<Vec<String>>, SinkError> {
        match self {
            Sheet::Google(s) => s.read_all().await,
            Sheet::Csv(s) => s.read_all().await,
        }
    }

    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SinkError> {
        match self {
            Sheet::Google(s) => s.append_rows(rows).await,
            Sheet::Csv(s) => s.append_rows(rows).await,
        }
    }
}

/// Connect to the sheet described by `target`.
#[instrument(level = "info", skip_all, fields(backend = ?target.backend, sheet = %target.sheet_name))]
pub async fn open_sheet(target: &SheetTarget) -> Result<Sheet, SinkError> {
    let sheet = match target.backend {
        StoreBackend::Google => {
            Sheet::Google(GoogleSheet::connect(&target.credentials, &target.sheet_name).await?)
        }
        StoreBackend::Csv => {
            let local = CsvSheet::new(&target.csv_dir, &target.sheet_name);
            info!(path = %local.path().display(), "Using local CSV sheet");
            Sheet::Csv(local)
        }
    };
    info!("Sheet opened");
    Ok(sheet)
}

/// URLs of every data row (the header row is skipped).
pub fn known_urls_from_rows(rows: &[Vec<String>]) -> HashSet<String> {
    rows.iter()
        .skip(1)
        .filter_map(|row| row.get(URL_COLUMN))
        .filter(|url| !url.is_empty())
        .cloned()
        .collect()
}

/// Read the URLs already stored in `sheet`.
///
/// # Errors
///
/// Returns an error if the sheet cannot be read.
#[instrument(level = "info", skip_all)]
pub async fn load_known_urls<S: SheetStore>(sheet: &mut S) -> Result<HashSet<String>, SinkError> {
    let rows = sheet.read_all().await?;
    let urls = known_urls_from_rows(&rows);
    info!(count = urls.len(), "Fetched existing URLs from the sheet");
    Ok(urls)
}

/// Append the records whose URL is not yet known.
///
/// An empty sheet first receives the header row and is read again, so the
/// header never counts as data. `known_urls` is refreshed from the sheet
/// before filtering and extended with every URL written. Records are
/// appended in input order as one batch; a URL repeated within `records`
/// is written once.
///
/// # Arguments
///
/// * `sheet` - The backend to read and append to
/// * `records` - Candidate records from this run
/// * `known_urls` - URLs already stored, updated in place
///
/// # Returns
///
/// The number of rows appended (0 for empty input or when every URL is
/// already known).
///
/// # Errors
///
/// Returns the first [`SinkError`] raised while reading or appending.
#[instrument(level = "info", skip_all, fields(records = records.len()))]
pub async fn commit<S: SheetStore>(
    sheet: &mut S,
    records: &[ArticleRecord],
    known_urls: &mut HashSet<String>,
) -> Result<usize, SinkError> {
    if records.is_empty() {
        info!("No records to write");
        return Ok(0);
    }

    let mut rows = sheet.read_all().await?;
    if rows.is_empty() {
        sheet.append_rows(&[header_row()]).await?;
        info!("Header row inserted");
        rows = sheet.read_all().await?;
    }
    known_urls.extend(known_urls_from_rows(&rows));

    let mut fresh: HashSet<&str> = HashSet::new();
    let new_records: Vec<&ArticleRecord> = records
        .iter()
        .filter(|r| !known_urls.contains(&r.url) && fresh.insert(r.url.as_str()))
        .collect();
    info!(new = new_records.len(), "Unique records to write");

    if new_records.is_empty() {
        info!("No new records to write");
        return Ok(0);
    }

    let new_rows: Vec<Vec<String>> = new_records.iter().map(|r| r.to_row()).collect();
    sheet.append_rows(&new_rows).await?;
    known_urls.extend(new_records.iter().map(|r| r.url.clone()));
    info!(rows = new_rows.len(), "Rows appended");
    Ok(new_rows.len())
}
