//! Local CSV backend for the sheet.
//!
//! Stores the grid as `<dir>/<sheet-name>.csv`, one sheet row per CSV
//! record. Useful for offline runs and for keeping a copy outside Google.

use super::sheet::{SheetStore, SinkError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct CsvSheet {
    path: PathBuf,
}

impl CsvSheet {
    pub fn new(dir: &Path, sheet_name: &str) -> Self {
        Self {
            path: dir.join(format!("{sheet_name}.csv")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse headerless CSV bytes into rows of cells.
fn parse_rows(raw: &[u8]) -> Result<Vec<Vec<String>>, SinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw);
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Encode rows as CSV bytes, quoting cells as needed.
fn encode_rows(rows: &[Vec<String>]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| SinkError::Io(std::io::Error::other(e.to_string())))
}

impl SheetStore for CsvSheet {
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    async fn read_all(&mut self) -> Result<Vec<Vec<String>>, SinkError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let rows = parse_rows(&raw)?;
        debug!(rows = rows.len(), "Read CSV sheet");
        Ok(rows)
    }

    #[instrument(level = "debug", skip_all, fields(path = %self.path.display(), rows = rows.len()))]
    async fn append_rows(&mut self, rows: &[Vec<String>]) -> Result<(), SinkError> {
        let encoded = encode_rows(rows)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        Ok(())
    }
}
