//! Command-line interface definitions.
//!
//! Every option can also be given through the config file or, where noted,
//! an environment variable. Command-line values win.

use crate::outputs::sheet::{SheetTarget, StoreBackend};
use clap::Parser;
use std::path::PathBuf;

/// Collect Yahoo!ニュース articles into a spreadsheet.
///
/// # Examples
///
/// ```sh
/// # Append new articles to the default Google Sheet
/// yahoo_news_collector --credentials ./credentials.json
///
/// # Write to a local CSV and keep a JSON copy of the run
/// yahoo_news_collector --store csv --csv-dir ./data -j ./json
///
/// # See what would be collected without touching the sheet
/// yahoo_news_collector --dry-run --max-articles-per-category 3
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Service account key file for Google Sheets
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS", default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Name of the spreadsheet (or CSV file stem) to append to
    #[arg(long, default_value = "yahoo-news-scraper")]
    pub sheet_name: String,

    /// Where the sheet lives
    #[arg(long, value_enum, default_value_t = StoreBackend::Google)]
    pub store: StoreBackend,

    /// Directory holding the CSV sheet when `--store csv` is used
    #[arg(long, default_value = ".")]
    pub csv_dir: PathBuf,

    /// Also write the run's records as JSON under this directory
    #[arg(short, long)]
    pub json_output_dir: Option<String>,

    /// Crawl and log, but do not write to the sheet
    #[arg(long)]
    pub dry_run: bool,

    /// Override the number of articles taken from each category
    #[arg(long)]
    pub max_articles_per_category: Option<usize>,
}

impl Cli {
    pub fn sheet_target(&self) -> SheetTarget {
        SheetTarget {
            backend: self.store,
            sheet_name: self.sheet_name.clone(),
            credentials: self.credentials.clone(),
            csv_dir: self.csv_dir.clone(),
        }
    }
}
