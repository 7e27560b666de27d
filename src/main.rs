//! # Yahoo News Collector
//!
//! Crawls Yahoo!ニュース category pages, extracts every linked article,
//! resolves a `main/sub` genre from the page's noisy signals, and appends
//! the articles not yet stored to a spreadsheet.
//!
//! ## Usage
//!
//! ```sh
//! yahoo_news_collector --credentials ./credentials.json --sheet-name yahoo-news-scraper
//! ```
//!
//! ## Architecture
//!
//! One sequential pass per run:
//! 1. **Known URLs**: read the URL column of the sheet
//! 2. **Indexing**: discover article links on each category listing
//! 3. **Extraction**: fetch each article once and pull its fields and genre
//!    signals
//! 4. **Merge**: keep one record per URL, preferring the higher-priority,
//!    more specific genre
//! 5. **Output**: append new rows to the sheet and optionally write a JSON
//!    snapshot

use clap::Parser;
use std::error::Error;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod crawler;
mod fetch;
mod genre;
mod models;
mod outputs;
mod scrapers;
mod store;
mod utils;

use cli::Cli;
use config::Config;
use crawler::{RunOptions, run};
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("yahoo_news_collector starting up");

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    // --- Configuration ---
    let mut config = match Config::load(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    if let Some(limit) = args.max_articles_per_category {
        info!(limit, "Overriding articles per category from the command line");
        config.crawl.max_articles_per_category = limit;
    }

    if let Some(dir) = &args.json_output_dir {
        if let Err(e) = ensure_writable_dir(dir).await {
            error!(
                path = %dir,
                error = %e,
                "JSON output directory is not writable (fix perms or choose a different path)"
            );
            return Err(e);
        }
    }

    let options = RunOptions {
        target: args.sheet_target(),
        json_output_dir: args.json_output_dir.clone(),
        dry_run: args.dry_run,
    };
    let summary = run(config, &options).await?;

    if summary.aborted {
        warn!("Crawl ended early; only part of the categories were collected");
    }
    if let Some(path) = &summary.snapshot {
        info!(path = %path.display(), "Run snapshot written");
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        categories = summary.stats.categories,
        collected = summary.collected,
        written = summary.written,
        "Execution complete"
    );

    Ok(())
}
