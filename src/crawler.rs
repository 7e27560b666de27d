//! The sequential collection loop and the run around it.
//!
//! # Flow
//!
//! 1. **Known URLs**: read the URL column of the sheet (an unreachable sheet
//!    means an empty set)
//! 2. **Crawl**: for every category listing, index article links, fetch and
//!    extract each unseen article, resolve its genre and merge it into the
//!    [`RunStore`]
//! 3. **Close**: the page session is closed on every path, including an
//!    aborted crawl
//! 4. **Deliver**: write the optional JSON snapshot, then append the new
//!    records to the sheet (skipped with `--dry-run`)
//!
//! An article linked from several categories is fetched once. Every later
//! sighting re-resolves the cached page with the new listing URL so the
//! candidates compete under the store's merge rule.

use crate::config::{CategorySource, Config, ConfigError};
use crate::fetch::{FetchError, HttpSession, PageFetcher, RetryFetch};
use crate::genre::GenreResolver;
use crate::models::{ArticleRecord, RunSnapshot};
use crate::outputs::json::write_snapshot;
use crate::outputs::sheet::{SheetStore, SheetTarget, SinkError, commit, load_known_urls, open_sheet};
use crate::scrapers::article::{ExtractError, ExtractedArticle, Extractor};
use crate::scrapers::listing::discover_links;
use crate::store::{PriorityTable, RunStore, UpsertOutcome};
use crate::utils::{collection_time, truncate_for_log};
use chrono::{DateTime, FixedOffset};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that end a run with a failure status.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare extractor: {0}")]
    Extract(#[from] ExtractError),
    #[error("failed to open page session: {0}")]
    Session(#[from] FetchError),
    #[error("failed to write to the sheet: {0}")]
    Sink(#[from] SinkError),
}

/// Counters reported at the end of a crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub categories: usize,
    pub links: usize,
    pub already_stored: usize,
    pub fetched: usize,
    pub discarded: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
}

/// What a crawl produced.
#[derive(Debug)]
pub struct Collected {
    pub records: Vec<ArticleRecord>,
    pub stats: CrawlStats,
    /// Set when a fatal session error cut the crawl short.
    pub aborted: Option<FetchError>,
}

/// Result of a whole run.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: CrawlStats,
    pub collected: usize,
    pub written: usize,
    pub snapshot: Option<PathBuf>,
    pub aborted: bool,
}

/// Per-run settings that come from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: SheetTarget,
    pub json_output_dir: Option<String>,
    pub dry_run: bool,
}

/// Article pages seen this run; `None` marks a page that failed or was
/// discarded, so it is not fetched again.
type PageCache = HashMap<String, Option<ExtractedArticle>>;

/// Walks the configured categories with one [`PageFetcher`].
#[derive(Debug)]
pub struct Crawler {
    config: Config,
    extractor: Extractor,
    resolver: GenreResolver,
    collected_at: DateTime<FixedOffset>,
}

impl Crawler {
    pub fn new(config: Config, collected_at: DateTime<FixedOffset>) -> Result<Self, CrawlError> {
        let extractor = Extractor::new(config.extract.clone())?;
        let resolver = GenreResolver::new(config.genre.clone());
        Ok(Self {
            config,
            extractor,
            resolver,
            collected_at,
        })
    }

    /// Crawl every category, then close `fetcher`.
    ///
    /// URLs in `known_urls` are never fetched. A fatal session error stops
    /// the crawl but keeps everything merged so far.
    #[instrument(level = "info", skip_all, fields(categories = self.config.categories.len(), known = known_urls.len()))]
    pub async fn collect<F: PageFetcher>(
        &self,
        fetcher: &mut F,
        known_urls: &HashSet<String>,
    ) -> Collected {
        let genre = &self.config.genre;
        let mut store = RunStore::new(PriorityTable::new(
            genre.priorities.clone(),
            genre.general_suffix.clone(),
        ));
        let mut stats = CrawlStats::default();
        let mut cache = PageCache::new();

        let mut aborted = None;
        for category in &self.config.categories {
            let result = self
                .crawl_category(fetcher, category, known_urls, &mut cache, &mut store, &mut stats)
                .await;
            if let Err(e) = result {
                error!(category = %category.label, error = %e, "Page session failed; aborting crawl");
                aborted = Some(e);
                break;
            }
        }

        if let Err(e) = fetcher.close().await {
            warn!(error = %e, "Failed to close page session");
        }

        if store.is_empty() {
            warn!(links = stats.links, "Crawl produced no articles");
        }
        info!(
            collected = store.len(),
            fetched = stats.fetched,
            discarded = stats.discarded,
            already_stored = stats.already_stored,
            "Crawl finished"
        );
        Collected {
            records: store.into_records(),
            stats,
            aborted,
        }
    }

    /// Crawl one listing page. Only fatal fetch errors are returned.
    #[instrument(level = "info", skip_all, fields(category = %category.label, url = %category.url))]
    async fn crawl_category<F: PageFetcher>(
        &self,
        fetcher: &mut F,
        category: &CategorySource,
        known_urls: &HashSet<String>,
        cache: &mut PageCache,
        store: &mut RunStore,
        stats: &mut CrawlStats,
    ) -> Result<(), FetchError> {
        let links = match self.index_category(fetcher, category).await {
            Ok(links) => links,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Listing page failed; skipping category");
                return Ok(());
            }
        };
        stats.categories += 1;
        stats.links += links.len();
        info!(count = links.len(), "Article links to process");

        for url in links {
            if known_urls.contains(&url) {
                stats.already_stored += 1;
                debug!(%url, "Already on the sheet; skipping");
                continue;
            }

            if !cache.contains_key(&url) {
                let page = self.fetch_article(fetcher, &url, stats).await?;
                cache.insert(url.clone(), page);
            }
            let Some(Some(article)) = cache.get(&url) else {
                continue;
            };

            let genre = self
                .resolver
                .resolve(&article.signals(&url, Some(category.url.as_str())));
            let record = self.record(article, &url, genre);
            let (title, id, genre) = (record.title.clone(), record.id.clone(), record.genre.clone());

            match store.upsert(record) {
                UpsertOutcome::Inserted => {
                    stats.inserted += 1;
                    info!(%title, %id, %genre, "[ADD]");
                }
                UpsertOutcome::Replaced => {
                    stats.replaced += 1;
                    info!(%title, %id, %genre, "[UPDATE] genre replaced");
                }
                UpsertOutcome::Kept => {
                    stats.kept += 1;
                    let stored = store.get(&url).map(|r| r.genre.as_str()).unwrap_or_default();
                    debug!(%id, candidate = %genre, %stored, "Stored record kept");
                }
            }
        }
        Ok(())
    }

    /// Load the listing, expand it, and return at most the per-category
    /// limit of article links.
    async fn index_category<F: PageFetcher>(
        &self,
        fetcher: &mut F,
        category: &CategorySource,
    ) -> Result<Vec<String>, FetchError> {
        let prefix = &self.config.extract.article_prefix;
        let html = fetcher
            .fetch(&category.url, self.config.fetch.listing_settle())
            .await?;
        let mut links = discover_links(&html, prefix);

        for round in 1..=self.config.crawl.max_load_more {
            match fetcher.load_more(self.config.fetch.load_more_timeout()).await {
                Ok(more) => {
                    let found = discover_links(&more, prefix);
                    debug!(round, found = found.len(), "Loaded more articles");
                    links.extend(found);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(round, reason = %e, "No further content");
                    break;
                }
            }
        }

        Ok(links
            .into_iter()
            .unique()
            .take(self.config.crawl.max_articles_per_category)
            .collect())
    }

    /// Fetch and extract one article. Non-fatal failures yield `Ok(None)`.
    async fn fetch_article<F: PageFetcher>(
        &self,
        fetcher: &mut F,
        url: &str,
        stats: &mut CrawlStats,
    ) -> Result<Option<ExtractedArticle>, FetchError> {
        let html = match fetcher.fetch(url, self.config.fetch.article_settle()).await {
            Ok(html) => html,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%url, error = %e, "Article fetch failed; skipping");
                stats.discarded += 1;
                return Ok(None);
            }
        };
        stats.fetched += 1;

        match self.extractor.extract(url, &html) {
            Ok(article) if article.body.is_empty() => {
                warn!(%url, title = %article.title, "No article body found; discarding");
                stats.discarded += 1;
                Ok(None)
            }
            Ok(article) => {
                debug!(%url, body = %truncate_for_log(&article.body, 80), "Extracted article");
                Ok(Some(article))
            }
            Err(e) => {
                warn!(%url, error = %e, "Extraction failed; discarding");
                stats.discarded += 1;
                Ok(None)
            }
        }
    }

    fn record(&self, article: &ExtractedArticle, url: &str, genre: String) -> ArticleRecord {
        ArticleRecord {
            id: article.id.clone(),
            collected_at: self.collected_at,
            title: article.title.clone(),
            provider: article.provider.clone(),
            published_at: article.published_at.clone(),
            url: url.to_string(),
            genre,
            body: article.body.clone(),
        }
    }
}

/// Run one collection pass end to end.
///
/// Reads the known URLs from the sheet, crawls every configured category
/// over one retrying HTTP session, writes the JSON snapshot when
/// `options.json_output_dir` is set, and appends the new records unless
/// `options.dry_run` is set.
///
/// # Arguments
///
/// * `config` - Loaded and validated configuration
/// * `options` - Sheet target, snapshot directory and dry-run flag
///
/// # Returns
///
/// A [`RunSummary`] with crawl counters and the number of rows written.
///
/// # Errors
///
/// Returns an error if the UTC offset is invalid, the page session cannot be
/// built, or the final sheet write fails. An unreadable sheet at startup, a
/// failed snapshot and an aborted crawl are logged and do not fail the run.
#[instrument(level = "info", skip_all, fields(sheet = %options.target.sheet_name, dry_run = options.dry_run))]
pub async fn run(config: Config, options: &RunOptions) -> Result<RunSummary, CrawlError> {
    let collected_at = collection_time(config.store.offset()?);
    info!(%collected_at, "Collection time fixed for this run");

    let (max_retries, base_delay) = (config.fetch.max_retries, config.fetch.retry_base_delay());
    let session = HttpSession::open(&config.fetch)?;
    let crawler = Crawler::new(config, collected_at)?;

    let mut sheet = match open_sheet(&options.target).await {
        Ok(sheet) => Some(sheet),
        Err(e) => {
            error!(error = %e, "Could not open the sheet; continuing without known URLs");
            None
        }
    };
    let mut known_urls = match sheet.as_mut() {
        Some(sheet) => load_known_urls(sheet).await.unwrap_or_else(|e| {
            error!(error = %e, "Could not read known URLs; continuing with none");
            HashSet::new()
        }),
        None => HashSet::new(),
    };

    let mut fetcher = RetryFetch::new(session, max_retries, base_delay);
    let collected = crawler.collect(&mut fetcher, &known_urls).await;

    let snapshot = match &options.json_output_dir {
        Some(dir) => write_run_snapshot(collected_at, &collected.records, dir).await,
        None => None,
    };

    let written = if options.dry_run {
        info!(records = collected.records.len(), "Dry run; not writing to the sheet");
        0
    } else if collected.records.is_empty() {
        info!("Nothing collected; sheet left untouched");
        0
    } else {
        // The startup read may have failed; the write gets its own attempt.
        let mut sheet = match sheet {
            Some(sheet) => sheet,
            None => open_sheet(&options.target).await?,
        };
        deliver(&mut sheet, &collected.records, &mut known_urls).await?
    };

    Ok(RunSummary {
        collected: collected.records.len(),
        stats: collected.stats,
        written,
        snapshot,
        aborted: collected.aborted.is_some(),
    })
}

/// Append `records` to `sheet` through [`commit`], logging a failure before
/// returning it.
///
/// # Returns
///
/// The number of rows appended.
pub async fn deliver<S: SheetStore>(
    sheet: &mut S,
    records: &[ArticleRecord],
    known_urls: &mut HashSet<String>,
) -> Result<usize, CrawlError> {
    match commit(sheet, records, known_urls).await {
        Ok(written) => {
            info!(written, "Sheet updated");
            Ok(written)
        }
        Err(e) => {
            error!(error = %e, records = records.len(), "Failed to write records to the sheet");
            Err(e.into())
        }
    }
}

async fn write_run_snapshot(
    collected_at: DateTime<FixedOffset>,
    records: &[ArticleRecord],
    dir: &str,
) -> Option<PathBuf> {
    let snapshot = RunSnapshot {
        collected_at,
        records: records.to_vec(),
    };
    match write_snapshot(&snapshot, dir).await {
        Ok(path) => Some(path),
        Err(e) => {
            error!(error = %e, "Failed to write run snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::FakeFetcher;
    use crate::models::URL_COLUMN;
    use crate::outputs::sheet::tests::MemorySheet;
    use chrono::TimeZone;
    use reqwest::StatusCode;

    const DOMESTIC: &str = "https://news.yahoo.co.jp/categories/domestic";
    const BUSINESS: &str = "https://news.yahoo.co.jp/categories/business";
    const LOCAL: &str = "https://news.yahoo.co.jp/categories/local";

    fn config(categories: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        config.categories = categories
            .iter()
            .map(|(label, url)| CategorySource {
                label: label.to_string(),
                url: url.to_string(),
            })
            .collect();
        config
    }

    fn crawler(config: Config) -> Crawler {
        let at = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 5, 6, 9, 0, 0)
            .unwrap();
        Crawler::new(config, at).unwrap()
    }

    fn article_url(id: &str) -> String {
        format!("https://news.yahoo.co.jp/articles/{id}")
    }

    fn listing(ids: &[&str]) -> String {
        let links: String = ids
            .iter()
            .map(|id| format!(r#"<a href="/articles/{id}?source=cat">{id}</a>"#))
            .collect();
        format!("<html><body>{links}</body></html>")
    }

    fn article(title: &str, state: Option<(&str, &str)>, body: &str) -> String {
        let state = state
            .map(|(main, sub)| {
                format!(
                    r#"<script>window.__PRELOADED_STATE__ = {{"pageData":{{"ctg":"{main}","subctg":"{sub}"}}}};</script>"#
                )
            })
            .unwrap_or_default();
        format!(
            r#"<html><head><meta property="og:title" content="{title}（共同通信） - Yahoo!ニュース">{state}</head>
               <body><div class="article_body"><p>{body}</p></div></body></html>"#
        )
    }

    #[tokio::test]
    async fn test_collect_resolves_genres_and_skips_known() {
        let mut fetcher = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["aa01", "bb02", "cc03"])),
            (article_url("aa01"), article("首相が会見", Some(("dom", "pol")), "本文A")),
            (article_url("bb02"), article("株価が上昇", Some(("bus", "mkt")), "本文B")),
        ]);
        let known: HashSet<String> = [article_url("cc03")].into_iter().collect();

        let collected = crawler(config(&[("国内", DOMESTIC)]))
            .collect(&mut fetcher, &known)
            .await;

        assert!(collected.aborted.is_none());
        assert!(fetcher.closed);
        assert!(!fetcher.requests.contains(&article_url("cc03")));
        let genres: Vec<(&str, &str)> = collected
            .records
            .iter()
            .map(|r| (r.title.as_str(), r.genre.as_str()))
            .collect();
        assert_eq!(genres, vec![("首相が会見", "国内/政治"), ("株価が上昇", "経済/市況・株式")]);
        assert_eq!(collected.stats.already_stored, 1);
        assert_eq!(collected.stats.inserted, 2);
    }

    #[tokio::test]
    async fn test_article_in_several_categories_is_fetched_once_and_merged() {
        // No page state or breadcrumb: the listing URL decides the genre.
        let mut fetcher = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["ab12"])),
            (LOCAL.to_string(), listing(&["ab12"])),
            (BUSINESS.to_string(), listing(&["ab12"])),
            (article_url("ab12"), article("地方銀行が統合", None, "本文")),
        ]);
        let collected = crawler(config(&[("国内", DOMESTIC), ("地域", LOCAL), ("経済", BUSINESS)]))
            .collect(&mut fetcher, &HashSet::new())
            .await;

        let article_fetches = fetcher
            .requests
            .iter()
            .filter(|u| **u == article_url("ab12"))
            .count();
        assert_eq!(article_fetches, 1);
        assert_eq!(collected.records.len(), 1);
        assert_eq!(collected.records[0].genre, "経済/経済総合");
        // 地域 ties with 国内 on rank and label length, so only 経済 replaces.
        assert_eq!(collected.stats.inserted, 1);
        assert_eq!(collected.stats.kept, 1);
        assert_eq!(collected.stats.replaced, 1);
    }

    #[tokio::test]
    async fn test_failed_and_empty_articles_are_discarded() {
        let mut fetcher = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["dd01", "ee02", "ff03"])),
            (article_url("dd01"), article("本文なし", Some(("dom", "soci")), "")),
            (article_url("ff03"), article("残る記事", Some(("dom", "soci")), "本文")),
        ]);
        let collected = crawler(config(&[("国内", DOMESTIC)]))
            .collect(&mut fetcher, &HashSet::new())
            .await;

        assert_eq!(collected.records.len(), 1);
        assert_eq!(collected.records[0].url, article_url("ff03"));
        assert_eq!(collected.stats.discarded, 2);
    }

    #[tokio::test]
    async fn test_listing_limit_and_load_more() {
        let mut cfg = config(&[("国内", DOMESTIC)]);
        cfg.crawl.max_articles_per_category = 3;
        let mut fetcher = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["a1", "a2"])),
            (article_url("a1"), article("一", Some(("dom", "soci")), "x")),
            (article_url("a2"), article("二", Some(("dom", "soci")), "x")),
            (article_url("a3"), article("三", Some(("dom", "soci")), "x")),
            (article_url("a4"), article("四", Some(("dom", "soci")), "x")),
        ]);
        fetcher.more.push_back(listing(&["a2", "a3", "a4"]));

        let collected = crawler(cfg).collect(&mut fetcher, &HashSet::new()).await;
        let urls: Vec<String> = collected.records.into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec![article_url("a1"), article_url("a2"), article_url("a3")]);
    }

    #[tokio::test]
    async fn test_failing_listing_skips_only_that_category() {
        let mut fetcher = FakeFetcher::with_pages([
            (BUSINESS.to_string(), listing(&["b1"])),
            (article_url("b1"), article("経済記事", Some(("bus", "ind")), "本文")),
        ]);
        fetcher.failures.push_back(FetchError::Status {
            url: DOMESTIC.to_string(),
            status: StatusCode::FORBIDDEN,
        });
        let collected = crawler(config(&[("国内", DOMESTIC), ("経済", BUSINESS)]))
            .collect(&mut fetcher, &HashSet::new())
            .await;

        assert_eq!(collected.stats.categories, 1);
        assert_eq!(collected.records.len(), 1);
        assert_eq!(collected.records[0].genre, "経済/産業");
    }

    #[tokio::test]
    async fn test_dead_session_aborts_but_keeps_records_and_closes() {
        let inner = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["c1"])),
            (article_url("c1"), article("記事", Some(("dom", "soci")), "本文")),
            (BUSINESS.to_string(), listing(&["c2"])),
        ]);
        // Listing and article succeed, then the session dies on the next category.
        let mut fetcher = DyingFetcher {
            inner,
            remaining: 2,
        };
        let collected = crawler(config(&[("国内", DOMESTIC), ("経済", BUSINESS)]))
            .collect(&mut fetcher, &HashSet::new())
            .await;

        assert!(matches!(collected.aborted, Some(FetchError::Closed)));
        assert!(fetcher.inner.closed);
        assert_eq!(collected.records.len(), 1);
        assert_eq!(collected.records[0].genre, "国内/社会");
    }

    /// Serves `remaining` fetches, then behaves like a crashed session.
    struct DyingFetcher {
        inner: FakeFetcher,
        remaining: usize,
    }

    impl PageFetcher for DyingFetcher {
        async fn fetch(
            &mut self,
            url: &str,
            settle: std::time::Duration,
        ) -> Result<String, FetchError> {
            if self.remaining == 0 {
                return Err(FetchError::Closed);
            }
            self.remaining -= 1;
            self.inner.fetch(url, settle).await
        }

        async fn load_more(&mut self, wait: std::time::Duration) -> Result<String, FetchError> {
            self.inner.load_more(wait).await
        }

        async fn close(&mut self) -> Result<(), FetchError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_collect_then_deliver_end_to_end() {
        let mut sheet = MemorySheet {
            rows: vec![
                crate::models::header_row(),
                {
                    let mut row = vec![String::new(); 8];
                    row[URL_COLUMN] = article_url("old1");
                    row
                },
            ],
            ..MemorySheet::default()
        };
        let mut known = load_known_urls(&mut sheet).await.unwrap();
        let mut fetcher = FakeFetcher::with_pages([
            (DOMESTIC.to_string(), listing(&["old1", "new1"])),
            (article_url("new1"), article("新しい記事", Some(("it", "")), "本文")),
        ]);

        let collected = crawler(config(&[("国内", DOMESTIC)]))
            .collect(&mut fetcher, &known)
            .await;
        let written = deliver(&mut sheet, &collected.records, &mut known).await.unwrap();

        assert_eq!(written, 1);
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.rows[2][URL_COLUMN], article_url("new1"));
        assert_eq!(sheet.rows[2][6], "IT");
        assert_eq!(sheet.rows[2][1], "2025/05/06 09:00");

        // A second delivery of the same records adds nothing.
        assert_eq!(deliver(&mut sheet, &collected.records, &mut known).await.unwrap(), 0);
        assert_eq!(sheet.rows.len(), 3);
    }
}
