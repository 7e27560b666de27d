//! Page fetching through a single, serially reused session.
//!
//! # Architecture
//!
//! - [`PageFetcher`]: navigate to a page, expand it via "load more", close
//! - [`HttpSession`]: the reqwest-backed session used for real runs
//! - [`RetryFetch`]: decorator that retries transient failures with
//!   exponential backoff
//!
//! Every navigation waits a fixed settle delay before returning, so pages are
//! requested at a steady pace. Nothing here runs concurrently.
//!
//! # Retry Strategy
//!
//! Only errors classified by [`FetchError::is_transient`] are retried:
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
//! ```

use crate::config::FetchConfig;
use once_cell::sync::Lazy;
use rand::{Rng, rng};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

static LOAD_MORE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[rel="next"], a[aria-label="次へ"], a[data-cl-params*="more"]"#).unwrap()
});

/// Errors returned by a [`PageFetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: StatusCode },
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no load-more control on the current page")]
    NoLoadMore,
    #[error("load-more timed out after {0:?}")]
    Timeout(Duration),
    #[error("session is closed")]
    Closed,
}

impl FetchError {
    /// Worth retrying: network hiccups, 5xx and 429 responses.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// The session can no longer be used; the crawl has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Closed | FetchError::Client(_))
    }
}

/// A page session reused for every request of a run.
pub trait PageFetcher {
    /// Navigate to `url`, wait `settle`, and return the page HTML.
    async fn fetch(&mut self, url: &str, settle: Duration) -> Result<String, FetchError>;

    /// Follow the current page's "load more" control, waiting at most `wait`,
    /// and return the newly loaded HTML.
    async fn load_more(&mut self, wait: Duration) -> Result<String, FetchError>;

    /// Release the session. Later calls fail with [`FetchError::Closed`].
    async fn close(&mut self) -> Result<(), FetchError>;
}

/// HTTP session backed by a single `reqwest::Client`.
pub struct HttpSession {
    client: Option<reqwest::Client>,
    current: Option<(Url, String)>,
    visited: HashSet<String>,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("open", &self.client.is_some())
            .field("current", &self.current.as_ref().map(|(u, _)| u.as_str()))
            .field("visited", &self.visited.len())
            .finish()
    }
}

impl HttpSession {
    /// Open a session with the configured user agent and request timeout.
    #[instrument(level = "info", skip_all)]
    pub fn open(settings: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout())
            .build()
            .map_err(FetchError::Client)?;
        info!("Session opened");
        Ok(Self {
            client: Some(client),
            current: None,
            visited: HashSet::new(),
        })
    }

    async fn get(&self, url: &Url) -> Result<String, FetchError> {
        let client = self.client.as_ref().ok_or(FetchError::Closed)?;
        let http_err = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let response = client.get(url.clone()).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        response.text().await.map_err(http_err)
    }
}

impl PageFetcher for HttpSession {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&mut self, url: &str, settle: Duration) -> Result<String, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let t0 = Instant::now();
        let html = self.get(&parsed).await?;
        debug!(
            bytes = html.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched page"
        );
        sleep(settle).await;

        self.visited.insert(parsed.to_string());
        self.current = Some((parsed, html.clone()));
        Ok(html)
    }

    #[instrument(level = "debug", skip(self))]
    async fn load_more(&mut self, wait: Duration) -> Result<String, FetchError> {
        if self.client.is_none() {
            return Err(FetchError::Closed);
        }
        let next = {
            let (base, html) = self.current.as_ref().ok_or(FetchError::NoLoadMore)?;
            next_page(base, html, &self.visited).ok_or(FetchError::NoLoadMore)?
        };

        let html = timeout(wait, self.get(&next))
            .await
            .map_err(|_| FetchError::Timeout(wait))??;
        debug!(url = %next, bytes = html.len(), "Loaded more content");

        self.visited.insert(next.to_string());
        self.current = Some((next, html.clone()));
        Ok(html)
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        if self.client.take().is_some() {
            info!(pages = self.visited.len(), "Session closed");
        }
        self.current = None;
        Ok(())
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        if self.client.is_some() {
            warn!("Session dropped without close()");
        }
    }
}

/// The first unvisited "load more" target on `html`.
fn next_page(base: &Url, html: &str, visited: &HashSet<String>) -> Option<Url> {
    let document = Html::parse_document(html);
    document
        .select(&LOAD_MORE)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .find(|url| !visited.contains(url.as_str()))
}

/// Wrapper that adds exponential backoff retry to any [`PageFetcher`].
pub struct RetryFetch<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> RetryFetch<T>
where
    T: PageFetcher,
{
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let shift = (attempt - 1).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + Duration::from_millis(jitter_ms)
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> PageFetcher for RetryFetch<T>
where
    T: PageFetcher,
{
    async fn fetch(&mut self, url: &str, settle: Duration) -> Result<String, FetchError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.fetch(url, settle).await {
                Ok(html) => return Ok(html),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            url,
                            "fetch() exhausted retries"
                        );
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        ?delay,
                        error = %e,
                        url,
                        "fetch() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn load_more(&mut self, wait: Duration) -> Result<String, FetchError> {
        self.inner.load_more(wait).await
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        self.inner.close().await
    }
}
