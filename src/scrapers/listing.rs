//! Category listing page indexing.
//!
//! Listing pages link to articles as `https://news.yahoo.co.jp/articles/<hex>`,
//! sometimes relative and often with tracking query strings. Indexing keeps
//! the links under the article prefix, strips query and fragment, and drops
//! duplicates while keeping page order.

use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

static ARTICLE_LINKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"a[href*="/articles/"]"#).unwrap());

/// Extract unique article URLs under `prefix` from a listing page.
///
/// Relative links are resolved against `prefix`.
#[instrument(level = "debug", skip(html))]
pub fn discover_links(html: &str, prefix: &str) -> Vec<String> {
    let base = Url::parse(prefix).ok();
    let document = Html::parse_document(html);

    let links: Vec<String> = document
        .select(&ARTICLE_LINKS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| match &base {
            Some(base) => base.join(href).ok().map(|u| u.to_string()),
            None => Some(href.to_string()),
        })
        .map(|href| strip_query(&href).to_string())
        .filter(|href| href.starts_with(prefix) && href.len() > prefix.len())
        .unique()
        .collect();

    debug!(count = links.len(), "Discovered article links");
    links
}

fn strip_query(href: &str) -> &str {
    href.split(['?', '#']).next().unwrap_or(href)
}
