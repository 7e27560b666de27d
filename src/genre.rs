//! Genre resolution from noisy page signals.
//!
//! An article's genre comes from whichever of these signals is available, in
//! order:
//!
//! 1. the embedded `window.__PRELOADED_STATE__` blob (category short codes),
//! 2. the breadcrumb navigation (`ホーム > 経済 > 市況・株式`),
//! 3. short codes appearing in the article URL or the listing URL it was
//!    found on,
//!
//! and finally the fallback label (`その他`). Each tier is a plain function
//! over the resolver's tables; the first one returning `Some` wins. The
//! result is always passed through alias normalization.

use crate::config::{GenreConfig, MainCategory, SubCategory};
use serde_json::Value;
use tracing::debug;
use url::Url;

const MAIN_CODE_KEYS: [&str; 3] = ["categoryShortName", "ctg", "category"];
const SUB_CODE_KEYS: [&str; 3] = ["subCategoryShortName", "subctg", "subCategory"];

/// Category codes found in the page-state blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    pub main: Option<String>,
    pub sub: Option<String>,
}

impl PageState {
    /// Pull the first main and sub category codes out of a parsed blob.
    pub fn from_json(value: &Value) -> Self {
        Self {
            main: find_code(value, &MAIN_CODE_KEYS),
            sub: find_code(value, &SUB_CODE_KEYS),
        }
    }
}

/// Depth-first search for the first non-empty string under any of `keys`.
fn find_code(value: &Value, keys: &[&str]) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in keys {
                if let Some(Value::String(s)) = map.get(*key) {
                    if !s.trim().is_empty() {
                        return Some(s.trim().to_string());
                    }
                }
            }
            map.values().find_map(|v| find_code(v, keys))
        }
        Value::Array(items) => items.iter().find_map(|v| find_code(v, keys)),
        _ => None,
    }
}

/// Everything the resolver may look at for one article.
#[derive(Debug, Clone, Copy)]
pub struct GenreSignals<'a> {
    /// `None` when the blob is absent or failed to parse.
    pub page_state: Option<&'a PageState>,
    pub breadcrumb: &'a [String],
    pub url: &'a str,
    pub listing_url: Option<&'a str>,
}

type Strategy = fn(&GenreResolver, &GenreSignals<'_>) -> Option<String>;

const STRATEGIES: [(&str, Strategy); 3] = [
    ("page_state", from_page_state),
    ("breadcrumb", from_breadcrumb),
    ("url", from_urls),
];

/// Maps page signals to a normalized `main/sub` genre label.
#[derive(Debug, Clone)]
pub struct GenreResolver {
    tables: GenreConfig,
}

impl GenreResolver {
    pub fn new(tables: GenreConfig) -> Self {
        Self { tables }
    }

    /// Resolve a genre from the signals of one article.
    ///
    /// Tiers are tried in order: page state, breadcrumb, then the article
    /// and listing URLs. The first tier producing a label wins; with no
    /// signal at all the fallback label is used.
    ///
    /// # Returns
    ///
    /// A normalized label such as `国内/社会`, `IT` or `その他`. Never empty.
    pub fn resolve(&self, signals: &GenreSignals<'_>) -> String {
        for (tier, strategy) in STRATEGIES {
            if let Some(genre) = strategy(self, signals) {
                let genre = self.normalize(&genre);
                debug!(tier, %genre, url = signals.url, "Resolved genre");
                return genre;
            }
        }
        debug!(url = signals.url, "No genre signal; using fallback");
        self.normalize(&self.tables.fallback)
    }

    /// Rewrite known label aliases until nothing changes.
    ///
    /// With a validated alias table this is idempotent:
    /// `normalize(&normalize(g)) == normalize(g)`.
    pub fn normalize(&self, genre: &str) -> String {
        let mut current = genre.to_string();
        for _ in 0..=self.tables.aliases.len() {
            let next = self
                .tables
                .aliases
                .iter()
                .fold(current.clone(), |acc, alias| acc.replace(&alias.from, &alias.to));
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn main_category(&self, code: &str) -> Option<&MainCategory> {
        self.tables.main_categories.iter().find(|m| m.code == code)
    }

    fn sub_category(&self, code: &str) -> Option<&SubCategory> {
        self.tables.sub_categories.iter().find(|s| s.code == code)
    }

    /// Label for a main category with no usable sub-category.
    fn main_label(&self, main: &MainCategory) -> String {
        if self.tables.unsuffixed.iter().any(|c| *c == main.code) {
            main.label.clone()
        } else {
            format!("{0}/{0}{1}", main.label, self.tables.general_suffix)
        }
    }

    fn sub_label(&self, sub: &SubCategory) -> Option<String> {
        let parent = self.main_category(&sub.parent)?;
        if self.tables.unsuffixed.iter().any(|c| *c == parent.code) {
            return Some(parent.label.clone());
        }
        Some(format!("{}/{}", parent.label, sub.label))
    }

    /// Match known codes against the path and query of `url`, sub-categories
    /// first.
    fn lookup_url(&self, url: &str) -> Option<String> {
        let haystack = match Url::parse(url) {
            Ok(parsed) => format!("{}?{}", parsed.path(), parsed.query().unwrap_or_default()),
            Err(_) => url.to_string(),
        }
        .to_lowercase();

        if let Some(sub) = self
            .tables
            .sub_categories
            .iter()
            .find(|s| haystack.contains(&s.code.to_lowercase()))
        {
            return self.sub_label(sub);
        }
        self.tables
            .main_categories
            .iter()
            .find(|m| haystack.contains(&m.code.to_lowercase()))
            .map(|m| self.main_label(m))
    }
}

fn from_page_state(r: &GenreResolver, signals: &GenreSignals<'_>) -> Option<String> {
    let state = signals.page_state?;
    let code = state.main.as_deref()?;

    if let Some(main) = r.main_category(code) {
        if r.tables.unsuffixed.iter().any(|c| c == code) {
            return Some(main.label.clone());
        }
        return match state.sub.as_deref().and_then(|s| r.sub_category(s)) {
            Some(sub) => Some(format!("{}/{}", main.label, sub.label)),
            None => Some(r.main_label(main)),
        };
    }
    if let Some(sub) = r.sub_category(code) {
        return r.sub_label(sub);
    }
    // Unknown code: try the request URL before giving up on this tier.
    r.lookup_url(signals.url)
}

fn from_breadcrumb(r: &GenreResolver, signals: &GenreSignals<'_>) -> Option<String> {
    let crumbs: Vec<&str> = signals
        .breadcrumb
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    match crumbs.as_slice() {
        [_, main, sub, ..] => Some(format!("{main}/{sub}")),
        [_, main] => Some(format!("{main}{}", r.tables.general_suffix)),
        _ => None,
    }
}

fn from_urls(r: &GenreResolver, signals: &GenreSignals<'_>) -> Option<String> {
    r.lookup_url(signals.url)
        .or_else(|| signals.listing_url.and_then(|u| r.lookup_url(u)))
}
