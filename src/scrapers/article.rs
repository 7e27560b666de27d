//! Article page field extraction.
//!
//! Turns the HTML of a single Yahoo!ニュース article into its fields (id,
//! title, provider, publication time, body) plus the raw genre signals the
//! [`GenreResolver`](crate::genre::GenreResolver) consumes later. Every field
//! has its own fallback chain; a missing element only ever produces the
//! field's sentinel value.

use crate::config::ExtractConfig;
use crate::genre::{GenreSignals, PageState};
use crate::utils::truncate_chars;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

pub const NO_ID: &str = "NO_ID";
pub const NO_TITLE: &str = "NO TITLE";

const PAGE_STATE_MARKER: &str = "window.__PRELOADED_STATE__";

/// Elements whose text never counts as body text.
const SKIPPED_TAGS: [&str; 6] = ["figure", "aside", "script", "style", "noscript", "blockquote"];

static ARTICLE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"articles/([a-f0-9]+)").unwrap());

static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static META_PROVIDERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"meta[name="author"]"#,
        r#"meta[name="publisher"]"#,
        r#"meta[property="article:author"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});
static PROVIDER_SPAN: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"span[class*="provider"], span[class*="sc-f06b9b1-0"]"#).unwrap()
});
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time").unwrap());
static META_PUBDATE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[name="pubdate"], meta[property="article:published_time"]"#).unwrap()
});
static BREADCRUMB: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"nav[aria-label="パンくずリスト"] li"#).unwrap());
static SCRIPT: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());
static BODY_CONTAINERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"div[class*="article_body"], div[class*="ArticleBody"]"#,
        r#"div[data-testid="article-body"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());

/// Errors that make a single article unusable.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("empty document for {url}")]
    EmptyDocument { url: String },
    #[error("invalid title pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Fields extracted from one article page, before genre resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedArticle {
    pub id: String,
    pub title: String,
    pub provider: String,
    pub published_at: String,
    pub body: String,
    /// `None` when the page carries no parseable page-state blob.
    pub page_state: Option<PageState>,
    pub breadcrumb: Vec<String>,
}

impl ExtractedArticle {
    /// Genre signals for this page as seen from `listing_url`.
    pub fn signals<'a>(&'a self, url: &'a str, listing_url: Option<&'a str>) -> GenreSignals<'a> {
        GenreSignals {
            page_state: self.page_state.as_ref(),
            breadcrumb: &self.breadcrumb,
            url,
            listing_url,
        }
    }
}

/// Extracts article fields according to an [`ExtractConfig`].
#[derive(Debug)]
pub struct Extractor {
    settings: ExtractConfig,
    title_suffix: Regex,
}

impl Extractor {
    pub fn new(settings: ExtractConfig) -> Result<Self, ExtractError> {
        let title_suffix = Regex::new(&format!(
            r"\s*(?:（[^）]*）)?\s*-\s*{}\s*$",
            regex::escape(&settings.site_name)
        ))?;
        Ok(Self {
            settings,
            title_suffix,
        })
    }

    /// Extract every field of the article at `url` from its HTML.
    #[instrument(level = "debug", skip_all, fields(%url))]
    pub fn extract(&self, url: &str, html: &str) -> Result<ExtractedArticle, ExtractError> {
        if html.trim().is_empty() {
            return Err(ExtractError::EmptyDocument {
                url: url.to_string(),
            });
        }
        let document = Html::parse_document(html);

        let body = extract_body(&document);
        debug!(chars = body.chars().count(), "Extracted body");

        Ok(ExtractedArticle {
            id: article_id(url),
            title: self.title(&document),
            provider: self.provider(&document),
            published_at: published_at(&document),
            body: truncate_chars(&body, self.settings.body_max_chars),
            page_state: page_state(&document),
            breadcrumb: breadcrumb(&document),
        })
    }

    fn title(&self, document: &Html) -> String {
        document
            .select(&OG_TITLE)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|t| self.title_suffix.replace(t.trim(), "").trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| NO_TITLE.to_string())
    }

    fn provider(&self, document: &Html) -> String {
        let articles: Vec<Value> = document
            .select(&LD_JSON)
            .filter_map(|script| {
                let raw = script.text().collect::<String>();
                serde_json::from_str::<Value>(raw.trim()).ok()
            })
            .flat_map(|json| news_articles(&json))
            .collect();

        let from_author = articles
            .iter()
            .find_map(|a| a.get("author").and_then(author_name));
        let from_publisher = || {
            articles.iter().find_map(|a| {
                a.get("publisher")
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty() && *name != self.settings.brand)
                    .map(str::to_string)
            })
        };
        let from_meta = || {
            META_PROVIDERS.iter().find_map(|selector| {
                document
                    .select(selector)
                    .filter_map(|el| el.value().attr("content"))
                    .map(str::trim)
                    .find(|c| !c.is_empty())
                    .map(str::to_string)
            })
        };
        let from_label = || {
            document
                .select(&PROVIDER_SPAN)
                .map(|el| el.text().collect::<String>().trim().to_string())
                .find(|t| !t.is_empty())
        };

        from_author
            .or_else(from_publisher)
            .or_else(from_meta)
            .or_else(from_label)
            .unwrap_or_else(|| self.settings.unknown_provider.clone())
    }
}

fn article_id(url: &str) -> String {
    ARTICLE_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| NO_ID.to_string())
}

/// JSON-LD objects typed `NewsArticle`, looking through arrays and `@graph`.
fn news_articles(json: &Value) -> Vec<Value> {
    match json {
        Value::Array(items) => items.iter().flat_map(news_articles).collect(),
        Value::Object(map) => {
            let mut found = Vec::new();
            let is_news = match map.get("@type") {
                Some(Value::String(t)) => t == "NewsArticle",
                Some(Value::Array(types)) => types.iter().any(|t| t == "NewsArticle"),
                _ => false,
            };
            if is_news {
                found.push(json.clone());
            }
            if let Some(graph) = map.get("@graph") {
                found.extend(news_articles(graph));
            }
            found
        }
        _ => Vec::new(),
    }
}

fn author_name(author: &Value) -> Option<String> {
    let name = match author {
        Value::Object(obj) => obj.get("name").and_then(Value::as_str),
        Value::Array(items) => items
            .iter()
            .find_map(|a| a.get("name").and_then(Value::as_str)),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn published_at(document: &Html) -> String {
    let time = document.select(&TIME).next();
    let from_attr = time
        .and_then(|el| el.value().attr("datetime"))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let from_text = || {
        time.map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    };
    let from_meta = || {
        document
            .select(&META_PUBDATE)
            .filter_map(|el| el.value().attr("content"))
            .map(str::trim)
            .find(|c| !c.is_empty())
            .map(str::to_string)
    };

    from_attr
        .map(str::to_string)
        .or_else(from_text)
        .or_else(from_meta)
        .unwrap_or_default()
}

fn breadcrumb(document: &Html) -> Vec<String> {
    document
        .select(&BREADCRUMB)
        .map(|li| li.text().collect::<String>().trim().to_string())
        .collect()
}

/// Parse the `window.__PRELOADED_STATE__ = {...}` assignment, if any.
fn page_state(document: &Html) -> Option<PageState> {
    let script = document
        .select(&SCRIPT)
        .map(|s| s.text().collect::<String>())
        .find(|text| text.contains(PAGE_STATE_MARKER))?;
    let start = script.find(PAGE_STATE_MARKER)? + PAGE_STATE_MARKER.len();
    let rest = script[start..].trim_start().strip_prefix('=')?.trim_start();

    // The assignment may be followed by more statements; read one value only.
    match serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .next()
    {
        Some(Ok(value)) => Some(PageState::from_json(&value)),
        Some(Err(e)) => {
            debug!(error = %e, "Page state blob did not parse");
            None
        }
        None => None,
    }
}

fn extract_body(document: &Html) -> String {
    let Some(container) = BODY_CONTAINERS
        .iter()
        .find_map(|selector| document.select(selector).next())
    else {
        debug!("No article body container found");
        return String::new();
    };

    container
        .select(&PARAGRAPH)
        .filter(|p| !inside_skipped(*p, container))
        .map(visible_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether `el` sits inside a skipped element below `root`.
fn inside_skipped(el: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    let root_id = (*root).id();
    el.ancestors()
        .take_while(|a| a.id() != root_id)
        .filter_map(|a| a.value().as_element())
        .any(|e| SKIPPED_TAGS.contains(&e.name()))
}

/// Text of `el` with each text node trimmed, joined by spaces, skipping text
/// inside [`SKIPPED_TAGS`].
fn visible_text(el: ElementRef<'_>) -> String {
    let el_id = (*el).id();
    el.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node
                .ancestors()
                .take_while(|a| a.id() != el_id)
                .filter_map(|a| a.value().as_element())
                .any(|e| SKIPPED_TAGS.contains(&e.name()));
            (!hidden).then(|| text.trim())
        })
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://news.yahoo.co.jp/articles/3f9a0c1b2d";

    fn extractor() -> Extractor {
        Extractor::new(ExtractConfig::default()).unwrap()
    }

    fn page(head: &str, body: &str) -> String {
        format!("<html><head>{head}</head><body>{body}</body></html>")
    }

    #[test]
    fn test_id_from_url() {
        assert_eq!(article_id(URL), "3f9a0c1b2d");
        assert_eq!(article_id("https://news.yahoo.co.jp/pickup/6500000"), NO_ID);
    }

    #[test]
    fn test_title_suffix_is_stripped() {
        let html = page(
            r#"<meta property="og:title" content="日銀が利上げを決定（共同通信） - Yahoo!ニュース">"#,
            "",
        );
        let article = extractor().extract(URL, &html).unwrap();
        assert_eq!(article.title, "日銀が利上げを決定");
    }

    #[test]
    fn test_title_without_provider_part() {
        let html = page(r#"<meta property="og:title" content="台風が接近 - Yahoo!ニュース">"#, "");
        assert_eq!(extractor().extract(URL, &html).unwrap().title, "台風が接近");
    }

    #[test]
    fn test_missing_title_uses_sentinel() {
        let html = page("<title>x</title>", "<p>x</p>");
        assert_eq!(extractor().extract(URL, &html).unwrap().title, NO_TITLE);
    }

    #[test]
    fn test_provider_prefers_ld_json_author() {
        let html = page(
            r#"<script type="application/ld+json">
                {"@type":"NewsArticle","author":{"name":"毎日新聞"},"publisher":{"name":"Yahoo!ニュース"}}
            </script>
            <meta name="author" content="meta author">"#,
            r#"<span class="provider">label</span>"#,
        );
        assert_eq!(extractor().extract(URL, &html).unwrap().provider, "毎日新聞");
    }

    #[test]
    fn test_provider_publisher_skips_platform_brand() {
        let brand_only = page(
            r#"<script type="application/ld+json">{"@type":"NewsArticle","publisher":{"name":"Yahoo!ニュース"}}</script>"#,
            r#"<span class="sc-f06b9b1-0 x">テレビ朝日</span>"#,
        );
        let publisher = page(
            r#"<script type="application/ld+json">[{"@type":"NewsArticle","publisher":{"name":"朝日新聞"}}]</script>"#,
            "",
        );
        let e = extractor();
        assert_eq!(e.extract(URL, &brand_only).unwrap().provider, "テレビ朝日");
        assert_eq!(e.extract(URL, &publisher).unwrap().provider, "朝日新聞");
    }

    #[test]
    fn test_provider_meta_and_unknown() {
        let meta = page(r#"<meta name="publisher" content="読売新聞">"#, "");
        let none = page("", "<p>本文</p>");
        let e = extractor();
        assert_eq!(e.extract(URL, &meta).unwrap().provider, "読売新聞");
        assert_eq!(e.extract(URL, &none).unwrap().provider, "不明");
    }

    #[test]
    fn test_provider_ignores_broken_ld_json() {
        let html = page(
            r#"<script type="application/ld+json">{not json</script>
               <script type="application/ld+json">{"@graph":[{"@type":["NewsArticle"],"author":[{"name":"共同通信"}]}]}</script>"#,
            "",
        );
        assert_eq!(extractor().extract(URL, &html).unwrap().provider, "共同通信");
    }

    #[test]
    fn test_published_at_chain() {
        let attr = page("", r#"<time datetime=" 2025-05-06T08:30:00+09:00 ">5/6(火) 8:30</time>"#);
        let text = page("", "<time>5/6(火) 8:30</time>");
        let meta = page(r#"<meta name="pubdate" content="2025-05-06">"#, "");
        let none = page("", "");
        let e = extractor();
        assert_eq!(e.extract(URL, &attr).unwrap().published_at, "2025-05-06T08:30:00+09:00");
        assert_eq!(e.extract(URL, &text).unwrap().published_at, "5/6(火) 8:30");
        assert_eq!(e.extract(URL, &meta).unwrap().published_at, "2025-05-06");
        assert_eq!(e.extract(URL, &none).unwrap().published_at, "");
    }

    #[test]
    fn test_body_skips_decorations() {
        let html = page(
            "",
            r#"<div class="article_body highLightSearchTarget">
                 <p>第一段落。</p>
                 <figure><p>写真の説明</p></figure>
                 <p>  第二段落 <script>var x = 1;</script><a href="/x">リンク</a></p>
                 <blockquote><p>引用</p></blockquote>
                 <p>   </p>
               </div>"#,
        );
        let article = extractor().extract(URL, &html).unwrap();
        assert_eq!(article.body, "第一段落。\n第二段落 リンク");
    }

    #[test]
    fn test_body_data_testid_container() {
        let html = page("", r#"<div data-testid="article-body"><p>本文</p></div><p>外側</p>"#);
        assert_eq!(extractor().extract(URL, &html).unwrap().body, "本文");
    }

    #[test]
    fn test_body_is_capped() {
        let long = "長".repeat(5000);
        let html = page("", &format!(r#"<div class="article_body"><p>{long}</p></div>"#));
        let body = extractor().extract(URL, &html).unwrap().body;
        assert_eq!(body.chars().count(), 3000);
    }

    #[test]
    fn test_no_container_gives_empty_body() {
        let html = page("", "<p>本文</p>");
        assert_eq!(extractor().extract(URL, &html).unwrap().body, "");
    }

    #[test]
    fn test_breadcrumb_and_page_state_signals() {
        let html = page(
            r#"<script>window.__PRELOADED_STATE__ = {"pageData":{"ctg":"dom","subctg":"soci"}};
               window.__CONFIG__ = {};</script>"#,
            r#"<nav aria-label="パンくずリスト"><ol><li>ホーム</li><li>国内</li><li>社会</li></ol></nav>"#,
        );
        let article = extractor().extract(URL, &html).unwrap();
        let state = article.page_state.clone().unwrap();
        assert_eq!(state.main.as_deref(), Some("dom"));
        assert_eq!(state.sub.as_deref(), Some("soci"));
        assert_eq!(article.breadcrumb, vec!["ホーム", "国内", "社会"]);
    }

    #[test]
    fn test_unparseable_page_state_is_none() {
        let html = page("<script>window.__PRELOADED_STATE__ = {broken</script>", "");
        assert!(extractor().extract(URL, &html).unwrap().page_state.is_none());
    }

    #[test]
    fn test_empty_document_is_an_error() {
        assert!(matches!(
            extractor().extract(URL, "  "),
            Err(ExtractError::EmptyDocument { .. })
        ));
    }
}
