//! Run configuration: category sources, genre tables, extraction and fetch settings.
//!
//! Every field has a built-in default that matches the live Yahoo!ニュース
//! layout, so a YAML file only has to name what it overrides:
//!
//! ```yaml
//! crawl:
//!   max_articles_per_category: 30
//! genre:
//!   aliases:
//!     - { from: ビジネス, to: 経済 }
//! ```
//!
//! The loaded [`Config`] is immutable for the rest of the run and is handed to
//! the genre resolver, the run store and the fetcher at construction time.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Listing pages crawled in order.
    pub categories: Vec<CategorySource>,
    pub genre: GenreConfig,
    pub extract: ExtractConfig,
    pub crawl: CrawlConfig,
    pub fetch: FetchConfig,
    pub store: StoreConfig,
}

/// A category listing page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CategorySource {
    pub label: String,
    pub url: String,
}

/// A main category short code and its display label (`dom` → `国内`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MainCategory {
    pub code: String,
    pub label: String,
}

/// A sub-category short code, the main code it belongs to, and its label.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubCategory {
    pub code: String,
    pub parent: String,
    pub label: String,
}

/// A label rewrite applied after genre resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Alias {
    pub from: String,
    pub to: String,
}

/// Tables consumed by the genre resolver and the run store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GenreConfig {
    pub main_categories: Vec<MainCategory>,
    pub sub_categories: Vec<SubCategory>,
    /// Main codes whose label is used bare, without a sub-category part.
    pub unsuffixed: Vec<String>,
    /// Appended to a main label when no sub-category is known (`国内総合`).
    pub general_suffix: String,
    /// Label used when no signal resolves.
    pub fallback: String,
    pub aliases: Vec<Alias>,
    /// Merge priority per label; unmapped labels rank 0.
    pub priorities: HashMap<String, u8>,
}

/// Field extraction settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Site name stripped from the end of `og:title`.
    pub site_name: String,
    /// The platform's own publisher name, never reported as a provider.
    pub brand: String,
    /// Only links starting with this prefix are treated as articles.
    pub article_prefix: String,
    pub body_max_chars: usize,
    pub unknown_provider: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_articles_per_category: usize,
    /// Number of "load more" expansions tried per listing page.
    pub max_load_more: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub listing_settle_ms: u64,
    pub article_settle_ms: u64,
    pub load_more_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Offset used for the collection timestamp (JST by default).
    pub utc_offset_hours: i32,
}

impl Default for Config {
    fn default() -> Self {
        let categories = [
            ("国内", "domestic"),
            ("国際", "world"),
            ("経済", "business"),
            ("エンタメ", "entertainment"),
            ("スポーツ", "sports"),
            ("IT", "it"),
            ("科学", "science"),
            ("ライフ", "life"),
            ("地域", "local"),
        ]
        .into_iter()
        .map(|(label, slug)| CategorySource {
            label: label.to_string(),
            url: format!("https://news.yahoo.co.jp/categories/{slug}"),
        })
        .collect();

        Self {
            categories,
            genre: GenreConfig::default(),
            extract: ExtractConfig::default(),
            crawl: CrawlConfig::default(),
            fetch: FetchConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for GenreConfig {
    fn default() -> Self {
        let main_categories = [
            ("top", "主要"),
            ("dom", "国内"),
            ("world", "国際"),
            ("bus", "経済"),
            ("ent", "エンタメ"),
            ("spo", "スポーツ"),
            ("it", "IT"),
            ("sci", "科学"),
            ("life", "ライフ"),
            ("loc", "地域"),
        ]
        .into_iter()
        .map(|(code, label)| MainCategory {
            code: code.to_string(),
            label: label.to_string(),
        })
        .collect();

        let sub_categories = [
            ("soci", "dom", "社会"),
            ("pol", "dom", "政治"),
            ("peo", "dom", "人"),
            ("w_asia", "world", "アジア・オセアニア"),
            ("w_n_ame", "world", "北米"),
            ("w_eurp", "world", "ヨーロッパ"),
            ("w_m_est", "world", "中東・アフリカ"),
            ("mkt", "bus", "市況・株式"),
            ("ind", "bus", "産業"),
            ("movie", "ent", "映画"),
            ("music", "ent", "音楽"),
            ("base", "spo", "野球"),
            ("socc", "spo", "サッカー"),
            ("moto", "spo", "モータースポーツ"),
            ("golf", "spo", "ゴルフ"),
            ("fight", "spo", "格闘技"),
            ("hlth", "life", "健康"),
            ("loc_hkd", "loc", "北海道・東北"),
            ("loc_kanto", "loc", "関東"),
            ("loc_chubu", "loc", "中部"),
            ("loc_kinki", "loc", "近畿"),
            ("loc_chushi", "loc", "中国・四国"),
            ("loc_kyushu", "loc", "九州・沖縄"),
        ]
        .into_iter()
        .map(|(code, parent, label)| SubCategory {
            code: code.to_string(),
            parent: parent.to_string(),
            label: label.to_string(),
        })
        .collect();

        let priorities = [
            ("国内", 0),
            ("地域", 0),
            ("主要", 1),
            ("国際", 1),
            ("経済", 1),
            ("エンタメ", 1),
            ("スポーツ", 1),
            ("IT", 1),
            ("科学", 1),
            ("ライフ", 1),
        ]
        .into_iter()
        .map(|(label, p)| (label.to_string(), p))
        .collect();

        Self {
            main_categories,
            sub_categories,
            unsuffixed: vec!["it".into(), "sci".into(), "top".into()],
            general_suffix: "総合".to_string(),
            fallback: "その他".to_string(),
            aliases: vec![Alias {
                from: "ビジネス".to_string(),
                to: "経済".to_string(),
            }],
            priorities,
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            site_name: "Yahoo!ニュース".to_string(),
            brand: "Yahoo!ニュース".to_string(),
            article_prefix: "https://news.yahoo.co.jp/articles/".to_string(),
            body_max_chars: 3000,
            unknown_provider: "不明".to_string(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_articles_per_category: 15,
            max_load_more: 1,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout_secs: 30,
            listing_settle_ms: 3000,
            article_settle_ms: 2000,
            load_more_timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { utc_offset_hours: 9 }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listing_settle(&self) -> Duration {
        Duration::from_millis(self.listing_settle_ms)
    }

    pub fn article_settle(&self) -> Duration {
        Duration::from_millis(self.article_settle_ms)
    }

    pub fn load_more_timeout(&self) -> Duration {
        Duration::from_secs(self.load_more_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl StoreConfig {
    /// The configured collection-time offset.
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "utc_offset_hours out of range: {}",
                    self.utc_offset_hours
                ))
            })
    }
}

impl Config {
    /// Load configuration from `path`, or the built-in defaults when `None`.
    #[instrument(level = "info")]
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let shown = path.display().to_string();
                let raw = fs::read_to_string(path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: shown.clone(),
                        source,
                    })?;
                let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                    path: shown.clone(),
                    source,
                })?;
                info!(path = %shown, "Loaded configuration file");
                config
            }
            None => {
                info!("No config file given; using built-in defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Reject configurations the resolver and store cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("no categories configured".into()));
        }
        if self.extract.body_max_chars == 0 {
            return Err(ConfigError::Invalid("body_max_chars must be positive".into()));
        }
        self.store.offset()?;

        let genre = &self.genre;
        for sub in &genre.sub_categories {
            if !genre.main_categories.iter().any(|m| m.code == sub.parent) {
                return Err(ConfigError::Invalid(format!(
                    "sub-category {} names unknown parent {}",
                    sub.code, sub.parent
                )));
            }
        }

        // A target containing any source would make normalization non-idempotent.
        for alias in &genre.aliases {
            if alias.from.is_empty() {
                return Err(ConfigError::Invalid("alias with empty source".into()));
            }
            if let Some(other) = genre.aliases.iter().find(|o| alias.to.contains(&o.from)) {
                return Err(ConfigError::Invalid(format!(
                    "alias target {:?} contains alias source {:?}",
                    alias.to, other.from
                )));
            }
        }
        Ok(())
    }
}
