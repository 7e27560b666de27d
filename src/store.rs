//! The per-run dedup/merge store.
//!
//! The same article often appears on several category listings, each time
//! with a different genre signal. [`RunStore`] keeps exactly one record per
//! URL and decides which candidate survives:
//!
//! 1. higher [`PriorityTable`] rank wins,
//! 2. on equal rank, the strictly longer (more specific) genre label wins,
//! 3. otherwise the stored record is kept.

use crate::models::ArticleRecord;
use std::collections::HashMap;
use tracing::debug;

/// Genre label → merge priority. Unmapped labels rank 0.
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    ranks: HashMap<String, u8>,
    general_suffix: String,
}

impl PriorityTable {
    /// Build a table from label ranks.
    ///
    /// `general_suffix` is the marker appended to a main label when no
    /// sub-category is known (`経済` → `経済総合`), so those labels rank like
    /// their main category.
    pub fn new(ranks: HashMap<String, u8>, general_suffix: impl Into<String>) -> Self {
        Self {
            ranks,
            general_suffix: general_suffix.into(),
        }
    }

    /// Rank of `genre`.
    ///
    /// Lookup order:
    /// 1. the full label (`経済/市況・株式`)
    /// 2. the main part before the first `/` (`経済`)
    /// 3. that main part without the general suffix (`経済総合` → `経済`)
    ///
    /// # Returns
    ///
    /// The first rank found, or 0 when none of the forms is mapped.
    pub fn priority(&self, genre: &str) -> u8 {
        if let Some(rank) = self.ranks.get(genre) {
            return *rank;
        }
        let main = genre.split_once('/').map_or(genre, |(main, _)| main);
        if let Some(rank) = self.ranks.get(main) {
            return *rank;
        }
        if self.general_suffix.is_empty() {
            return 0;
        }
        main.strip_suffix(self.general_suffix.as_str())
            .filter(|m| !m.is_empty())
            .and_then(|m| self.ranks.get(m))
            .copied()
            .unwrap_or(0)
    }
}

/// What [`RunStore::upsert`] did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Kept,
}

/// Best record per URL for the current run, in first-seen order.
#[derive(Debug, Default)]
pub struct RunStore {
    priorities: PriorityTable,
    records: HashMap<String, ArticleRecord>,
    order: Vec<String>,
}

impl RunStore {
    pub fn new(priorities: PriorityTable) -> Self {
        Self {
            priorities,
            records: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Merge `candidate` into the store under its URL.
    ///
    /// The candidate replaces the stored record only if it ranks strictly
    /// higher, or ranks equal with a strictly longer genre label (counted in
    /// characters). On an exact tie the record applied first stays.
    ///
    /// # Returns
    ///
    /// [`UpsertOutcome::Inserted`] for a new URL, [`UpsertOutcome::Replaced`]
    /// when the candidate won, [`UpsertOutcome::Kept`] otherwise.
    pub fn upsert(&mut self, candidate: ArticleRecord) -> UpsertOutcome {
        let Some(existing) = self.records.get(&candidate.url) else {
            self.order.push(candidate.url.clone());
            self.records.insert(candidate.url.clone(), candidate);
            return UpsertOutcome::Inserted;
        };

        let new_rank = self.priorities.priority(&candidate.genre);
        let old_rank = self.priorities.priority(&existing.genre);
        let more_specific = candidate.genre.chars().count() > existing.genre.chars().count();

        if new_rank > old_rank || (new_rank == old_rank && more_specific) {
            debug!(
                url = %candidate.url,
                from = %existing.genre,
                to = %candidate.genre,
                "Replacing stored record with better genre"
            );
            self.records.insert(candidate.url.clone(), candidate);
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Kept
        }
    }

    pub fn get(&self, url: &str) -> Option<&ArticleRecord> {
        self.records.get(url)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All records, in the order their URLs were first inserted.
    pub fn into_records(mut self) -> Vec<ArticleRecord> {
        self.order
            .iter()
            .filter_map(|url| self.records.remove(url))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenreConfig;
    use chrono::{FixedOffset, TimeZone};

    const URL: &str = "https://news.yahoo.co.jp/articles/abc";

    fn table() -> PriorityTable {
        let genre = GenreConfig::default();
        PriorityTable::new(genre.priorities, genre.general_suffix)
    }

    fn store() -> RunStore {
        RunStore::new(table())
    }

    fn record(url: &str, genre: &str, title: &str) -> ArticleRecord {
        ArticleRecord {
            id: "abc".to_string(),
            collected_at: FixedOffset::east_opt(9 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 5, 6, 9, 0, 0)
                .unwrap(),
            title: title.to_string(),
            provider: "共同通信".to_string(),
            published_at: String::new(),
            url: url.to_string(),
            genre: genre.to_string(),
            body: "本文".to_string(),
        }
    }

    #[test]
    fn test_priority_lookup() {
        let table = table();
        assert_eq!(table.priority("国内"), 0);
        assert_eq!(table.priority("経済総合"), 1);
        assert_eq!(table.priority("経済総合"), table.priority("経済/経済総合"));
        assert_eq!(table.priority("スポーツ総合"), 1);
        assert_eq!(table.priority("総合"), 0);
        assert_eq!(table.priority("地域/北海道・東北"), 0);
        assert_eq!(table.priority("経済"), 1);
        assert_eq!(table.priority("経済/市況・株式"), 1);
        assert_eq!(table.priority("その他"), 0);
        assert_eq!(table.priority("国内総合"), 0);
    }

    #[test]
    fn test_domestic_then_local_then_business() {
        let mut store = store();
        assert_eq!(store.upsert(record(URL, "国内", "a")), UpsertOutcome::Inserted);
        // Same rank, longer label.
        assert_eq!(
            store.upsert(record(URL, "地域/北海道・東北", "b")),
            UpsertOutcome::Replaced
        );
        assert_eq!(store.get(URL).unwrap().genre, "地域/北海道・東北");
        // Higher rank wins even with a shorter label.
        assert_eq!(store.upsert(record(URL, "経済", "c")), UpsertOutcome::Replaced);
        assert_eq!(store.get(URL).unwrap().genre, "経済");
        // Lower rank never wins.
        assert_eq!(
            store.upsert(record(URL, "地域/北海道・東北/長い", "d")),
            UpsertOutcome::Kept
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_exact_tie_keeps_first_applied_record() {
        let mut store = store();
        store.upsert(record(URL, "国際/北米", "first"));
        assert_eq!(store.upsert(record(URL, "国内", "low")), UpsertOutcome::Kept);
        assert_eq!(store.upsert(record(URL, "経済/産業", "last")), UpsertOutcome::Kept);
        let stored = store.get(URL).unwrap();
        assert_eq!(stored.title, "first");
        assert_eq!(stored.genre, "国際/北米");
    }

    #[test]
    fn test_two_crumb_label_outranks_domestic() {
        let mut store = store();
        store.upsert(record(URL, "国内/社会", "a"));
        assert_eq!(store.upsert(record(URL, "経済総合", "b")), UpsertOutcome::Replaced);
        assert_eq!(store.get(URL).unwrap().genre, "経済総合");
    }

    #[test]
    fn test_final_record_has_max_priority_and_longest_label() {
        let sequences: [&[&str]; 3] = [
            &["国内", "経済", "地域/関東", "経済/市況・株式", "国際"],
            &["経済/市況・株式", "国内", "国際/北米", "その他"],
            &["その他", "国内総合", "地域"],
        ];
        let table = table();

        for genres in sequences {
            let mut store = store();
            for (i, genre) in genres.iter().enumerate() {
                store.upsert(record(URL, genre, &i.to_string()));
            }
            let best_rank = genres.iter().map(|g| table.priority(g)).max().unwrap();
            let best_len = genres
                .iter()
                .filter(|g| table.priority(g) == best_rank)
                .map(|g| g.chars().count())
                .max()
                .unwrap();
            let stored = store.get(URL).unwrap();
            assert_eq!(table.priority(&stored.genre), best_rank);
            assert_eq!(stored.genre.chars().count(), best_len);
        }
    }

    #[test]
    fn test_records_keep_first_seen_order() {
        let mut store = store();
        store.upsert(record("https://x/articles/1", "国内", "1"));
        store.upsert(record("https://x/articles/2", "国内", "2"));
        store.upsert(record("https://x/articles/1", "経済", "1b"));
        store.upsert(record("https://x/articles/3", "国内", "3"));

        let urls: Vec<String> = store.into_records().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec!["https://x/articles/1", "https://x/articles/2", "https://x/articles/3"]
        );
    }
}
