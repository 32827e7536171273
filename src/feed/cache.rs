//! Process-lifetime cache of fetched feeds, shared by every subscriber of a URL.
//!
//! The cache is rebuildable: losing it on restart costs one fetch cycle. An
//! entry exists for every subscribed URL (feed-poll and subscribe keep it in
//! step with the subscriber registry), but only entries with a successful
//! fetch behind them carry items.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard};

use super::parser::{FeedItem, ParsedFeed};

/// The last fetch failure recorded for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError {
    pub message: String,
    /// Non-retriable: the URL is skipped until it is subscribed again
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FeedCacheEntry {
    /// Body of the last successful fetch
    pub raw_content: Vec<u8>,
    pub title: Option<String>,
    /// Newest first, as delivered by the feed
    pub items: Vec<FeedItem>,
    /// Unset until the first successful fetch
    pub last_fetched: Option<DateTime<Utc>>,
    /// Sticky until the next fetch succeeds or fails differently
    pub last_error: Option<FeedError>,
}

impl FeedCacheEntry {
    pub fn is_populated(&self) -> bool {
        self.last_fetched.is_some()
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.last_error.as_ref().is_some_and(|e| e.permanent)
    }
}

pub type CacheEntries = HashMap<String, FeedCacheEntry>;

/// Aggregate counts for the stats job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub populated: usize,
    pub failing: usize,
    pub permanent: usize,
}

#[derive(Debug, Default)]
pub struct FeedCache {
    entries: RwLock<CacheEntries>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read guard over the whole registry, held by digest-send for its pass.
    pub async fn read(&self) -> RwLockReadGuard<'_, CacheEntries> {
        self.entries.read().await
    }

    pub async fn get(&self, url: &str) -> Option<FeedCacheEntry> {
        self.entries.read().await.get(url).cloned()
    }

    /// Make sure every URL in `urls` has an entry, and lift a permanent error
    /// from those that already do. Called when a subscriber names the URLs.
    pub async fn register<'a, I>(&self, urls: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = self.entries.write().await;
        for url in urls {
            let entry = entries.entry(url.to_owned()).or_default();
            if entry.is_permanently_failed() {
                tracing::info!(url = %url, "Resubscribed feed, clearing permanent error");
                entry.last_error = None;
            }
        }
    }

    /// Align the cache with the subscribed URL set: create entries for new
    /// URLs and drop those nobody references any more.
    ///
    /// Returns `(added, removed)`.
    pub async fn sync(&self, wanted: &BTreeSet<String>) -> (usize, usize) {
        let mut entries = self.entries.write().await;

        let before = entries.len();
        entries.retain(|url, _| wanted.contains(url));
        let removed = before - entries.len();

        let mut added = 0;
        for url in wanted {
            if !entries.contains_key(url) {
                entries.insert(url.clone(), FeedCacheEntry::default());
                added += 1;
            }
        }

        (added, removed)
    }

    /// URLs worth fetching this cycle, and how many were skipped for a
    /// permanent error.
    pub async fn fetch_targets(&self) -> (Vec<String>, usize) {
        let entries = self.entries.read().await;
        let mut skipped = 0;
        let mut targets: Vec<String> = entries
            .iter()
            .filter_map(|(url, entry)| {
                if entry.is_permanently_failed() {
                    skipped += 1;
                    None
                } else {
                    Some(url.clone())
                }
            })
            .collect();
        targets.sort();
        (targets, skipped)
    }

    /// Store a successful fetch. Returns `false` if the URL was dropped from
    /// the cache while the fetch was in flight.
    pub async fn record_success(&self, url: &str, raw_content: Vec<u8>, feed: ParsedFeed) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(url) else {
            return false;
        };
        entry.raw_content = raw_content;
        entry.title = feed.title;
        entry.items = feed.items;
        entry.last_fetched = Some(Utc::now());
        entry.last_error = None;
        true
    }

    /// Store a failed fetch, leaving the previous content untouched.
    pub async fn record_failure(&self, url: &str, error: FeedError) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(url) else {
            return false;
        };
        entry.last_error = Some(error);
        true
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        stats_of(&entries)
    }
}

pub fn stats_of(entries: &CacheEntries) -> CacheStats {
    entries.values().fold(
        CacheStats {
            entries: entries.len(),
            ..CacheStats::default()
        },
        |mut stats, entry| {
            if entry.is_populated() {
                stats.populated += 1;
            }
            if entry.last_error.is_some() {
                stats.failing += 1;
            }
            if entry.is_permanently_failed() {
                stats.permanent += 1;
            }
            stats
        },
    )
}
