//! Feed fetching, parsing and the shared per-URL cache.
//!
//! - [`parser`] - feed-rs parsing into [`FeedItem`]s with a content fingerprint
//! - [`cache`] - process-lifetime [`FeedCache`], one entry per subscribed URL
//! - [`fetcher`] - concurrent refresh of every cached URL with per-URL isolation

pub mod cache;
pub mod fetcher;
pub mod parser;

pub use cache::{CacheEntries, CacheStats, FeedCache, FeedCacheEntry, FeedError};
pub use fetcher::{fetch_one, http_client, refresh_all, FetchError, FetchOptions, FetchSummary, FetchedFeed};
pub use parser::{fingerprint, parse_feed, FeedItem, ParseError, ParsedFeed};
