//! Per-subscriber dedup and digest assembly.
//!
//! Each subscription carries a watermark: the fingerprint of the newest item
//! already mailed. Feeds list items newest first, so everything in front of
//! the watermark is new. A watermark that no longer appears in the feed
//! (the item rotated out) makes the whole feed new again.

use thiserror::Error;

use crate::feed::{CacheEntries, FeedItem};
use crate::storage::Subscriptions;
use crate::util::{escape_html, truncate_chars};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    /// A subscribed URL has no cache entry. Subscribe and feed-poll register
    /// every subscribed URL, so this is a bug rather than a feed problem.
    #[error("Subscribed feed '{url}' is missing from the feed cache")]
    MissingCacheEntry { url: String },
}

/// Items newer than a watermark, plus the watermark to store once they
/// have been delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredItems<'a> {
    pub items: &'a [FeedItem],
    /// Fingerprint of the feed's head item; `None` for an empty feed.
    pub next_hash: Option<String>,
}

/// Cut `items` at the first item whose fingerprint equals `last_sent_hash`.
///
/// ```
/// use rss_email::digest::filter_new_items;
/// use rss_email::feed::FeedItem;
///
/// let item = |t: &str| FeedItem {
///     title: t.into(),
///     published: String::new(),
///     link: None,
///     summary: None,
/// };
/// let items = vec![item("A"), item("B"), item("C")];
///
/// let filtered = filter_new_items(&items, Some(&items[1].fingerprint()));
/// assert_eq!(filtered.items, &items[..1]);
/// assert_eq!(filtered.next_hash, Some(items[0].fingerprint()));
/// ```
pub fn filter_new_items<'a>(items: &'a [FeedItem], last_sent_hash: Option<&str>) -> FilteredItems<'a> {
    let next_hash = items.first().map(FeedItem::fingerprint);

    let cut = last_sent_hash
        .and_then(|watermark| {
            items
                .iter()
                .position(|item| item.fingerprint() == watermark)
        })
        .unwrap_or(items.len());

    FilteredItems {
        items: &items[..cut],
        next_hash,
    }
}

/// Rendering limits. They shape the mail only; watermarks always advance to
/// the feed head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOptions {
    /// 0 = unlimited
    pub max_items_per_feed: usize,
    /// 0 = untruncated
    pub summary_max_chars: usize,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            max_items_per_feed: 0,
            summary_max_chars: 280,
        }
    }
}

/// New items of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSection {
    pub url: String,
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

/// One subscriber's pending digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    /// Feeds with at least one new item, in subscription order
    pub sections: Vec<FeedSection>,
    /// Feeds the subscriber follows
    pub expected: usize,
    /// Feeds with fetched content behind them
    pub included: usize,
    /// `(url, fingerprint)` to store after a successful send
    pub watermarks: Vec<(String, String)>,
    options: DigestOptions,
}

/// Build the digest for one subscriber.
///
/// Feeds never fetched successfully are counted in `expected` but skipped.
/// Returns `Ok(None)` when nothing is new across all feeds.
///
/// # Errors
///
/// [`DigestError::MissingCacheEntry`] if a subscribed URL is absent from
/// `cache`.
pub fn build_digest(
    subscriptions: &Subscriptions,
    cache: &CacheEntries,
    options: &DigestOptions,
) -> Result<Option<Digest>, DigestError> {
    let mut sections = Vec::new();
    let mut watermarks = Vec::new();
    let mut included = 0;

    for (url, subscription) in subscriptions {
        let entry = cache
            .get(url)
            .ok_or_else(|| DigestError::MissingCacheEntry { url: url.clone() })?;

        if !entry.is_populated() {
            continue;
        }
        included += 1;

        let filtered = filter_new_items(&entry.items, subscription.last_sent_hash.as_deref());
        if let Some(hash) = filtered.next_hash {
            watermarks.push((url.clone(), hash));
        }
        if !filtered.items.is_empty() {
            sections.push(FeedSection {
                url: url.clone(),
                title: entry.title.clone(),
                items: filtered.items.to_vec(),
            });
        }
    }

    if sections.is_empty() {
        return Ok(None);
    }

    Ok(Some(Digest {
        sections,
        expected: subscriptions.len(),
        included,
        watermarks,
        options: options.clone(),
    }))
}

impl Digest {
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }

    /// Record the delivered heads. Call only after the mailer accepted the
    /// digest.
    pub fn commit(&self, subscriptions: &mut Subscriptions) {
        for (url, hash) in &self.watermarks {
            if let Some(subscription) = subscriptions.get_mut(url) {
                subscription.last_sent_hash = Some(hash.clone());
            }
        }
    }

    pub fn render_html(&self) -> String {
        let mut html = String::new();

        if self.expected != self.included {
            html.push_str(&format!(
                "<p><em>Showing {} of {} subscribed feeds. The others have not been fetched successfully yet.</em></p>\n",
                self.included, self.expected
            ));
        }

        for section in &self.sections {
            let heading = section.title.as_deref().unwrap_or(section.url.as_str());
            html.push_str(&format!("<h2>{}</h2>\n<ul>\n", escape_html(heading)));

            let shown = match self.options.max_items_per_feed {
                0 => section.items.len(),
                max => max.min(section.items.len()),
            };
            for item in &section.items[..shown] {
                html.push_str(&render_item(item, self.options.summary_max_chars));
            }
            if shown < section.items.len() {
                html.push_str(&format!(
                    "<li><em>and {} more</em></li>\n",
                    section.items.len() - shown
                ));
            }
            html.push_str("</ul>\n");
        }

        html
    }
}

fn render_item(item: &FeedItem, summary_max_chars: usize) -> String {
    let title = escape_html(if item.title.is_empty() {
        "(untitled)"
    } else {
        item.title.as_str()
    });

    let mut html = String::from("<li>");
    match item.link.as_deref().filter(|l| l.starts_with("http://") || l.starts_with("https://")) {
        Some(link) => html.push_str(&format!("<a href=\"{}\">{}</a>", escape_html(link), title)),
        None => html.push_str(&title),
    }
    if !item.published.is_empty() {
        html.push_str(&format!(" <small>{}</small>", escape_html(&item.published)));
    }
    if let Some(summary) = item.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let summary = truncate_chars(summary, summary_max_chars);
        html.push_str(&format!("<p>{}</p>", escape_html(&summary)));
    }
    html.push_str("</li>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedCacheEntry;
    use crate::storage::FeedSubscription;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn item(title: &str) -> FeedItem {
        FeedItem {
            title: title.to_string(),
            published: "2024-10-21T07:28:00+00:00".to_string(),
            link: Some(format!("https://example.com/{title}")),
            summary: None,
        }
    }

    fn populated(items: Vec<FeedItem>) -> FeedCacheEntry {
        FeedCacheEntry {
            title: Some("Example".into()),
            items,
            last_fetched: Some(Utc::now()),
            ..FeedCacheEntry::default()
        }
    }

    fn subscriptions(entries: &[(&str, Option<String>)]) -> Subscriptions {
        entries
            .iter()
            .map(|(url, hash)| {
                (
                    url.to_string(),
                    FeedSubscription {
                        last_sent_hash: hash.clone(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_filter_stops_at_watermark() {
        let items = vec![item("A"), item("B"), item("C")];
        let filtered = filter_new_items(&items, Some(&items[1].fingerprint()));
        assert_eq!(filtered.items, &items[..1]);
        assert_eq!(filtered.next_hash, Some(items[0].fingerprint()));
    }

    #[test]
    fn test_filter_never_sent_returns_everything() {
        let items = vec![item("A"), item("B"), item("C")];
        let filtered = filter_new_items(&items, None);
        assert_eq!(filtered.items, &items[..]);
    }

    #[test]
    fn test_filter_watermark_fell_off_returns_everything() {
        let items = vec![item("D"), item("E")];
        let gone = item("A").fingerprint();
        let filtered = filter_new_items(&items, Some(&gone));
        assert_eq!(filtered.items.len(), 2);
    }

    #[test]
    fn test_filter_head_is_watermark() {
        let items = vec![item("A"), item("B")];
        let filtered = filter_new_items(&items, Some(&items[0].fingerprint()));
        assert!(filtered.items.is_empty());
        assert_eq!(filtered.next_hash, Some(items[0].fingerprint()));
    }

    #[test]
    fn test_filter_empty_feed() {
        let filtered = filter_new_items(&[], Some("abc"));
        assert!(filtered.items.is_empty());
        assert_eq!(filtered.next_hash, None);
    }

    #[test]
    fn test_missing_cache_entry_is_an_error() {
        let subs = subscriptions(&[("https://a.example/feed", None)]);
        let err = build_digest(&subs, &CacheEntries::new(), &DigestOptions::default()).unwrap_err();
        assert_eq!(
            err,
            DigestError::MissingCacheEntry {
                url: "https://a.example/feed".into()
            }
        );
    }

    #[test]
    fn test_unfetched_feeds_counted_but_skipped() {
        let subs = subscriptions(&[
            ("https://a.example/feed", None),
            ("https://b.example/feed", None),
        ]);
        let mut cache = CacheEntries::new();
        cache.insert("https://a.example/feed".into(), populated(vec![item("A")]));
        cache.insert("https://b.example/feed".into(), FeedCacheEntry::default());

        let digest = build_digest(&subs, &cache, &DigestOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(digest.expected, 2);
        assert_eq!(digest.included, 1);
        assert_eq!(digest.sections.len(), 1);
        assert!(digest.render_html().contains("Showing 1 of 2 subscribed feeds"));
    }

    #[test]
    fn test_nothing_new_yields_none() {
        let items = vec![item("A"), item("B")];
        let head = items[0].fingerprint();
        let subs = subscriptions(&[("https://a.example/feed", Some(head))]);
        let mut cache = CacheEntries::new();
        cache.insert("https://a.example/feed".into(), populated(items));

        assert_eq!(build_digest(&subs, &cache, &DigestOptions::default()), Ok(None));
    }

    #[test]
    fn test_commit_advances_every_fetched_feed() {
        let a_items = vec![item("A2"), item("A1")];
        let b_items = vec![item("B1")];
        let mut subs = subscriptions(&[
            ("https://a.example/feed", Some(a_items[1].fingerprint())),
            ("https://b.example/feed", Some(b_items[0].fingerprint())),
        ]);
        let mut cache = CacheEntries::new();
        cache.insert("https://a.example/feed".into(), populated(a_items.clone()));
        cache.insert("https://b.example/feed".into(), populated(b_items.clone()));

        let digest = build_digest(&subs, &cache, &DigestOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(digest.item_count(), 1);
        digest.commit(&mut subs);

        assert_eq!(
            subs["https://a.example/feed"].last_sent_hash,
            Some(a_items[0].fingerprint())
        );
        assert_eq!(
            subs["https://b.example/feed"].last_sent_hash,
            Some(b_items[0].fingerprint())
        );
        assert_eq!(build_digest(&subs, &cache, &DigestOptions::default()), Ok(None));
    }

    #[test]
    fn test_render_limits_items_but_not_watermark() {
        let items = vec![item("A"), item("B"), item("C")];
        let subs = subscriptions(&[("https://a.example/feed", None)]);
        let mut cache = CacheEntries::new();
        cache.insert("https://a.example/feed".into(), populated(items.clone()));
        let options = DigestOptions {
            max_items_per_feed: 1,
            ..DigestOptions::default()
        };

        let digest = build_digest(&subs, &cache, &options).unwrap().unwrap();
        let html = digest.render_html();

        assert!(html.contains(">A</a>"));
        assert!(!html.contains(">B</a>"));
        assert!(html.contains("and 2 more"));
        assert_eq!(
            digest.watermarks,
            vec![("https://a.example/feed".to_string(), items[0].fingerprint())]
        );
    }

    #[test]
    fn test_render_escapes_and_truncates() {
        let mut entry = item("<script>");
        entry.link = Some("javascript:alert(1)".into());
        entry.summary = Some("x".repeat(50));
        let subs = subscriptions(&[("https://a.example/feed", None)]);
        let mut cache = CacheEntries::new();
        cache.insert("https://a.example/feed".into(), populated(vec![entry]));
        let options = DigestOptions {
            summary_max_chars: 10,
            ..DigestOptions::default()
        };

        let html = build_digest(&subs, &cache, &options)
            .unwrap()
            .unwrap()
            .render_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains(&format!("<p>{}...</p>", "x".repeat(7))));
    }

    proptest! {
        #[test]
        fn prop_filter_returns_prefix_before_watermark(
            titles in proptest::collection::btree_set("[a-z]{1,8}", 1..20),
            pick in any::<prop::sample::Index>(),
        ) {
            let items: Vec<FeedItem> = titles.iter().map(|t| item(t)).collect();
            let at = pick.index(items.len());

            let filtered = filter_new_items(&items, Some(&items[at].fingerprint()));

            prop_assert_eq!(filtered.items, &items[..at]);
            prop_assert_eq!(filtered.next_hash, Some(items[0].fingerprint()));
        }
    }
}
