use feed_rs::parser::{self, ParseErrorKind, ParseFeedError};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while turning a fetched body into feed items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The document has no RSS, Atom or JSON Feed root. Retrying will not help.
    #[error("Failed to detect feed type")]
    UnknownFormat,
    /// The document looks like a feed but could not be read
    #[error("Malformed feed: {0}")]
    Malformed(String),
}

impl ParseError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ParseError::UnknownFormat)
    }
}

/// A single entry of a parsed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    /// Publication time as delivered, rendered to RFC 3339. Empty when the
    /// feed carries neither a published nor an updated date.
    pub published: String,
    pub link: Option<String>,
    pub summary: Option<String>,
}

impl FeedItem {
    /// Content fingerprint used to recognise an item already sent.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.title, &self.published)
    }
}

/// SHA-256 over `title ++ published`, hex encoded.
pub fn fingerprint(title: &str, published: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(published.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    /// Entries in document order, which feeds deliver newest first.
    pub items: Vec<FeedItem>,
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes).map_err(classify)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry
                .published
                .or(entry.updated)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default();
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry.title.map(|t| t.content).unwrap_or_default();

            FeedItem {
                title,
                published,
                link,
                summary,
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content),
        items,
    })
}

fn classify(err: ParseFeedError) -> ParseError {
    match err {
        ParseFeedError::ParseError(ParseErrorKind::NoFeedRoot) => ParseError::UnknownFormat,
        other => ParseError::Malformed(other.to_string()),
    }
}
