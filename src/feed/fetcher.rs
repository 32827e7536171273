use crate::command::validate_feed_url;
use crate::feed::cache::{FeedCache, FeedError};
use crate::feed::parser::{parse_feed, ParseError, ParsedFeed};
use futures::stream::{self, StreamExt};
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 3;

/// Errors that can occur while fetching one feed.
///
/// Every variant except [`FetchError::Parse`] with an unknown format is
/// transient: the URL is tried again on the next feed-poll tick.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request and body download exceeded the per-URL timeout
    #[error("Request timed out")]
    Timeout,
    /// Body could not be read as a feed
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl FetchError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Parse(e) if e.is_permanent())
    }
}

impl From<&FetchError> for FeedError {
    fn from(err: &FetchError) -> Self {
        FeedError {
            message: err.to_string(),
            permanent: err.is_permanent(),
        }
    }
}

/// Tuning for a fetch pass.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upper bound for one URL, connect to last body byte
    pub request_timeout: Duration,
    /// Fetches in flight at once
    pub max_concurrent: usize,
    pub max_feed_bytes: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_concurrent: 10,
            max_feed_bytes: DEFAULT_MAX_FEED_SIZE,
        }
    }
}

/// HTTP client for feed downloads.
///
/// Follows at most three redirects, refuses loops, and refuses redirects
/// that point at localhost or a private address.
pub fn http_client(options: &FetchOptions) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .redirect(redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(options.request_timeout)
        .user_agent(concat!("rss-email/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }
        if let Err(e) = validate_feed_url(url.as_str()) {
            return attempt.error(format!("Redirect refused: {e}"));
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// A successfully downloaded and parsed feed.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub raw_content: Vec<u8>,
    pub feed: ParsedFeed,
}

/// Outcome counts of one fetch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_permanent: usize,
}

/// Refreshes every cached URL concurrently.
///
/// Targets are the cache's entries minus those marked with a permanent
/// error. Each URL is fetched outside any lock; only the cache update after
/// the fetch takes the write lock. A failing URL never affects the others,
/// and the pass waits for every launched fetch before returning.
///
/// # Behavior
///
/// - Fetches up to `options.max_concurrent` feeds simultaneously
/// - Each URL is bounded by `options.request_timeout`
/// - Success replaces content and clears the error; failure records the
///   error and keeps the previous content
pub async fn refresh_all(
    cache: &FeedCache,
    client: &reqwest::Client,
    options: &FetchOptions,
) -> FetchSummary {
    let (targets, skipped_permanent) = cache.fetch_targets().await;

    if skipped_permanent > 0 {
        tracing::info!(
            skipped = skipped_permanent,
            "Skipping feeds with a permanent error until they are resubscribed"
        );
    }

    let mut summary = FetchSummary {
        attempted: targets.len(),
        skipped_permanent,
        ..FetchSummary::default()
    };

    if targets.is_empty() {
        return summary;
    }

    let outcomes: Vec<bool> = stream::iter(targets)
        .map(|url| async move {
            match fetch_one(client, &url, options).await {
                Ok(fetched) => {
                    tracing::debug!(
                        url = %url,
                        items = fetched.feed.items.len(),
                        "Feed fetched"
                    );
                    if !cache
                        .record_success(&url, fetched.raw_content, fetched.feed)
                        .await
                    {
                        tracing::debug!(url = %url, "Feed unsubscribed during fetch, result dropped");
                    }
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        permanent = e.is_permanent(),
                        "Failed to fetch feed"
                    );
                    cache.record_failure(&url, FeedError::from(&e)).await;
                    false
                }
            }
        })
        .buffer_unordered(options.max_concurrent.max(1))
        .collect()
        .await;

    summary.succeeded = outcomes.iter().filter(|ok| **ok).count();
    summary.failed = outcomes.len() - summary.succeeded;
    summary
}

/// Downloads and parses a single feed.
///
/// # Errors
///
/// - [`FetchError::Timeout`] - the whole download exceeded the timeout
/// - [`FetchError::Network`] - connection or TLS errors
/// - [`FetchError::HttpStatus`] - non-2xx HTTP response
/// - [`FetchError::ResponseTooLarge`] - body over `max_feed_bytes`
/// - [`FetchError::IncompleteResponse`] - body shorter than Content-Length
/// - [`FetchError::Parse`] - not a feed, or a broken one
pub async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    options: &FetchOptions,
) -> Result<FetchedFeed, FetchError> {
    let bytes = tokio::time::timeout(
        options.request_timeout,
        download(client, url, options.max_feed_bytes),
    )
    .await
    .map_err(|_| FetchError::Timeout)??;

    let feed = parse_feed(&bytes)?;

    Ok(FetchedFeed {
        raw_content: bytes,
        feed,
    })
}

async fn download(client: &reqwest::Client, url: &str, limit: usize) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, limit).await
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
