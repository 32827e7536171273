use std::net::IpAddr;

use thiserror::Error;
use url::{Host, Url};

/// Why a URL-shaped token from a command body was refused.
#[derive(Error, Debug)]
pub enum UrlError {
    #[error("Invalid URL: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Host is not a fully qualified name: {0}")]
    UnqualifiedHost(String),
    /// Localhost or a private/link-local address; the bot would be fetching
    /// from inside its own network.
    #[error("Internal address not allowed: {0}")]
    Internal(String),
}

const LEADING: &[char] = &['<', '(', '[', '"', '\''];
const TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', '>', ']', '"', '\''];

/// Pull every acceptable feed URL out of a plain-text command body.
///
/// Tokens are whitespace separated. A token counts when it starts with
/// `http://` or `https://` once wrapping punctuation is removed and passes
/// [`validate_feed_url`]. Duplicates are dropped, first occurrence wins.
pub fn extract_urls(body: &str) -> Vec<Url> {
    let mut found: Vec<Url> = Vec::new();

    for token in body.split_whitespace() {
        let candidate = token
            .trim_start_matches(LEADING)
            .trim_end_matches(TRAILING);
        let lower = candidate.to_ascii_lowercase();
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            continue;
        }

        match validate_feed_url(candidate) {
            Ok(url) => {
                if !found.contains(&url) {
                    found.push(url);
                }
            }
            Err(e) => {
                tracing::debug!(token = %candidate, error = %e, "Ignoring URL in command body");
            }
        }
    }

    found
}

/// Parse `raw` and check it is a public http(s) URL.
pub fn validate_feed_url(raw: &str) -> Result<Url, UrlError> {
    let url = Url::parse(raw)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }

    let ip = match url.host().ok_or(UrlError::MissingHost)? {
        Host::Domain(domain) if domain.eq_ignore_ascii_case("localhost") => {
            return Err(UrlError::Internal(domain.to_owned()));
        }
        Host::Domain(domain) if !domain.contains('.') || domain.ends_with('.') => {
            return Err(UrlError::UnqualifiedHost(domain.to_owned()));
        }
        Host::Domain(_) => None,
        Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
    };

    if let Some(ip) = ip.filter(is_internal) {
        return Err(UrlError::Internal(ip.to_string()));
    }

    Ok(url)
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
        }
    }
}
