//! Transport seams for command mail and outgoing replies.
//!
//! The engine only sees the [`Mailbox`] and [`Mailer`] traits. Two adapters
//! ship with the binary: [`SpoolMailbox`] reads already-decoded messages from
//! a directory and [`HttpMailer`] hands outgoing mail to a JSON email API.

mod http;
mod spool;

pub use http::HttpMailer;
pub use spool::SpoolMailbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Mail spool I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Mail API request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Mail API responded with status {0}")]
    Status(u16),
    #[error("Mail API request timed out")]
    Timeout,
    #[error("Insecure mail API URL: HTTPS required (except localhost)")]
    InsecureUrl,
}

impl TransportError {
    /// Transient failures worth another attempt within the same send.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Network(_) => true,
            TransportError::Status(status) => *status == 429 || *status >= 500,
            TransportError::Io(_) | TransportError::InsecureUrl => false,
        }
    }
}

/// A decoded command message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub from_address: String,
    pub subject: String,
    #[serde(default)]
    pub plain_text_body: String,
}

/// A message ready for the mailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to_address: String,
    pub subject: String,
    pub html_body: String,
}

/// Source of command messages not yet processed.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Return every unseen message and mark it seen. A message handed out
    /// once is never handed out again.
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, TransportError>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}
