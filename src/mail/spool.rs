use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{InboundMessage, Mailbox, TransportError};

const RECORD_EXTENSION: &str = "json";
const REJECTED_EXTENSION: &str = "json.rejected";

/// A directory of decoded inbound messages, one JSON record per file.
///
/// Whatever delivers mail (a fetchmail hook, an MTA pipe, a test) drops
/// `*.json` files of the form
/// `{"fromAddress": "...", "subject": "...", "plainTextBody": "..."}`.
/// Files are consumed in name order and deleted once read. Dotfiles are
/// ignored so writers can stage a record under a hidden name and rename it
/// into place.
#[derive(Debug, Clone)]
pub struct SpoolMailbox {
    dir: PathBuf,
}

impl SpoolMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn pending_records(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %self.dir.display(), "Inbox directory missing, nothing to read");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION);
            if is_record && !hidden && entry.file_type().await?.is_file() {
                records.push(path);
            }
        }
        records.sort();
        Ok(records)
    }
}

#[async_trait]
impl Mailbox for SpoolMailbox {
    /// Only a failure to list the directory fails the call. A record that
    /// cannot be read, consumed or set aside is logged and left in place for
    /// the next poll; the remaining records are still delivered.
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, TransportError> {
        let records = self.pending_records().await?;
        let mut messages = Vec::with_capacity(records.len());

        for path in records {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to read inbound record");
                    continue;
                }
            };
            match serde_json::from_slice::<InboundMessage>(&bytes) {
                Ok(message) => {
                    // Delivered only once the file is gone.
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => messages.push(message),
                        Err(e) => tracing::warn!(
                            file = %path.display(),
                            error = %e,
                            "Failed to consume inbound record, leaving it for the next poll"
                        ),
                    }
                }
                Err(e) => {
                    let rejected = path.with_extension(REJECTED_EXTENSION);
                    tracing::warn!(
                        file = %path.display(),
                        error = %e,
                        "Unreadable inbound record, setting it aside"
                    );
                    if let Err(e) = tokio::fs::rename(&path, &rejected).await {
                        tracing::warn!(
                            file = %path.display(),
                            error = %e,
                            "Failed to set inbound record aside"
                        );
                    }
                }
            }
        }

        if !messages.is_empty() {
            tracing::debug!(count = messages.len(), dir = %self.dir.display(), "Read inbound messages");
        }
        Ok(messages)
    }
}
