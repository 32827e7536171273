use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while loading or flushing the subscriber registry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state file exists but could not be read
    #[error("Failed to read subscriber state '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The state file is not a valid registry document
    #[error("Subscriber state '{}' is not valid JSON: {source}", .path.display())]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The in-memory registry could not be serialized
    #[error("Failed to serialize subscriber state: {0}")]
    Encode(#[source] serde_json::Error),

    /// Writing or replacing the state file failed
    #[error("Failed to write subscriber state '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============================================================================
// Data Structures
// ============================================================================

/// One subscriber's interest in one feed. Keyed by the feed URL in
/// [`Subscriptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSubscription {
    /// Fingerprint of the newest item already mailed to this subscriber.
    /// `None` until the first digest containing the feed is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_hash: Option<String>,
}

/// A subscriber's feeds, keyed by feed URL.
pub type Subscriptions = BTreeMap<String, FeedSubscription>;

/// Address → subscriptions. Never holds an address with an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    subscribers: BTreeMap<String, Subscriptions>,
}

impl Registry {
    /// Replace the whole subscription set of `address` with `urls`, each
    /// starting with a fresh watermark.
    ///
    /// An empty `urls` removes the subscriber, so the registry never keeps an
    /// address without feeds. Returns the stored set, if any.
    pub fn upsert<I>(&mut self, address: &str, urls: I) -> Option<&Subscriptions>
    where
        I: IntoIterator<Item = String>,
    {
        let subscriptions: Subscriptions = urls
            .into_iter()
            .map(|url| (url, FeedSubscription::default()))
            .collect();

        if subscriptions.is_empty() {
            self.subscribers.remove(address);
            return None;
        }

        self.subscribers.insert(address.to_owned(), subscriptions);
        self.subscribers.get(address)
    }

    /// Remove `address`. Returns whether it was subscribed.
    pub fn remove(&mut self, address: &str) -> bool {
        self.subscribers.remove(address).is_some()
    }

    pub fn list(&self, address: &str) -> Option<&Subscriptions> {
        self.subscribers.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Subscriptions)> {
        self.subscribers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Subscriptions)> {
        self.subscribers.iter_mut()
    }

    /// Every distinct feed URL referenced by any subscriber.
    pub fn feed_urls(&self) -> BTreeSet<String> {
        self.subscribers
            .values()
            .flat_map(|subscriptions| subscriptions.keys().cloned())
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total (address, feed) pairs.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop addresses left without feeds. Returns how many were dropped.
    fn prune_empty(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, subscriptions| !subscriptions.is_empty());
        before - self.subscribers.len()
    }
}

// ============================================================================
// Store
// ============================================================================

/// The durable subscriber registry.
///
/// Wraps the [`Registry`] in a reader/writer lock and owns the JSON state
/// file it is flushed to. All mutation goes through [`SubscriberStore::write`].
#[derive(Debug)]
pub struct SubscriberStore {
    registry: RwLock<Registry>,
    path: Option<PathBuf>,
}

impl SubscriberStore {
    /// A store with no backing file. Flushes are no-ops.
    pub fn in_memory() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            path: None,
        }
    }

    /// Load the registry from `path`.
    ///
    /// - Missing file → empty store
    /// - Unreadable or malformed file → `Err`, the caller must not start
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let mut registry = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice::<Registry>(&bytes).map_err(|source| {
                    StoreError::Decode {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No subscriber state found, starting empty");
                Registry::default()
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };

        let dropped = registry.prune_empty();
        if dropped > 0 {
            tracing::warn!(path = %path.display(), dropped, "Dropped subscribers with no feeds");
        }

        tracing::info!(
            path = %path.display(),
            subscribers = registry.subscriber_count(),
            subscriptions = registry.subscription_count(),
            "Subscriber state restored"
        );

        Ok(Self {
            registry: RwLock::new(registry),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().await
    }

    /// Flush the whole registry under the read lock.
    pub async fn save(&self) -> Result<(), StoreError> {
        let registry = self.registry.read().await;
        self.persist(&registry).await
    }

    /// Flush `registry` for a caller that already holds a guard on it.
    ///
    /// The file is written to a sibling temp file, synced, then renamed over
    /// the target, so readers see either the old or the new document.
    pub async fn persist(&self, registry: &Registry) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            tracing::debug!("Subscriber store is in-memory only, skipping flush");
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(registry).map_err(StoreError::Encode)?;
        write_atomic(path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %path.display(),
            subscribers = registry.subscriber_count(),
            "Subscriber state flushed"
        );
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Unpredictable temp name, created exclusively
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{suffix:016x}"));

    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(windows)]
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }

        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}
