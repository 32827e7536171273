//! Job bodies: the glue between the registries, the fetcher, the command
//! classifier, the digest filter and the mail transports.
//!
//! Lock order is always subscriber store first, then feed cache.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::{self, SubscriberAddress, SUBJECT_DIGEST};
use crate::digest::{build_digest, DigestError, DigestOptions};
use crate::feed::{refresh_all, FeedCache, FetchOptions, FetchSummary};
use crate::mail::{Mailbox, Mailer, OutboundMessage, TransportError};
use crate::scheduler::{JobKind, JobRunner};
use crate::storage::{StoreError, SubscriberStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Counts from one inbox-poll run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxSummary {
    pub received: usize,
    pub applied: usize,
    /// Invalid sender or the bot's own address
    pub ignored: usize,
    pub replies_sent: usize,
    pub replies_failed: usize,
}

/// Counts from one digest-send run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestSummary {
    pub sent: usize,
    pub failed: usize,
    /// Subscribers with nothing new
    pub up_to_date: usize,
}

/// Settings the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// The bot's own address; mail from it is ignored
    pub bot_address: String,
    pub fetch: FetchOptions,
    pub digest: DigestOptions,
}

pub struct Engine {
    store: Arc<SubscriberStore>,
    cache: Arc<FeedCache>,
    mailbox: Arc<dyn Mailbox>,
    mailer: Arc<dyn Mailer>,
    client: reqwest::Client,
    options: EngineOptions,
}

impl Engine {
    pub fn new(
        store: Arc<SubscriberStore>,
        cache: Arc<FeedCache>,
        mailbox: Arc<dyn Mailbox>,
        mailer: Arc<dyn Mailer>,
        client: reqwest::Client,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            cache,
            mailbox,
            mailer,
            client,
            options,
        }
    }

    pub fn store(&self) -> &Arc<SubscriberStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<FeedCache> {
        &self.cache
    }

    /// Apply every unseen command message and answer each one.
    ///
    /// Messages are fetched with no lock held. Commands are applied under the
    /// subscriber write lock, which also covers registering newly subscribed
    /// URLs in the feed cache and flushing the registry. Replies go out after
    /// the lock is released.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Transport`] if the mailbox cannot be read
    /// - [`EngineError::Store`] if the flush failed; replies were still sent
    pub async fn poll_inbox(&self) -> Result<InboxSummary, EngineError> {
        let messages = self.mailbox.fetch_unseen().await?;
        let mut summary = InboxSummary {
            received: messages.len(),
            ..InboxSummary::default()
        };
        if messages.is_empty() {
            return Ok(summary);
        }

        let mut replies = Vec::with_capacity(messages.len());
        let flushed = {
            let mut registry = self.store.write().await;
            let mut mutated = false;

            for message in messages {
                let sender = match SubscriberAddress::parse(&message.from_address) {
                    Ok(sender) => sender,
                    Err(e) => {
                        tracing::warn!(
                            from = %message.from_address,
                            error = %e,
                            "Ignoring message with invalid sender"
                        );
                        summary.ignored += 1;
                        continue;
                    }
                };
                if sender.as_str().eq_ignore_ascii_case(&self.options.bot_address) {
                    tracing::debug!(from = %sender, "Ignoring message from own address");
                    summary.ignored += 1;
                    continue;
                }

                let command = command::classify(&message.subject, &message.plain_text_body);
                tracing::debug!(from = %sender, command = ?command, "Applying command");
                let execution = command::execute(&mut registry, &sender, command);

                if let Some(urls) = &execution.subscribed {
                    self.cache.register(urls.iter().map(String::as_str)).await;
                }
                mutated |= execution.mutated;
                summary.applied += 1;

                replies.push(OutboundMessage {
                    to_address: sender.to_string(),
                    subject: execution.reply.subject.to_string(),
                    html_body: execution.reply.html_body,
                });
            }

            if mutated {
                self.store.persist(&registry).await
            } else {
                Ok(())
            }
        };

        if let Err(e) = &flushed {
            tracing::error!(error = %e, "Failed to persist subscriber state after commands");
        }

        for reply in &replies {
            match self.mailer.send(reply).await {
                Ok(()) => summary.replies_sent += 1,
                Err(e) => {
                    tracing::warn!(to = %reply.to_address, error = %e, "Failed to send reply");
                    summary.replies_failed += 1;
                }
            }
        }

        flushed?;
        Ok(summary)
    }

    /// Give every subscribed URL a cache entry and drop entries nobody
    /// subscribes to any more. Returns `(added, removed)`.
    ///
    /// Run once at startup so a digest pass before the first feed poll finds
    /// every subscribed URL.
    pub async fn sync_cache(&self) -> (usize, usize) {
        let registry = self.store.read().await;
        let (added, removed) = self.cache.sync(&registry.feed_urls()).await;
        if added > 0 || removed > 0 {
            tracing::info!(added, removed, "Feed cache synced with subscriptions");
        }
        (added, removed)
    }

    /// Bring the cache in line with the subscribed URLs, then refresh it.
    pub async fn poll_feeds(&self) -> FetchSummary {
        self.sync_cache().await;

        let summary = refresh_all(&self.cache, &self.client, &self.options.fetch).await;
        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_permanent = summary.skipped_permanent,
            "Feed refresh complete"
        );
        summary
    }

    /// Mail each subscriber the items they have not seen yet.
    ///
    /// Runs under the subscriber write lock and the cache read lock. A
    /// subscriber's watermarks move only after their digest was accepted by
    /// the mailer; a failed send leaves them for the next run and moves on.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Digest`] if a subscribed URL is missing from the cache;
    ///   watermarks committed earlier in the run are still flushed
    /// - [`EngineError::Store`] if committed watermarks could not be flushed
    pub async fn send_digests(&self) -> Result<DigestSummary, EngineError> {
        let mut registry = self.store.write().await;
        let cache = self.cache.read().await;
        let mut summary = DigestSummary::default();
        let mut aborted = None;

        for (address, subscriptions) in registry.iter_mut() {
            let digest = match build_digest(subscriptions, &cache, &self.options.digest) {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::error!(to = %address, error = %e, "Aborting digest run");
                    aborted = Some(e);
                    break;
                }
            };
            let Some(digest) = digest else {
                summary.up_to_date += 1;
                continue;
            };

            let message = OutboundMessage {
                to_address: address.clone(),
                subject: SUBJECT_DIGEST.to_string(),
                html_body: digest.render_html(),
            };
            match self.mailer.send(&message).await {
                Ok(()) => {
                    digest.commit(subscriptions);
                    summary.sent += 1;
                    tracing::debug!(
                        to = %address,
                        items = digest.item_count(),
                        feeds = digest.sections.len(),
                        "Digest delivered"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(to = %address, error = %e, "Failed to send digest, will retry next run");
                }
            }
        }
        drop(cache);

        // Watermarks of digests already mailed are flushed even when the run
        // was cut short.
        if summary.sent > 0 {
            self.store.persist(&registry).await?;
        }
        if let Some(e) = aborted {
            return Err(e.into());
        }

        tracing::info!(
            sent = summary.sent,
            failed = summary.failed,
            up_to_date = summary.up_to_date,
            "Digest run complete"
        );
        Ok(summary)
    }

    pub async fn log_stats(&self) {
        let registry = self.store.read().await;
        let cache = self.cache.stats().await;
        tracing::info!(
            subscribers = registry.subscriber_count(),
            subscriptions = registry.subscription_count(),
            feeds = cache.entries,
            fetched = cache.populated,
            failing = cache.failing,
            permanent = cache.permanent,
            "Stats"
        );
    }
}

#[async_trait]
impl JobRunner for Engine {
    async fn run_job(&self, kind: JobKind) -> anyhow::Result<()> {
        match kind {
            JobKind::InboxPoll => {
                let summary = self.poll_inbox().await?;
                if summary.received > 0 {
                    tracing::info!(
                        received = summary.received,
                        applied = summary.applied,
                        ignored = summary.ignored,
                        replies_sent = summary.replies_sent,
                        replies_failed = summary.replies_failed,
                        "Inbox processed"
                    );
                }
            }
            JobKind::FeedPoll => {
                self.poll_feeds().await;
            }
            JobKind::DigestSend => {
                self.send_digests().await?;
            }
            JobKind::Stats => self.log_stats().await,
        }
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.store.save().await?;
        Ok(())
    }
}
