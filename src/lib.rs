//! An email-driven RSS subscription bot.
//!
//! Subscribers mail commands (`rss-email subscribe` / `list` /
//! `unsubscribe`) to the bot. The bot polls the subscribed feeds, remembers
//! per subscriber and feed the newest item already sent, and mails periodic
//! digests of whatever is new.
//!
//! - [`storage`] - durable subscriber registry
//! - [`feed`] - concurrent fetching, parsing and the shared feed cache
//! - [`command`] - command classification and replies
//! - [`digest`] - per-subscriber dedup and digest rendering
//! - [`scheduler`] - single-flight periodic jobs with graceful shutdown
//! - [`engine`] - the job bodies wiring it all together
//! - [`mail`] - inbound and outbound transport seams

pub mod command;
pub mod config;
pub mod digest;
pub mod engine;
pub mod feed;
pub mod mail;
pub mod scheduler;
pub mod storage;
pub mod util;
