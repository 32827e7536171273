//! Configuration file parser for ~/.config/rss-email/config.toml.
//!
//! Every key has a default, so a missing or empty file loads fine; the
//! required keys are checked separately by [`Config::validate`] once CLI
//! overrides have been applied.
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::command::SubscriberAddress;
use crate::digest::DigestOptions;
use crate::feed::FetchOptions;
use crate::scheduler::{Schedule, MAX_PERIOD};

/// Environment variable that overrides `mailer.api_token`.
pub const API_TOKEN_ENV: &str = "RSS_EMAIL_API_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Missing required config key: {0}")]
    Missing(&'static str),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// The custom Debug impl masks the mail API token.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The bot's address: `From` of every outgoing mail.
    pub sender: String,

    /// JSON file holding the subscriber registry.
    pub state_path: PathBuf,

    /// Spool directory of inbound command messages.
    pub inbox_dir: PathBuf,

    pub intervals: Intervals,
    pub fetch: FetchSettings,
    pub digest: DigestSettings,
    pub mailer: MailerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub inbox_poll_secs: u64,
    pub feed_poll_secs: u64,
    pub digest_send_minutes: u64,
    pub stats_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub request_timeout_secs: u64,
    pub max_concurrent: usize,
    pub max_feed_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestSettings {
    /// Items rendered per feed (0 = unlimited).
    pub max_items_per_feed: usize,
    /// Summary length in characters (0 = untruncated).
    pub summary_max_chars: usize,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MailerSettings {
    /// Base URL of the email API; mail is POSTed to `{api_url}/email`.
    pub api_url: String,

    /// API token (alternative to the RSS_EMAIL_API_TOKEN env var).
    /// Env var takes precedence over config file.
    api_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            sender: String::new(),
            state_path: dir.join("subscribers.json"),
            inbox_dir: dir.join("inbox"),
            intervals: Intervals::default(),
            fetch: FetchSettings::default(),
            digest: DigestSettings::default(),
            mailer: MailerSettings::default(),
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            inbox_poll_secs: 300,
            feed_poll_secs: 1800,
            digest_send_minutes: 10,
            stats_secs: 20,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        let defaults = FetchOptions::default();
        Self {
            request_timeout_secs: defaults.request_timeout.as_secs(),
            max_concurrent: defaults.max_concurrent,
            max_feed_bytes: defaults.max_feed_bytes,
        }
    }
}

impl Default for DigestSettings {
    fn default() -> Self {
        let defaults = DigestOptions::default();
        Self {
            max_items_per_feed: defaults.max_items_per_feed,
            summary_max_chars: defaults.summary_max_chars,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("sender", &self.sender)
            .field("state_path", &self.state_path)
            .field("inbox_dir", &self.inbox_dir)
            .field("intervals", &self.intervals)
            .field("fetch", &self.fetch)
            .field("digest", &self.digest)
            .field("mailer", &self.mailer)
            .finish()
    }
}

impl std::fmt::Debug for MailerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailerSettings")
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// `~/.config/rss-email`, or `./.rss-email` when HOME is unset.
pub fn config_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("rss-email"),
        None => PathBuf::from(".rss-email"),
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "sender",
        "state_path",
        "inbox_dir",
        "intervals",
        "fetch",
        "digest",
        "mailer",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), sender = %config.sender, "Loaded configuration");
        Ok(config)
    }

    /// Check the keys that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.trim().is_empty() {
            return Err(ConfigError::Missing("sender"));
        }
        SubscriberAddress::parse(&self.sender).map_err(|e| ConfigError::Invalid {
            key: "sender",
            reason: e.to_string(),
        })?;

        if self.mailer.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("mailer.api_url"));
        }

        let positive = [
            ("intervals.inbox_poll_secs", self.intervals.inbox_poll_secs),
            ("intervals.feed_poll_secs", self.intervals.feed_poll_secs),
            ("intervals.digest_send_minutes", self.intervals.digest_send_minutes),
            ("intervals.stats_secs", self.intervals.stats_secs),
            ("fetch.request_timeout_secs", self.fetch.request_timeout_secs),
            ("fetch.max_concurrent", self.fetch.max_concurrent as u64),
            ("fetch.max_feed_bytes", self.fetch.max_feed_bytes as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let intervals = [
            ("intervals.inbox_poll_secs", self.intervals.inbox_poll_secs),
            ("intervals.feed_poll_secs", self.intervals.feed_poll_secs),
            (
                "intervals.digest_send_minutes",
                self.intervals.digest_send_minutes.saturating_mul(60),
            ),
            ("intervals.stats_secs", self.intervals.stats_secs),
        ];
        for (key, secs) in intervals {
            if secs > MAX_PERIOD.as_secs() {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at most one year".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn schedule(&self) -> Schedule {
        Schedule {
            inbox_poll: Duration::from_secs(self.intervals.inbox_poll_secs),
            feed_poll: Duration::from_secs(self.intervals.feed_poll_secs),
            digest_send: Duration::from_secs(self.intervals.digest_send_minutes.saturating_mul(60)),
            stats: Duration::from_secs(self.intervals.stats_secs),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            request_timeout: Duration::from_secs(self.fetch.request_timeout_secs),
            max_concurrent: self.fetch.max_concurrent,
            max_feed_bytes: self.fetch.max_feed_bytes,
        }
    }

    pub fn digest_options(&self) -> DigestOptions {
        DigestOptions {
            max_items_per_feed: self.digest.max_items_per_feed,
            summary_max_chars: self.digest.summary_max_chars,
        }
    }
}

impl MailerSettings {
    /// The API token, from the environment first, then the file.
    pub fn api_token(&self) -> Option<SecretString> {
        resolve_token(std::env::var(API_TOKEN_ENV).ok(), self.api_token.as_deref())
    }
}

fn resolve_token(env: Option<String>, file: Option<&str>) -> Option<SecretString> {
    env.filter(|t| !t.is_empty())
        .or_else(|| file.filter(|t| !t.is_empty()).map(str::to_owned))
        .map(SecretString::from)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sender.is_empty());
        assert!(config.state_path.ends_with("subscribers.json"));
        assert!(config.inbox_dir.ends_with("inbox"));
        assert_eq!(config.intervals.inbox_poll_secs, 300);
        assert_eq!(config.intervals.feed_poll_secs, 1800);
        assert_eq!(config.intervals.digest_send_minutes, 10);
        assert_eq!(config.intervals.stats_secs, 20);
        assert_eq!(config.fetch.request_timeout_secs, 30);
        assert_eq!(config.fetch.max_concurrent, 10);
        assert_eq!(config.fetch.max_feed_bytes, 10 * 1024 * 1024);
        assert_eq!(config.digest.max_items_per_feed, 0);
        assert_eq!(config.digest.summary_max_chars, 280);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.intervals.inbox_poll_secs, 300);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (_dir, path) = write_config("   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert!(config.sender.is_empty());
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
sender = "bot@example.com"
state_path = "/var/lib/rss-email/subscribers.json"
inbox_dir = "/var/spool/rss-email"

[intervals]
inbox_poll_secs = 60
feed_poll_secs = 900
digest_send_minutes = 30
stats_secs = 120

[fetch]
request_timeout_secs = 15
max_concurrent = 4
max_feed_bytes = 1048576

[digest]
max_items_per_feed = 20
summary_max_chars = 140

[mailer]
api_url = "https://mail.example.com/api"
api_token = "file-token"
"#,
        );

        let config = Config::load(&path).unwrap();
        config.validate().unwrap();

        assert_eq!(config.sender, "bot@example.com");
        assert_eq!(config.state_path, PathBuf::from("/var/lib/rss-email/subscribers.json"));
        assert_eq!(config.inbox_dir, PathBuf::from("/var/spool/rss-email"));
        assert_eq!(
            config.schedule(),
            Schedule {
                inbox_poll: Duration::from_secs(60),
                feed_poll: Duration::from_secs(900),
                digest_send: Duration::from_secs(1800),
                stats: Duration::from_secs(120),
            }
        );
        let fetch = config.fetch_options();
        assert_eq!(fetch.request_timeout, Duration::from_secs(15));
        assert_eq!(fetch.max_concurrent, 4);
        assert_eq!(fetch.max_feed_bytes, 1_048_576);
        assert_eq!(
            config.digest_options(),
            DigestOptions {
                max_items_per_feed: 20,
                summary_max_chars: 140,
            }
        );
        assert_eq!(config.mailer.api_url, "https://mail.example.com/api");
    }

    #[test]
    fn test_partial_section_uses_defaults_for_missing() {
        let (_dir, path) = write_config("[intervals]\nfeed_poll_secs = 60\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.intervals.feed_poll_secs, 60);
        assert_eq!(config.intervals.inbox_poll_secs, 300);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("[intervals]\nstats_secs = \"often\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("sender = \"bot@example.com\"\ntheme = \"dark\"\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sender, "bot@example.com");
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_validate_reports_missing_keys() {
        let mut config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("sender"))));

        config.sender = "bot@example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("mailer.api_url"))
        ));

        config.mailer.api_url = "https://mail.example.com".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sender = "not an address".into();
        config.mailer.api_url = "https://mail.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "sender", .. })
        ));

        config.sender = "bot@example.com".into();
        config.intervals.digest_send_minutes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "intervals.digest_send_minutes",
                ..
            })
        ));

        config.intervals.digest_send_minutes = 10;
        config.intervals.inbox_poll_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "intervals.inbox_poll_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_env_token_takes_precedence() {
        let token = resolve_token(Some("env-token".into()), Some("file-token")).unwrap();
        assert_eq!(token.expose_secret(), "env-token");

        let token = resolve_token(None, Some("file-token")).unwrap();
        assert_eq!(token.expose_secret(), "file-token");

        let token = resolve_token(Some(String::new()), Some("file-token")).unwrap();
        assert_eq!(token.expose_secret(), "file-token");

        assert!(resolve_token(None, None).is_none());
    }

    #[test]
    fn test_debug_masks_api_token() {
        let (_dir, path) = write_config("[mailer]\napi_token = \"super-secret-key-12345\"\n");
        let config = Config::load(&path).unwrap();

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-key-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
