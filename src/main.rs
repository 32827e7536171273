use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use rss_email::config::{default_config_path, Config};
use rss_email::engine::{Engine, EngineOptions};
use rss_email::feed::{http_client, FeedCache};
use rss_email::mail::{HttpMailer, SpoolMailbox};
use rss_email::scheduler::{JobKind, Scheduler};
use rss_email::storage::SubscriberStore;

#[derive(Parser, Debug)]
#[command(name = "rss-email", about = "Email-driven RSS subscription bot", version)]
struct Args {
    /// Config file (default: ~/.config/rss-email/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subscriber state file, overrides `state_path`
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Minutes between digest runs, overrides `intervals.digest_send_minutes`
    #[arg(long, value_name = "MINUTES")]
    digest_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;
    if let Some(state) = args.state {
        config.state_path = state;
    }
    if let Some(minutes) = args.digest_interval {
        config.intervals.digest_send_minutes = minutes;
    }
    config.validate().context("Invalid configuration")?;
    tracing::debug!(config = ?config, "Effective configuration");

    // A state file that exists but cannot be read must not be replaced by an
    // empty registry on the first flush.
    let store = Arc::new(
        SubscriberStore::load(&config.state_path)
            .await
            .context("Failed to load subscriber state")?,
    );

    let fetch = config.fetch_options();
    let client = http_client(&fetch).context("Failed to build HTTP client")?;

    let mailer = HttpMailer::new(
        client.clone(),
        &config.mailer.api_url,
        config.sender.clone(),
        config.mailer.api_token(),
    )
    .context("Failed to set up mailer")?;

    let engine = Arc::new(Engine::new(
        store,
        Arc::new(FeedCache::new()),
        Arc::new(SpoolMailbox::new(&config.inbox_dir)),
        Arc::new(mailer),
        client,
        EngineOptions {
            bot_address: config.sender.clone(),
            fetch,
            digest: config.digest_options(),
        },
    ));

    engine.sync_cache().await;

    tracing::info!(
        sender = %config.sender,
        state = %config.state_path.display(),
        inbox = %config.inbox_dir.display(),
        "rss-email starting"
    );

    let scheduler = Scheduler::new(engine, config.schedule());
    let report = scheduler.run(shutdown_signal()).await;

    for kind in JobKind::ALL {
        let counts = report.counts(kind);
        tracing::info!(job = %kind, started = counts.started, skipped = counts.skipped, "Job totals");
    }
    tracing::info!("Goodbye");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
