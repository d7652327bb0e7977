use crate::config::{load_config, load_watchers};
use crate::notifier::{DiscordWebhookNotifier, LogNotifier, Notifier};
use crate::polling::WatcherService;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod log_dedup;
mod models;
mod notifier;
mod polling;
mod scrapers;
mod seen_cache;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> Result<()> {
    let app_settings = load_config().with_context(|| "Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(app_settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting pagewatch...");

    let watchers = load_watchers(&app_settings.watchers_file)
        .with_context(|| "Failed to load watcher definitions")?;
    info!("Loaded {} watcher(s) from {}", watchers.len(), app_settings.watchers_file);

    let notifier: Arc<dyn Notifier> = match (&app_settings.discord_webhook_url, app_settings.dry_run) {
        (Some(url), false) => Arc::new(
            DiscordWebhookNotifier::new(
                url,
                Duration::from_secs(app_settings.request_timeout_seconds),
            )
            .with_context(|| "Invalid Discord webhook URL")?,
        ),
        (None, false) => {
            warn!("No Discord webhook configured; notifications will only be logged");
            Arc::new(LogNotifier)
        }
        (_, true) => {
            info!("Dry run: notifications will be logged, not sent");
            Arc::new(LogNotifier)
        }
    };

    let service = WatcherService::new(&app_settings, &watchers, notifier)
        .with_context(|| "Failed to create watcher service")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C, running until killed: {}", e),
        }
    });

    service.run(shutdown).await?;

    Ok(())
}
