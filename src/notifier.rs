use crate::models::{DiscordWebhookMessage, Item};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use url::Url;

/// Discord rejects message content longer than this many characters.
pub const DISCORD_CONTENT_LIMIT: usize = 2000;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one message for `item`, prefixed with `mention` when given.
    async fn notify(&self, item: &Item, mention: Option<&str>) -> Result<(), NotifyError>;
}

pub fn format_message(item: &Item, mention: Option<&str>) -> String {
    match mention {
        Some(mention) if !mention.trim().is_empty() => format!("{}\n{}", mention.trim(), item.body),
        _ => item.body.clone(),
    }
}

fn truncate_chars(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((byte_index, _)) => content[..byte_index].to_string(),
        None => content.to_string(),
    }
}

/// Posts messages to a Discord channel through an incoming webhook.
#[derive(Debug)]
pub struct DiscordWebhookNotifier {
    client: Client,
    webhook_url: Url,
}

impl DiscordWebhookNotifier {
    /// `timeout` bounds each webhook request. The shared seen cache stays
    /// locked while a notification is in flight.
    pub fn new(webhook_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let webhook_url = Url::parse(webhook_url)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    #[instrument(skip(self, item, mention), fields(key = %item.key))]
    async fn notify(&self, item: &Item, mention: Option<&str>) -> Result<(), NotifyError> {
        let payload = DiscordWebhookMessage {
            content: truncate_chars(&format_message(item, mention), DISCORD_CONTENT_LIMIT),
        };
        debug!("Posting notification to Discord webhook");

        let response = self
            .client
            .post(self.webhook_url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!("Discord webhook error: {} - {}", status, body);
            return Err(NotifyError::Api { status, body });
        }

        Ok(())
    }
}

/// Dry-run notifier; writes the message to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, item: &Item, mention: Option<&str>) -> Result<(), NotifyError> {
        info!(
            key = %item.key,
            discovered_at = %item.discovered_at,
            "Notification (dry run):\n{}",
            format_message(item, mention)
        );
        Ok(())
    }
}
