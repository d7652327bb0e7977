use crate::models::{SourceDefinition, TitleFilter, WatcherDefinition};
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Default, Parser)]
#[command(
    author,
    version,
    about = "Watches web pages for new posts, price changes and restocks"
)]
pub struct AppSettings {
    /// Path to the TOML file listing the watchers
    #[arg(long, env = "PAGEWATCH_WATCHERS_FILE", default_value = "watchers.toml")]
    pub watchers_file: String,

    /// Discord webhook URL; notifications are only logged when absent
    #[arg(long, env = "PAGEWATCH_DISCORD_WEBHOOK_URL")]
    pub discord_webhook_url: Option<String>,

    /// Text prepended to every notification (e.g. "<@123456>")
    #[arg(long, env = "PAGEWATCH_MENTION")]
    pub mention: Option<String>,

    /// How long a reported item stays suppressed (in seconds)
    #[arg(long, env = "PAGEWATCH_SEEN_WINDOW_SECONDS", value_parser = validate_positive_seconds)]
    pub seen_window_seconds: u64,

    /// HTTP request timeout (in seconds)
    #[arg(long, env = "PAGEWATCH_REQUEST_TIMEOUT_SECONDS", default_value_t = 30, value_parser = validate_positive_seconds)]
    pub request_timeout_seconds: u64,

    /// Give up retrying a failing fetch after this many seconds
    #[arg(long, env = "PAGEWATCH_MAX_RETRY_SECONDS", default_value_t = 60)]
    pub max_retry_seconds: u64,

    /// User-Agent header sent with every request
    #[arg(long, env = "PAGEWATCH_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PAGEWATCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log notifications instead of sending them
    #[arg(long, env = "PAGEWATCH_DRY_RUN")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WatchersFile {
    watchers: Vec<WatcherDefinition>,
}

fn validate_positive_seconds(value: &str) -> Result<u64, String> {
    let seconds: u64 = value
        .parse()
        .map_err(|_| format!("expected a whole number of seconds, got '{}'", value))?;
    if seconds == 0 {
        Err("must be at least 1 second".to_string())
    } else {
        Ok(seconds)
    }
}

pub fn load_config() -> anyhow::Result<AppSettings> {
    let settings = AppSettings::parse();

    if let Some(url) = &settings.discord_webhook_url {
        url::Url::parse(url).with_context(|| "discord_webhook_url is not a valid URL")?;
    }

    Ok(settings)
}

pub fn load_watchers(path: impl AsRef<Path>) -> anyhow::Result<Vec<WatcherDefinition>> {
    let path = path.as_ref();
    let file: WatchersFile = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize())
        .with_context(|| format!("Failed to read watchers from {}", path.display()))?;
    validate_watchers(&file.watchers)?;
    Ok(file.watchers)
}

pub fn parse_watchers(toml: &str) -> anyhow::Result<Vec<WatcherDefinition>> {
    let file: WatchersFile = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize())
        .context("Failed to parse watchers")?;
    validate_watchers(&file.watchers)?;
    Ok(file.watchers)
}

fn validate_watchers(watchers: &[WatcherDefinition]) -> anyhow::Result<()> {
    if watchers.is_empty() {
        bail!("At least one watcher must be configured");
    }

    let mut names = HashSet::new();
    for watcher in watchers {
        let name = watcher.name.trim();
        if name.is_empty() {
            bail!("Watcher names must not be empty");
        }
        if !names.insert(name) {
            bail!("Duplicate watcher name '{}'", name);
        }
        if watcher.interval_seconds == 0 {
            bail!("Watcher '{}': interval_seconds must be at least 1", name);
        }
        validate_source(&watcher.source).map_err(|e| anyhow!("Watcher '{}': {}", name, e))?;
    }
    Ok(())
}

fn validate_source(source: &SourceDefinition) -> Result<(), String> {
    match source {
        SourceDefinition::PostListing { filter, .. } => {
            let has_keywords = match filter {
                TitleFilter::KeywordGroups { groups } => {
                    !groups.is_empty() && groups.iter().all(|g| !g.is_empty())
                }
                TitleFilter::HaveWant { keywords } => !keywords.is_empty(),
            };
            if has_keywords {
                Ok(())
            } else {
                Err("title filter needs at least one keyword in every group".to_string())
            }
        }
        SourceDefinition::Stock { urls, .. } if urls.is_empty() => {
            Err("stock watcher needs at least one url".to_string())
        }
        _ => Ok(()),
    }
}
