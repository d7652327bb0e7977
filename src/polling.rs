use crate::config::AppSettings;
use crate::log_dedup::ErrorLogThrottle;
use crate::models::{Item, WatcherDefinition};
use crate::notifier::{Notifier, NotifyError};
use crate::scrapers::{build_scraper, PageFetcher, ScrapeError, Scraper};
use crate::seen_cache::{Claim, SeenCacheError, SeenItemCache, SharedSeenCache};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an identical scrape error is kept out of the error log.
const ERROR_LOG_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Counts from a single poll cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub found: usize,
    pub notified: usize,
    pub already_seen: usize,
    pub failed: usize,
}

/// Poll loop for one configured source.
pub struct SourceWatcher {
    name: String,
    interval: Duration,
    mention: Option<String>,
    scraper: Box<dyn Scraper>,
    fetcher: Arc<PageFetcher>,
    notifier: Arc<dyn Notifier>,
    seen: SharedSeenCache,
    error_log: ErrorLogThrottle,
}

impl SourceWatcher {
    pub fn new(
        scraper: Box<dyn Scraper>,
        interval: Duration,
        mention: Option<String>,
        fetcher: Arc<PageFetcher>,
        notifier: Arc<dyn Notifier>,
        seen: SharedSeenCache,
    ) -> Result<Self, SeenCacheError> {
        Ok(Self {
            name: scraper.name().to_string(),
            interval,
            mention,
            scraper,
            fetcher,
            notifier,
            seen,
            error_log: ErrorLogThrottle::new(ERROR_LOG_WINDOW)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(watcher = %self.name, interval_secs = self.interval.as_secs(), "Starting watcher");
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(watcher = %self.name, "Watcher stopped");
                    break;
                }
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(summary) => {
                            if summary.notified > 0 || summary.failed > 0 {
                                let retained = self.seen.len().await;
                                info!(
                                    watcher = %self.name,
                                    retained,
                                    found = summary.found,
                                    notified = summary.notified,
                                    already_seen = summary.already_seen,
                                    failed = summary.failed,
                                    "Poll complete"
                                );
                            } else {
                                debug!(watcher = %self.name, found = summary.found, "Poll complete, nothing new");
                            }
                        }
                        Err(e) => self.log_scrape_error(&e),
                    }
                }
            }
        }
    }

    /// Scrape once, then check/notify/record each item. A failed scrape
    /// leaves the seen cache untouched. Delivered and already-seen items are
    /// committed back to the scraper; failed ones are not, so change
    /// detectors report them again next poll.
    pub async fn poll_once(&mut self) -> Result<PollSummary, ScrapeError> {
        let items = self.scraper.scrape(&self.fetcher).await?;
        let items = dedupe_batch(items);

        let mut summary = PollSummary {
            found: items.len(),
            ..PollSummary::default()
        };

        for item in &items {
            match self.dispatch(item).await {
                Some(Claim::Recorded) => {
                    self.scraper.commit(item);
                    summary.notified += 1;
                }
                Some(Claim::AlreadySeen) => {
                    debug!(watcher = %self.name, key = %item.key, "Item already reported");
                    self.scraper.commit(item);
                    summary.already_seen += 1;
                }
                Some(Claim::Failed(e)) => {
                    error!(
                        watcher = %self.name,
                        key = %item.key,
                        discovered_at = %item.discovered_at,
                        error = %e,
                        "Failed to send notification"
                    );
                    summary.failed += 1;
                }
                None => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    async fn dispatch(&self, item: &Item) -> Option<Claim<NotifyError>> {
        let notifier = &self.notifier;
        let mention = self.mention.as_deref();
        match self
            .seen
            .claim(&item.key, || notifier.notify(item, mention))
            .await
        {
            Ok(claim) => Some(claim),
            Err(e) => {
                warn!(watcher = %self.name, title = %item.title, error = %e, "Skipping item with unusable key");
                None
            }
        }
    }

    fn log_scrape_error(&mut self, e: &ScrapeError) {
        let message = e.to_string();
        if self.error_log.should_log(&self.name, &message) {
            error!(watcher = %self.name, error = %message, "Scrape failed, skipping this cycle");
        } else {
            debug!(watcher = %self.name, error = %message, "Scrape failed again");
        }
    }
}

/// Drops repeated keys within one scrape, keeping the first occurrence.
fn dedupe_batch(items: Vec<Item>) -> Vec<Item> {
    let mut keys = HashSet::new();
    items
        .into_iter()
        .filter(|item| keys.insert(item.key.clone()))
        .collect()
}

/// Owns every watcher and the seen cache they share.
pub struct WatcherService {
    watchers: Vec<SourceWatcher>,
    seen: SharedSeenCache,
}

impl WatcherService {
    pub fn new(
        settings: &AppSettings,
        definitions: &[WatcherDefinition],
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let window = Duration::from_secs(settings.seen_window_seconds);
        let seen = SharedSeenCache::new(
            SeenItemCache::new(window).context("Invalid seen window")?,
        );
        let fetcher = Arc::new(PageFetcher::new(settings).context("Failed to create HTTP client")?);

        let mut watchers = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let scraper = build_scraper(&definition.name, &definition.source)
                .with_context(|| format!("Invalid watcher '{}'", definition.name))?;
            let mention = definition
                .mention
                .clone()
                .or_else(|| settings.mention.clone());
            watchers.push(SourceWatcher::new(
                scraper,
                Duration::from_secs(definition.interval_seconds),
                mention,
                fetcher.clone(),
                notifier.clone(),
                seen.clone(),
            )?);
        }

        Ok(Self { watchers, seen })
    }

    #[allow(dead_code)]
    pub fn seen_cache(&self) -> &SharedSeenCache {
        &self.seen
    }

    /// Runs every watcher until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let names: Vec<String> = self.watchers.iter().map(|w| w.name().to_string()).collect();
        let window = self.seen.window().await;
        info!(watchers = ?names, window_secs = window.as_secs(), "Starting watcher service");

        let handles: Vec<_> = self
            .watchers
            .into_iter()
            .map(|watcher| tokio::spawn(watcher.run(shutdown.clone())))
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Watcher task ended abnormally: {}", e);
            }
        }

        info!("All watchers stopped");
        Ok(())
    }
}
