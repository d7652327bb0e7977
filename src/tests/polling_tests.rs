#![allow(clippy::field_reassign_with_default)]

use crate::config::{parse_watchers, AppSettings};
use crate::models::Item;
use crate::notifier::{format_message, Notifier, NotifyError};
use crate::polling::{PollSummary, SourceWatcher, WatcherService};
use crate::scrapers::{PageFetcher, PriceScraper, ScrapeError, Scraper};
use crate::seen_cache::{SeenItemCache, SharedSeenCache};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_secs(900);

fn test_settings() -> AppSettings {
    let mut settings = AppSettings::default();
    settings.seen_window_seconds = 900;
    settings.request_timeout_seconds = 5;
    settings.max_retry_seconds = 1;
    settings.user_agent = "pagewatch-test".to_string();
    settings.mention = Some("<@111>".to_string());
    settings
}

/// Replays canned scrape results, then keeps returning the last batch.
struct ScriptedScraper {
    name: String,
    script: VecDeque<Result<Vec<Item>, ScrapeError>>,
    repeat: Vec<Item>,
}

impl ScriptedScraper {
    fn new(name: &str, script: Vec<Result<Vec<Item>, ScrapeError>>) -> Self {
        Self {
            name: name.to_string(),
            script: script.into(),
            repeat: Vec::new(),
        }
    }
}

#[async_trait]
impl Scraper for ScriptedScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&mut self, _fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError> {
        match self.script.pop_front() {
            Some(Ok(items)) => {
                self.repeat = items.clone();
                Ok(items)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.repeat.clone()),
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, item: &Item, mention: Option<&str>) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Api {
                status: StatusCode::BAD_GATEWAY,
                body: "discord unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(format_message(item, mention));
        Ok(())
    }
}

fn post(key: &str) -> Item {
    Item::new(key, key, format!("Title: {}\nLink: {}", key, key)).with_link(key)
}

fn scrape_failure() -> ScrapeError {
    ScrapeError::Status {
        url: "https://forum.example.com/new".to_string(),
        status: StatusCode::BAD_GATEWAY,
    }
}

fn watcher(
    scraper: impl Scraper + 'static,
    notifier: Arc<RecordingNotifier>,
    seen: SharedSeenCache,
    interval: Duration,
) -> SourceWatcher {
    let settings = test_settings();
    SourceWatcher::new(
        Box::new(scraper),
        interval,
        settings.mention.clone(),
        Arc::new(PageFetcher::new(&settings).unwrap()),
        notifier,
        seen,
    )
    .unwrap()
}

fn shared_cache() -> SharedSeenCache {
    SharedSeenCache::new(SeenItemCache::new(WINDOW).unwrap())
}

#[tokio::test]
async fn test_new_items_are_notified_once() {
    let notifier = Arc::new(RecordingNotifier::default());
    let seen = shared_cache();
    let scraper = ScriptedScraper::new("forum", vec![Ok(vec![post("url-A"), post("url-B")])]);
    let mut watcher = watcher(scraper, notifier.clone(), seen.clone(), Duration::from_secs(20));

    let first = watcher.poll_once().await.unwrap();
    assert_eq!(
        first,
        PollSummary {
            found: 2,
            notified: 2,
            already_seen: 0,
            failed: 0
        }
    );
    assert_eq!(notifier.sent()[0], "<@111>\nTitle: url-A\nLink: url-A");

    // Same listing on the next tick
    let second = watcher.poll_once().await.unwrap();
    assert_eq!(second.notified, 0);
    assert_eq!(second.already_seen, 2);
    assert_eq!(notifier.sent().len(), 2);
    assert_eq!(seen.len().await, 2);
}

#[tokio::test]
async fn test_failed_notification_is_retried_next_poll() {
    let notifier = Arc::new(RecordingNotifier::default());
    notifier.failing.store(true, Ordering::SeqCst);
    let seen = shared_cache();
    let scraper = ScriptedScraper::new("forum", vec![Ok(vec![post("url-A")])]);
    let mut watcher = watcher(scraper, notifier.clone(), seen.clone(), Duration::from_secs(20));

    let first = watcher.poll_once().await.unwrap();
    assert_eq!(first.failed, 1);
    assert!(seen.is_new("url-A").await.unwrap());

    notifier.failing.store(false, Ordering::SeqCst);
    let second = watcher.poll_once().await.unwrap();
    assert_eq!(second.notified, 1);
    assert_eq!(notifier.sent().len(), 1);
    assert!(!seen.is_new("url-A").await.unwrap());
}

#[tokio::test]
async fn test_scrape_failure_leaves_cache_untouched() {
    let notifier = Arc::new(RecordingNotifier::default());
    let seen = shared_cache();
    let scraper = ScriptedScraper::new(
        "forum",
        vec![Err(scrape_failure()), Ok(vec![post("url-A")])],
    );
    let mut watcher = watcher(scraper, notifier.clone(), seen.clone(), Duration::from_secs(20));

    assert!(watcher.poll_once().await.is_err());
    assert_eq!(seen.len().await, 0);
    assert!(notifier.sent().is_empty());

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.notified, 1);
}

#[tokio::test]
async fn test_duplicate_keys_within_one_scrape_notify_once() {
    let notifier = Arc::new(RecordingNotifier::default());
    let scraper = ScriptedScraper::new(
        "forum",
        vec![Ok(vec![post("url-A"), post("url-A"), post("url-B")])],
    );
    let mut watcher = watcher(scraper, notifier.clone(), shared_cache(), Duration::from_secs(20));

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.found, 2);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_watchers_share_one_cache() {
    let notifier = Arc::new(RecordingNotifier::default());
    let seen = shared_cache();
    let mut first = watcher(
        ScriptedScraper::new("new-posts", vec![Ok(vec![post("url-A")])]),
        notifier.clone(),
        seen.clone(),
        Duration::from_secs(20),
    );
    let mut second = watcher(
        ScriptedScraper::new("hot-posts", vec![Ok(vec![post("url-A"), post("url-C")])]),
        notifier.clone(),
        seen.clone(),
        Duration::from_secs(20),
    );

    first.poll_once().await.unwrap();
    let summary = second.poll_once().await.unwrap();

    assert_eq!(summary.already_seen, 1);
    assert_eq!(summary.notified, 1);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_empty_key_is_skipped() {
    let notifier = Arc::new(RecordingNotifier::default());
    let scraper = ScriptedScraper::new("forum", vec![Ok(vec![post("  "), post("url-A")])]);
    let mut watcher = watcher(scraper, notifier.clone(), shared_cache(), Duration::from_secs(20));

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.notified, 1);
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_run_polls_immediately_and_stops_on_cancel() {
    let notifier = Arc::new(RecordingNotifier::default());
    let scraper = ScriptedScraper::new("forum", vec![Ok(vec![post("url-A")])]);
    let watcher = watcher(scraper, notifier.clone(), shared_cache(), Duration::from_secs(3600));

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(watcher.run(shutdown.clone()));

    for _ in 0..100 {
        if !notifier.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(notifier.sent().len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watcher did not stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn test_service_rejects_invalid_selector() {
    let watchers = parse_watchers(
        r#"
[[watchers]]
name = "fish"
kind = "price"
interval_seconds = 60
url = "https://shop.example.com/products/fish"
selector = "span["
"#,
    )
    .unwrap();

    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
    let err = WatcherService::new(&test_settings(), &watchers, notifier)
        .err()
        .unwrap();
    assert!(format!("{:#}", err).contains("Invalid watcher 'fish'"));
}

#[tokio::test]
async fn test_service_uses_configured_window() {
    let watchers = parse_watchers(
        r#"
[[watchers]]
name = "ip"
kind = "public_ip"
interval_seconds = 86400
"#,
    )
    .unwrap();

    let mut settings = test_settings();
    settings.seen_window_seconds = 7200;
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
    let service = WatcherService::new(&settings, &watchers, notifier).unwrap();

    assert_eq!(
        service.seen_cache().window().await,
        Duration::from_secs(7200)
    );
}

#[tokio::test]
async fn test_service_rejects_zero_window() {
    let watchers = parse_watchers(
        r#"
[[watchers]]
name = "ip"
kind = "public_ip"
interval_seconds = 86400
"#,
    )
    .unwrap();

    let mut settings = test_settings();
    settings.seen_window_seconds = 0;
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
    assert!(WatcherService::new(&settings, &watchers, notifier).is_err());
}

fn price_page(price: &str) -> String {
    format!(r#"<span class="price-item price-item--regular">{}</span>"#, price)
}

async fn serve_price(server: &mut mockito::ServerGuard, price: &str) -> mockito::Mock {
    server
        .mock("GET", "/products/fish")
        .with_status(200)
        .with_body(price_page(price))
        .create_async()
        .await
}

fn price_scraper(server: &mockito::ServerGuard, initial_price: f64) -> PriceScraper {
    PriceScraper::new(
        "fish",
        &format!("{}/products/fish", server.url()),
        "span.price-item.price-item--regular",
        Some(initial_price),
    )
    .unwrap()
}

#[tokio::test]
async fn test_price_change_is_resent_after_failed_notification() {
    let mut server = mockito::Server::new_async().await;
    let _page = serve_price(&mut server, "$189.99").await;

    let notifier = Arc::new(RecordingNotifier::default());
    notifier.failing.store(true, Ordering::SeqCst);
    let scraper = price_scraper(&server, 199.99);
    let mut watcher = watcher(scraper, notifier.clone(), shared_cache(), Duration::from_secs(60));

    let first = watcher.poll_once().await.unwrap();
    assert_eq!(first.failed, 1);
    assert!(notifier.sent().is_empty());

    notifier.failing.store(false, Ordering::SeqCst);
    let second = watcher.poll_once().await.unwrap();
    assert_eq!(second.notified, 1);
    assert_eq!(notifier.sent().len(), 1);
    assert!(notifier.sent()[0].contains("Price: 189.99"));

    // Delivered, so the same price is no longer a change
    let third = watcher.poll_once().await.unwrap();
    assert_eq!(third.found, 0);
}

#[tokio::test]
async fn test_price_flip_flop_within_window_is_reported_once_per_value() {
    let mut server = mockito::Server::new_async().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let scraper = price_scraper(&server, 100.0);
    let mut watcher = watcher(scraper, notifier.clone(), shared_cache(), Duration::from_secs(60));

    let mut summaries = Vec::new();
    for price in ["$90.00", "$100.00", "$90.00", "$100.00"] {
        let page = serve_price(&mut server, price).await;
        summaries.push(watcher.poll_once().await.unwrap());
        page.remove_async().await;
    }

    let notified: Vec<usize> = summaries.iter().map(|s| s.notified).collect();
    let already_seen: Vec<usize> = summaries.iter().map(|s| s.already_seen).collect();
    assert_eq!(notified, vec![1, 1, 0, 0]);
    assert_eq!(already_seen, vec![0, 0, 1, 1]);
    assert_eq!(notifier.sent().len(), 2);

    // The suppressed flip still moved the baseline to 100
    let _page = serve_price(&mut server, "$100.00").await;
    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.found, 0);
}

#[tokio::test]
async fn test_service_run_notifies_and_stops_on_cancel() {
    let mut server = mockito::Server::new_async().await;
    let _ip = server
        .mock("GET", "/ip")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ip": "198.51.100.7"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let watchers = parse_watchers(&format!(
        r#"
[[watchers]]
name = "ip"
kind = "public_ip"
interval_seconds = 86400
endpoint = "{}/ip"
initial_ip = "203.0.113.5"
"#,
        server.url()
    ))
    .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let service = WatcherService::new(&test_settings(), &watchers, notifier.clone()).unwrap();
    let seen = service.seen_cache().clone();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(service.run(shutdown.clone()));

    for _ in 0..100 {
        if !notifier.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(notifier.sent(), vec!["<@111>\nNew IP: 198.51.100.7".to_string()]);
    assert!(!seen.is_new("ip:198.51.100.7").await.unwrap());

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service did not stop after cancel")
        .unwrap();
    assert!(result.is_ok());
}
