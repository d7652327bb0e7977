use crate::config::AppSettings;
use crate::models::{Item, PublicIpResponse, SourceDefinition, StockRule, TitleFilter};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{header, Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: StatusCode },
    #[error("Invalid CSS selector '{selector}': {message}")]
    Selector { selector: String, message: String },
    #[error("Failed to deserialize response: {0}")]
    Deserialization(reqwest::Error),
    #[error("URL parsing error: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("All {count} pages failed, last error: {last}")]
    AllPagesFailed { count: usize, last: Box<ScrapeError> },
}

impl ScrapeError {
    /// Transport failures and overloaded servers are worth another attempt.
    fn is_transient(&self) -> bool {
        match self {
            ScrapeError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ScrapeError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// HTTP client shared by every scraper.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    max_retry: Duration,
}

impl PageFetcher {
    pub fn new(settings: &AppSettings) -> Result<Self, ScrapeError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("en-US,en;q=0.9"),
        );
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            max_retry: Duration::from_secs(settings.max_retry_seconds),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self.get_with_retry(url).await?;
        Ok(response.text().await?)
    }

    #[instrument(skip(self))]
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ScrapeError> {
        let response = self.get_with_retry(url).await?;
        response
            .json::<T>()
            .await
            .map_err(ScrapeError::Deserialization)
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ScrapeError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_elapsed_time: Some(self.max_retry),
            ..ExponentialBackoff::default()
        };

        backoff::future::retry(policy, || async {
            self.get_once(url).await.map_err(|e| {
                if e.is_transient() {
                    debug!(url, error = %e, "Transient fetch failure, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn get_once(&self, url: &str) -> Result<reqwest::Response, ScrapeError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response)
    }
}

/// One watched source. Stateful scrapers compare against the last value that
/// was delivered and keep reporting a change until it is committed.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &str;

    async fn scrape(&mut self, fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError>;

    /// Called once `item` has been delivered (or was already delivered within
    /// the seen window).
    fn commit(&mut self, _item: &Item) {}
}

/// Builds the scraper for a watcher definition, validating selectors and URLs
/// up front.
pub fn build_scraper(name: &str, source: &SourceDefinition) -> Result<Box<dyn Scraper>, ScrapeError> {
    let scraper: Box<dyn Scraper> = match source {
        SourceDefinition::PostListing {
            url,
            base_url,
            selector,
            filter,
        } => Box::new(PostListingScraper::new(
            name,
            url,
            base_url.as_deref(),
            selector,
            filter.clone(),
        )?),
        SourceDefinition::Price {
            url,
            selector,
            initial_price,
        } => Box::new(PriceScraper::new(name, url, selector, *initial_price)?),
        SourceDefinition::Stock { urls, label, rule } => {
            Box::new(StockScraper::new(name, urls.clone(), label, rule)?)
        }
        SourceDefinition::PublicIp {
            endpoint,
            initial_ip,
        } => Box::new(PublicIpScraper::new(name, endpoint, initial_ip.clone())?),
    };
    Ok(scraper)
}

fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

// ---------------------------------------------------------------------------
// Post listings
// ---------------------------------------------------------------------------

/// Forum listing page; reports posts whose titles pass the keyword filter.
pub struct PostListingScraper {
    name: String,
    url: String,
    base_url: Url,
    selector: Selector,
    filter: TitleFilter,
}

impl PostListingScraper {
    pub fn new(
        name: &str,
        url: &str,
        base_url: Option<&str>,
        selector: &str,
        filter: TitleFilter,
    ) -> Result<Self, ScrapeError> {
        let page_url = Url::parse(url)?;
        let base_url = match base_url {
            Some(base) => Url::parse(base)?,
            None => page_url.join("/")?,
        };
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            base_url,
            selector: parse_selector(selector)?,
            filter,
        })
    }

    /// Parses a listing page into items for the posts that pass the filter.
    pub fn extract(&self, html: &str) -> Vec<Item> {
        let document = Html::parse_document(html);
        let mut items = Vec::new();

        for element in document.select(&self.selector) {
            let title = element_text(element);
            if title.is_empty() || !title_matches(&self.filter, &title) {
                continue;
            }
            let Some(href) = element.value().attr("href") else {
                debug!(watcher = %self.name, title = %title, "Matching post has no link, skipping");
                continue;
            };
            let link = match self.base_url.join(href) {
                Ok(link) => link.to_string(),
                Err(e) => {
                    warn!(watcher = %self.name, href, error = %e, "Unparsable post link");
                    continue;
                }
            };
            let body = format!("Title: {}\nLink: {}", title, link);
            items.push(Item::new(link.clone(), title, body).with_link(link));
        }

        items
    }
}

#[async_trait]
impl Scraper for PostListingScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&mut self, fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError> {
        let html = fetcher.get_text(&self.url).await?;
        Ok(self.extract(&html))
    }
}

pub fn title_matches(filter: &TitleFilter, title: &str) -> bool {
    match filter {
        TitleFilter::KeywordGroups { groups } => groups
            .iter()
            .all(|group| group.iter().any(|keyword| contains_ignore_case(title, keyword))),
        TitleFilter::HaveWant { keywords } => match have_section(title) {
            Some(have) => keywords.iter().any(|keyword| contains_ignore_case(have, keyword)),
            None => false,
        },
    }
}

/// Text between the first `[H]` and the following `[W]`, trimmed.
fn have_section(title: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets valid for slicing `title`.
    let lower = title.to_ascii_lowercase();
    let start = lower.find("[h]")? + "[h]".len();
    let end = start + lower[start..].find("[w]")?;
    Some(title[start..end].trim())
}

// ---------------------------------------------------------------------------
// Price changes
// ---------------------------------------------------------------------------

pub struct PriceScraper {
    name: String,
    url: String,
    selector: Selector,
    /// Last price that was delivered (or the seeded baseline)
    last_price: Option<f64>,
    /// Changed price waiting for delivery, with its item key
    pending: Option<(String, f64)>,
}

impl PriceScraper {
    pub fn new(
        name: &str,
        url: &str,
        selector: &str,
        initial_price: Option<f64>,
    ) -> Result<Self, ScrapeError> {
        Url::parse(url)?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            selector: parse_selector(selector)?,
            last_price: initial_price,
            pending: None,
        })
    }

    #[allow(dead_code)]
    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn parse_price(&self, html: &str) -> Option<f64> {
        let document = Html::parse_document(html);
        let text = element_text(document.select(&self.selector).next()?);
        let numeric: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        numeric.parse::<f64>().ok()
    }

    /// Compares the page's price with the last delivered one and reports a
    /// change. The baseline only moves on `commit`.
    pub fn observe(&mut self, html: &str) -> Option<Item> {
        let Some(price) = self.parse_price(html) else {
            debug!(watcher = %self.name, url = %self.url, "No price found on page");
            return None;
        };

        self.pending = None;
        match self.last_price {
            None => {
                debug!(watcher = %self.name, price, "Seeded baseline price");
                self.last_price = Some(price);
                None
            }
            Some(previous) if previous == price => None,
            Some(previous) => {
                debug!(watcher = %self.name, previous, price, "Price changed");
                let key = format!("{}#price={}", self.url, price);
                let body = format!("Price: {}\nLink: {}", price, self.url);
                self.pending = Some((key.clone(), price));
                Some(Item::new(key, self.name.clone(), body).with_link(self.url.clone()))
            }
        }
    }

    fn commit_key(&mut self, key: &str) {
        if let Some((pending_key, price)) = self.pending.take() {
            if pending_key == key {
                self.last_price = Some(price);
            } else {
                self.pending = Some((pending_key, price));
            }
        }
    }
}

#[async_trait]
impl Scraper for PriceScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&mut self, fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError> {
        let html = fetcher.get_text(&self.url).await?;
        Ok(self.observe(&html).into_iter().collect())
    }

    fn commit(&mut self, item: &Item) {
        self.commit_key(&item.key);
    }
}

// ---------------------------------------------------------------------------
// Stock availability
// ---------------------------------------------------------------------------

enum CompiledStockRule {
    SchemaAvailability(Selector),
    ButtonText { selector: Selector, sold_out_text: String },
    ElementPresent(Selector),
}

pub struct StockScraper {
    name: String,
    urls: Vec<String>,
    label: String,
    rule: CompiledStockRule,
}

impl StockScraper {
    pub fn new(name: &str, urls: Vec<String>, label: &str, rule: &StockRule) -> Result<Self, ScrapeError> {
        for url in &urls {
            Url::parse(url)?;
        }
        let rule = match rule {
            StockRule::SchemaAvailability => {
                CompiledStockRule::SchemaAvailability(parse_selector(r#"meta[itemprop="availability"]"#)?)
            }
            StockRule::ButtonText {
                selector,
                sold_out_text,
            } => CompiledStockRule::ButtonText {
                selector: parse_selector(selector)?,
                sold_out_text: sold_out_text.clone(),
            },
            StockRule::ElementPresent { selector } => {
                CompiledStockRule::ElementPresent(parse_selector(selector)?)
            }
        };
        Ok(Self {
            name: name.to_string(),
            urls,
            label: label.to_string(),
            rule,
        })
    }

    pub fn in_stock(&self, html: &str) -> bool {
        let document = Html::parse_document(html);
        match &self.rule {
            CompiledStockRule::SchemaAvailability(selector) => document
                .select(selector)
                .filter_map(|meta| meta.value().attr("content"))
                .any(|content| content.trim().ends_with("InStock")),
            CompiledStockRule::ButtonText {
                selector,
                sold_out_text,
            } => match document.select(selector).next() {
                Some(button) => {
                    !element_text(button).eq_ignore_ascii_case(sold_out_text.trim())
                }
                None => false,
            },
            CompiledStockRule::ElementPresent(selector) => {
                document.select(selector).next().is_some()
            }
        }
    }

    fn item_for(&self, url: &str) -> Item {
        let body = format!("{} in stock!\nLink: {}", self.label, url);
        Item::new(url, self.label.clone(), body).with_link(url)
    }
}

#[async_trait]
impl Scraper for StockScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&mut self, fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError> {
        let mut items = Vec::new();
        let mut failures = 0;
        let mut last_error = None;

        for url in &self.urls {
            match fetcher.get_text(url).await {
                Ok(html) => {
                    if self.in_stock(&html) {
                        items.push(self.item_for(url));
                    }
                }
                Err(e) => {
                    warn!(watcher = %self.name, url = %url, error = %e, "Failed to fetch product page");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) if failures == self.urls.len() => Err(ScrapeError::AllPagesFailed {
                count: failures,
                last: Box::new(last),
            }),
            _ => Ok(items),
        }
    }
}

// ---------------------------------------------------------------------------
// Public IP
// ---------------------------------------------------------------------------

pub struct PublicIpScraper {
    name: String,
    endpoint: String,
    /// Last address that was delivered (or the seeded baseline)
    last_ip: Option<String>,
}

impl PublicIpScraper {
    pub fn new(name: &str, endpoint: &str, initial_ip: Option<String>) -> Result<Self, ScrapeError> {
        Url::parse(endpoint)?;
        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            last_ip: initial_ip,
        })
    }

    /// Reports an address that differs from the last delivered one. The
    /// baseline only moves on `commit`.
    pub fn observe(&mut self, ip: &str) -> Option<Item> {
        let ip = ip.trim();
        match &self.last_ip {
            None => {
                debug!(watcher = %self.name, ip, "Seeded baseline public IP");
                self.last_ip = Some(ip.to_string());
                None
            }
            Some(previous) if previous == ip => None,
            Some(previous) => {
                debug!(watcher = %self.name, previous = %previous, ip, "Public IP changed");
                Some(Item::new(
                    format!("ip:{}", ip),
                    self.name.clone(),
                    format!("New IP: {}", ip),
                ))
            }
        }
    }
}

#[async_trait]
impl Scraper for PublicIpScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&mut self, fetcher: &PageFetcher) -> Result<Vec<Item>, ScrapeError> {
        let response: PublicIpResponse = fetcher.get_json(&self.endpoint).await?;
        Ok(self.observe(&response.ip).into_iter().collect())
    }

    fn commit(&mut self, item: &Item) {
        if let Some(ip) = item.key.strip_prefix("ip:") {
            self.last_ip = Some(ip.to_string());
        }
    }
}
