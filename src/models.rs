use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something a scraper found that may be worth a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Stable identity used for de-duplication (usually a canonical URL)
    pub key: String,
    pub title: String,
    /// Message body, without the mention prefix
    pub body: String,
    pub link: Option<String>,
    /// When the scraper produced this item; logged with notifications
    pub discovered_at: DateTime<Utc>,
}

impl Item {
    pub fn new(key: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            body: body.into(),
            link: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// One `[[watchers]]` table from the watchers file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherDefinition {
    pub name: String,
    pub interval_seconds: u64,
    /// Overrides the global mention for this watcher's messages
    #[serde(default)]
    pub mention: Option<String>,
    #[serde(flatten)]
    pub source: SourceDefinition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDefinition {
    PostListing {
        url: String,
        /// Used to absolutize relative post links; defaults to the origin of `url`
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default = "default_post_selector")]
        selector: String,
        filter: TitleFilter,
    },
    Price {
        url: String,
        #[serde(default = "default_price_selector")]
        selector: String,
        #[serde(default)]
        initial_price: Option<f64>,
    },
    Stock {
        urls: Vec<String>,
        label: String,
        rule: StockRule,
    },
    PublicIp {
        #[serde(default = "default_ip_endpoint")]
        endpoint: String,
        #[serde(default)]
        initial_ip: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TitleFilter {
    /// Every group needs at least one keyword somewhere in the title
    KeywordGroups { groups: Vec<Vec<String>> },
    /// At least one keyword in the text between `[H]` and `[W]`
    HaveWant { keywords: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StockRule {
    /// `<meta itemprop="availability" content=".../InStock">`
    SchemaAvailability,
    ButtonText {
        selector: String,
        #[serde(default = "default_sold_out_text")]
        sold_out_text: String,
    },
    ElementPresent { selector: String },
}

pub(crate) fn default_post_selector() -> String {
    r#"a[slot="title"]"#.to_string()
}

pub(crate) fn default_price_selector() -> String {
    "span.price-item.price-item--regular".to_string()
}

pub(crate) fn default_ip_endpoint() -> String {
    "https://api.ipify.org?format=json".to_string()
}

fn default_sold_out_text() -> String {
    "Sold out".to_string()
}

/// Body of the public IP endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpResponse {
    pub ip: String,
}

/// Discord webhook execute payload.
#[derive(Debug, Clone, Serialize)]
pub struct DiscordWebhookMessage {
    pub content: String,
}
