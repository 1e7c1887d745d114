use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DB_TIME_FORMAT;

// ---------------------------------------------------------------------------
// Price
// ---------------------------------------------------------------------------

/// Sentinel: the crawler could not run its extraction script.
pub const NO_SCRIPT: f64 = -1.0;
/// Sentinel: the page had no price field.
pub const NO_VALUE: f64 = -2.0;
/// Sentinel: the price is a range, `price_low`/`price_high` are authoritative.
pub const RANGE_PRICE: f64 = -3.0;

/// Observed price of a product. The sentinel encoding only exists at the
/// wire/database boundary; everything else matches on this enum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Price {
    Known(f64),
    Unknown,
    Range { low: f64, high: f64 },
}

impl Price {
    pub fn from_columns(price: f64, low: f64, high: f64) -> Self {
        if price >= 0.0 {
            Price::Known(price)
        } else if price == RANGE_PRICE {
            Price::Range { low, high }
        } else {
            Price::Unknown
        }
    }

    /// `(price, price_low, price_high)` in the sentinel encoding.
    pub fn to_columns(self) -> (f64, f64, f64) {
        match self {
            Price::Known(p) => (p, 0.0, 0.0),
            Price::Unknown => (NO_VALUE, 0.0, 0.0),
            Price::Range { low, high } => (RANGE_PRICE, low, high),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Price::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Currency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Cny,
    Jpy,
    Usd,
    Gbp,
    Eur,
}

impl Currency {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Currency::Cny),
            1 => Some(Currency::Jpy),
            2 => Some(Currency::Usd),
            3 => Some(Currency::Gbp),
            4 => Some(Currency::Eur),
            _ => None,
        }
    }

    /// CNY uses the fullwidth yuan sign so it stays distinguishable from JPY.
    pub fn symbol(self) -> &'static str {
        match self {
            Currency::Cny => "￥",
            Currency::Jpy => "¥",
            Currency::Usd => "$",
            Currency::Gbp => "£",
            Currency::Eur => "€",
        }
    }

    /// Two-decimal amount prefixed with the glyph for `code`.
    /// Unrecognized codes render with the CNY glyph.
    pub fn format_amount(code: i64, amount: f64) -> String {
        let currency = Currency::from_code(code).unwrap_or(Currency::Cny);
        format!("{}{:.2}", currency.symbol(), amount)
    }
}

// ---------------------------------------------------------------------------
// Watches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Watching,
    Unwatched,
}

impl WatchState {
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            WatchState::Unwatched
        } else {
            WatchState::Watching
        }
    }

    pub fn code(self) -> i64 {
        match self {
            WatchState::Watching => 0,
            WatchState::Unwatched => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemindOption {
    Off,
    /// Threshold is a price level.
    Absolute,
    /// Threshold is a relative move in percent.
    Percentage,
}

impl RemindOption {
    /// Unknown codes never remind.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => RemindOption::Absolute,
            2 => RemindOption::Percentage,
            _ => RemindOption::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Remind {
    pub option: RemindOption,
    pub value: f64,
}

impl Remind {
    pub fn is_off(&self) -> bool {
        self.option == RemindOption::Off
    }
}

// ---------------------------------------------------------------------------
// Work items produced by the scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef {
    pub id: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRef {
    pub row_id: u64,
    pub external_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    Message(MessageRef),
    Product(ProductRef),
}

impl From<WorkItem> for Payload {
    fn from(item: WorkItem) -> Self {
        match item {
            WorkItem::Message(m) => Payload {
                message: Some(MessagePayload {
                    id: m.id,
                    url: m.url,
                    content: m.content,
                }),
                product: None,
            },
            WorkItem::Product(p) => Payload {
                message: None,
                product: Some(ProductPayload {
                    row_id: p.row_id,
                    id: p.external_id,
                    url: p.url,
                    ..ProductPayload::default()
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Task envelope (wire format shared with the crawl workers)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// Product reference on dispatch, full crawl snapshot on results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    #[serde(rename = "_id", default)]
    pub row_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_url: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub source: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub currency: i64,
    #[serde(default = "no_value")]
    pub price: f64,
    #[serde(default)]
    pub price_low: f64,
    #[serde(default)]
    pub price_high: f64,
    #[serde(default = "no_script_count")]
    pub stock: i64,
    #[serde(default = "no_script_count")]
    pub sales: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Comments::is_empty")]
    pub comments: Comments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

impl Default for ProductPayload {
    fn default() -> Self {
        Self {
            row_id: 0,
            id: String::new(),
            url: String::new(),
            short_url: String::new(),
            source: 0,
            title: String::new(),
            currency: 0,
            price: NO_VALUE,
            price_low: 0.0,
            price_high: 0.0,
            stock: NO_SCRIPT as i64,
            sales: NO_SCRIPT as i64,
            category: String::new(),
            comments: Comments::default(),
            update_time: None,
        }
    }
}

impl ProductPayload {
    pub fn price(&self) -> Price {
        Price::from_columns(self.price, self.price_low, self.price_high)
    }

    /// JSON blob stored alongside the snapshot; empty when no reviews were counted.
    pub fn comments_blob(&self) -> String {
        if self.comments.total > 0 {
            serde_json::to_string(&self.comments).unwrap_or_default()
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comments {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub star5: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub star4: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub star3: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub star2: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub star1: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub image: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub append: i64,
}

impl Comments {
    pub fn is_empty(&self) -> bool {
        *self == Comments::default()
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn no_value() -> f64 {
    NO_VALUE
}

fn no_script_count() -> i64 {
    NO_SCRIPT as i64
}

// ---------------------------------------------------------------------------
// Notification envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub by_user: BTreeMap<String, Vec<String>>,
    pub create_time: String,
}

/// Formats a timestamp the way the store keeps it.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}
