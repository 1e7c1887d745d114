/// Row types for the msg/product/product_update/product_watch tables.
/// Column aliases in the queries map onto these field names.
use serde::Serialize;

use crate::types::{Price, Remind, RemindOption};

#[derive(Debug, sqlx::FromRow)]
pub struct MessageScanRow {
    pub row_id: i64,
    pub id: String,
    pub msg_type: i64,
    pub content: String,
    pub url: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ProductScanRow {
    pub row_id: i64,
    pub id: String,
    pub url: String,
}

/// Origin of a chat message, used to attribute a new watch.
#[derive(Debug, sqlx::FromRow)]
pub struct MessageOriginRow {
    pub from_user_id: String,
    pub create_time: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct WatchStateRow {
    pub row_id: i64,
    pub state: i64,
}

/// Price columns of the latest history row.
#[derive(Debug, sqlx::FromRow)]
pub struct SnapshotRow {
    pub price: f64,
    pub price_low: f64,
    pub price_high: f64,
    pub stock: i64,
}

impl SnapshotRow {
    pub fn price(&self) -> Price {
        Price::from_columns(self.price, self.price_low, self.price_high)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRow {
    pub row_id: i64,
    pub id: String,
    pub source: i64,
    pub url: String,
    pub short_url: String,
    pub title: String,
    pub currency: i64,
    pub price: f64,
    pub price_low: f64,
    pub price_high: f64,
    pub stock: i64,
    pub sales: i64,
    pub category: String,
    pub comments: String,
    pub update_time: String,
}

impl ProductRow {
    pub fn price(&self) -> Price {
        Price::from_columns(self.price, self.price_low, self.price_high)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProductUpdateRow {
    pub id: String,
    pub title: String,
    pub currency: i64,
    pub price: f64,
    pub price_low: f64,
    pub price_high: f64,
    pub stock: i64,
    pub sales: i64,
    pub comments: String,
    pub update_time: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchRow {
    pub user_id: String,
    pub currency: i64,
    pub price: f64,
    pub price_low: f64,
    pub price_high: f64,
    pub stock: i64,
    pub watch_time: String,
    pub remind_decrease_option: i64,
    pub remind_decrease_value: f64,
    pub remind_increase_option: i64,
    pub remind_increase_value: f64,
}

impl WatchRow {
    pub fn price(&self) -> Price {
        Price::from_columns(self.price, self.price_low, self.price_high)
    }

    pub fn decrease(&self) -> Remind {
        Remind {
            option: RemindOption::from_code(self.remind_decrease_option),
            value: self.remind_decrease_value,
        }
    }

    pub fn increase(&self) -> Remind {
        Remind {
            option: RemindOption::from_code(self.remind_increase_option),
            value: self.remind_increase_value,
        }
    }
}
