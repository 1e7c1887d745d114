use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, error};

use crate::config::{MSG_TYPE_LINK, MSG_TYPE_TEXT};
use crate::db::models::{MessageScanRow, ProductScanRow};
use crate::error::Result;
use crate::state::{CheckpointStore, CursorKind, Cursors};
use crate::types::{format_db_time, MessageRef, ProductRef, WorkItem};

/// Incremental reader of crawlable rows. Cursors are persisted right after the
/// read that advanced them, before anything is dispatched.
pub struct ChangeScanner {
    pool: SqlitePool,
    checkpoints: CheckpointStore,
    cursors: Arc<Cursors>,
    redispatch_interval: Option<Duration>,
}

impl ChangeScanner {
    pub fn new(
        pool: SqlitePool,
        checkpoints: CheckpointStore,
        cursors: Arc<Cursors>,
        redispatch_interval: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            checkpoints,
            cursors,
            redispatch_interval,
        }
    }

    /// Up to `quota` work items of the given kind. Query failures are logged
    /// and yield an empty result.
    pub async fn scan(&self, kind: CursorKind, quota: usize) -> Vec<WorkItem> {
        if quota == 0 {
            return Vec::new();
        }
        let result = match kind {
            CursorKind::Messages => self.scan_messages(quota).await,
            CursorKind::Products => self.scan_products(quota).await,
        };
        match result {
            Ok(items) => items,
            Err(e) => {
                error!(cursor = kind.key(), "Scan failed: {e}");
                Vec::new()
            }
        }
    }

    async fn scan_messages(&self, quota: usize) -> Result<Vec<WorkItem>> {
        let cursor = self.cursors.get(CursorKind::Messages);
        let rows: Vec<MessageScanRow> = sqlx::query_as(
            r#"
            SELECT _id AS row_id, id, type AS msg_type, content, url
            FROM msg
            WHERE _id > ? AND (type = ? OR type = ?)
            ORDER BY _id
            LIMIT ?
            "#,
        )
        .bind(to_i64(cursor))
        .bind(MSG_TYPE_TEXT)
        .bind(MSG_TYPE_LINK)
        .bind(to_i64(quota as u64))
        .fetch_all(&self.pool)
        .await?;

        if let Some(max_id) = rows.iter().map(|r| r.row_id).max() {
            self.cursors
                .advance(&self.checkpoints, CursorKind::Messages, max_id.max(0) as u64)
                .await;
        }

        let items: Vec<WorkItem> = rows.into_iter().filter_map(message_item).collect();
        debug!(count = items.len(), "check msg, ok");
        Ok(items)
    }

    async fn scan_products(&self, quota: usize) -> Result<Vec<WorkItem>> {
        let start = self.cursors.get(CursorKind::Products);
        let cutoff = self.redispatch_interval.and_then(|interval| {
            chrono::Duration::from_std(interval)
                .ok()
                .map(|d| format_db_time(Utc::now() - d))
        });

        let rows = self
            .fetch_products(start, u64::MAX, cutoff.as_deref(), quota)
            .await?;
        self.advance_products(&rows).await;
        let mut items: Vec<WorkItem> = rows.into_iter().filter_map(product_item).collect();

        // Wrap around: fill the rest of the quota from the head of the table.
        // Rows above `start` were just covered by the first pass.
        if items.len() < quota {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(_id) FROM product")
                .fetch_one(&self.pool)
                .await?;
            let available = usize::try_from(total).unwrap_or(0).saturating_sub(items.len());
            let ask = (quota - items.len()).min(available);
            if ask > 0 && start > 0 {
                let rows = self.fetch_products(0, start, cutoff.as_deref(), ask).await?;
                self.advance_products(&rows).await;
                items.extend(rows.into_iter().filter_map(product_item));
            }
        }

        debug!(count = items.len(), "check product, ok");
        Ok(items)
    }

    async fn fetch_products(
        &self,
        after: u64,
        up_to: u64,
        dispatched_before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProductScanRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT _id AS row_id, id, url
            FROM product
            WHERE _id > ? AND _id <= ?
              AND (? IS NULL OR last_dispatch_time < ?)
            ORDER BY _id
            LIMIT ?
            "#,
        )
        .bind(to_i64(after))
        .bind(to_i64(up_to))
        .bind(dispatched_before)
        .bind(dispatched_before)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn advance_products(&self, rows: &[ProductScanRow]) {
        if let Some(max_id) = rows.iter().map(|r| r.row_id).max() {
            self.cursors
                .advance(&self.checkpoints, CursorKind::Products, max_id.max(0) as u64)
                .await;
        }
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn message_item(row: MessageScanRow) -> Option<WorkItem> {
    if row.content.is_empty() && row.url.is_empty() {
        return None;
    }
    // Link shares are crawled by url; the content would only bloat the task.
    let content = if row.msg_type == MSG_TYPE_LINK && !row.url.is_empty() {
        String::new()
    } else {
        row.content
    };
    Some(WorkItem::Message(MessageRef {
        id: row.id,
        url: row.url,
        content,
    }))
}

fn product_item(row: ProductScanRow) -> Option<WorkItem> {
    if row.url.is_empty() {
        return None;
    }
    Some(WorkItem::Product(ProductRef {
        row_id: row.row_id.max(0) as u64,
        external_id: row.id,
        url: row.url,
    }))
}
