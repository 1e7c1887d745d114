use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{put_on, Broker, PutOptions};
use crate::dump::Dumper;
use crate::error::Result;
use crate::scanner::ChangeScanner;
use crate::state::CursorKind;
use crate::types::{format_db_time, Payload, Task, WorkItem};

/// Summary of one dispatched task envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub task_id: String,
    pub messages: usize,
    pub products: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.messages + self.products
    }
}

/// Packs freshly scanned work into one task envelope and puts it on the task tube.
pub struct Dispatcher {
    scanner: ChangeScanner,
    pool: SqlitePool,
    broker: Arc<dyn Broker>,
    dumper: Dumper,
    task_tube: String,
    put_opts: PutOptions,
}

impl Dispatcher {
    pub fn new(
        scanner: ChangeScanner,
        pool: SqlitePool,
        broker: Arc<dyn Broker>,
        dumper: Dumper,
        task_tube: String,
        put_opts: PutOptions,
    ) -> Self {
        Self {
            scanner,
            pool,
            broker,
            dumper,
            task_tube,
            put_opts,
        }
    }

    /// Messages take precedence; products fill whatever capacity is left.
    /// Returns None when there was nothing to dispatch.
    pub async fn dispatch(&self, capacity: usize) -> Result<Option<DispatchReport>> {
        let mut items = self.scanner.scan(CursorKind::Messages, capacity).await;
        let messages = items.len();
        let products = self
            .scanner
            .scan(CursorKind::Products, capacity.saturating_sub(messages))
            .await;
        items.extend(products);

        if items.is_empty() {
            return Ok(None);
        }

        let product_rows: Vec<u64> = items
            .iter()
            .filter_map(|item| match item {
                WorkItem::Product(p) => Some(p.row_id),
                WorkItem::Message(_) => None,
            })
            .collect();

        let task = Task {
            id: Uuid::new_v4().to_string(),
            create_time: Utc::now(),
            report_time: None,
            payloads: items.into_iter().map(Payload::from).collect(),
        };
        let body = serde_json::to_vec(&task)?;
        self.dumper.write(&format!("{}_runner.json", task.id), &body).await;

        if let Err(e) = self.stamp_dispatched(&product_rows).await {
            warn!(task_id = %task.id, "Failed to stamp last_dispatch_time: {e}");
        }

        let job_id = put_on(self.broker.as_ref(), &self.task_tube, self.put_opts, &body)
            .await
            .inspect_err(|e| error!(task_id = %task.id, "Task put failed: {e}"))?;

        let report = DispatchReport {
            task_id: task.id,
            messages,
            products: product_rows.len(),
        };
        info!(
            task_id = %report.task_id,
            job_id,
            messages = report.messages,
            products = report.products,
            "Dispatched {} payloads",
            report.total(),
        );
        Ok(Some(report))
    }

    async fn stamp_dispatched(&self, rows: &[u64]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = format_db_time(Utc::now());
        let mut tx = self.pool.begin().await?;
        for row_id in rows {
            sqlx::query("UPDATE product SET last_dispatch_time = ? WHERE _id = ?")
                .bind(&now)
                .bind(i64::try_from(*row_id).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
