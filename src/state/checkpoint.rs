use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::SqlitePool;
use tracing::{error, info};

use crate::config::{CURSOR_KEY_MESSAGES, CURSOR_KEY_PRODUCTS};
use crate::error::{AppError, Result};

/// Durable key/value store for scan cursors. Lives in its own SQLite file so
/// the main database can be restored without rewinding the cursors.
#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = crate::db::connect(path).await?;
        Self::new(pool).await
    }

    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = sqlx::query_scalar("SELECT value FROM checkpoint WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads a decimal-encoded counter. Missing keys read as None.
    pub async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| AppError::Checkpoint(format!("value of '{key}' is not a decimal id")))
    }

    pub async fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        self.put(key, value.to_string().as_bytes()).await
    }
}

/// Which scan cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Messages,
    Products,
}

impl CursorKind {
    pub fn key(self) -> &'static str {
        match self {
            CursorKind::Messages => CURSOR_KEY_MESSAGES,
            CursorKind::Products => CURSOR_KEY_PRODUCTS,
        }
    }
}

/// Current cursor values. The scanner is the only writer; the status API reads.
#[derive(Debug, Default)]
pub struct Cursors {
    messages: AtomicU64,
    products: AtomicU64,
}

impl Cursors {
    pub fn new(messages: u64, products: u64) -> Self {
        Self {
            messages: AtomicU64::new(messages),
            products: AtomicU64::new(products),
        }
    }

    /// Reads both cursors once at startup.
    pub async fn load(store: &CheckpointStore) -> Result<Self> {
        let messages = store.get_u64(CURSOR_KEY_MESSAGES).await?.unwrap_or(0);
        let products = store.get_u64(CURSOR_KEY_PRODUCTS).await?.unwrap_or(0);
        info!("last_check_msg={messages}, last_check_product={products}");
        Ok(Self::new(messages, products))
    }

    pub fn get(&self, kind: CursorKind) -> u64 {
        self.slot(kind).load(Ordering::Acquire)
    }

    /// Persists `last_id` when it moves the cursor forward, then publishes it.
    /// A failed write still advances the in-memory value: a crash before the
    /// next successful write only replays rows, it never skips them.
    pub async fn advance(&self, store: &CheckpointStore, kind: CursorKind, last_id: u64) -> u64 {
        let current = self.get(kind);
        if last_id <= current {
            return current;
        }
        if let Err(e) = store.put_u64(kind.key(), last_id).await {
            error!(cursor = kind.key(), last_id, "Checkpoint write failed: {e}");
        }
        self.slot(kind).store(last_id, Ordering::Release);
        last_id
    }

    fn slot(&self, kind: CursorKind) -> &AtomicU64 {
        match kind {
            CursorKind::Messages => &self.messages,
            CursorKind::Products => &self.products,
        }
    }
}
