pub mod models;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::Result;

/// Opens (creating if needed) the SQLite file at `path`.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
    Ok(pool)
}

/// Connects with a fixed backoff between attempts; the last error is returned.
pub async fn connect_with_retry(path: &str, attempts: u32, backoff: Duration) -> Result<SqlitePool> {
    let mut attempt = 1;
    loop {
        match connect(path).await {
            Ok(pool) => {
                info!("Database ready at {path}");
                return Ok(pool);
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, "Database connect failed: {e}, retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
