use chrono::Utc;
use sqlx::{Acquire, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::models::{MessageOriginRow, SnapshotRow, WatchStateRow};
use crate::error::Result;
use crate::types::{format_db_time, MessagePayload, Payload, Price, ProductPayload, Task, WatchState};

/// What reconciling a single crawl result did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Price moved; history appended and product updated.
    Changed,
    /// No history existed yet; the snapshot was recorded as the baseline.
    FirstSeen,
    Unchanged,
}

/// True when `new` differs from `old` in a way worth recording.
/// Mixed or unknown prices never count as a change.
pub fn validate_changed(new: &Price, old: &Price) -> bool {
    match (new, old) {
        (Price::Range { low: nl, high: nh }, Price::Range { low: ol, high: oh }) => {
            if *nl < 0.0 || *nh < 0.0 || *ol < 0.0 || *oh < 0.0 {
                return false;
            }
            nl != ol || nh != oh
        }
        (Price::Known(n), Price::Known(o)) => n != o,
        _ => false,
    }
}

/// Folds crawl results into product history, products and watches.
pub struct Reconciler {
    pool: SqlitePool,
}

impl Reconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reconciles every payload of `task` and returns the external ids of
    /// products whose price changed. Each item runs in its own savepoint; a
    /// failing item is rolled back and skipped, the rest still commit.
    pub async fn collect_changed(&self, task: &Task) -> Result<Vec<String>> {
        let fallback_time = task.report_time.unwrap_or_else(Utc::now);
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::new();
        let mut first_seen = 0usize;

        for (index, payload) in task.payloads.iter().enumerate() {
            let Some(product) = eligible_product(payload) else {
                continue;
            };

            let mut item = Acquire::begin(&mut tx).await?;
            match reconcile_item(&mut item, payload.message.as_ref(), product, fallback_time).await {
                Ok(outcome) => {
                    item.commit().await?;
                    match outcome {
                        ItemOutcome::Changed => changed.push(product.id.clone()),
                        ItemOutcome::FirstSeen => first_seen += 1,
                        ItemOutcome::Unchanged => {}
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, index, product_id = %product.id, "Item skipped: {e}");
                    if let Err(e) = item.rollback().await {
                        warn!(task_id = %task.id, "Savepoint rollback failed: {e}");
                    }
                }
            }
        }

        tx.commit().await?;
        info!(
            task_id = %task.id,
            payloads = task.payloads.len(),
            changed = changed.len(),
            first_seen,
            "Task reconciled",
        );
        Ok(changed)
    }
}

fn eligible_product(payload: &Payload) -> Option<&ProductPayload> {
    let product = payload.product.as_ref()?;
    if product.id.is_empty() || product.price().is_unknown() {
        return None;
    }
    Some(product)
}

async fn reconcile_item(
    conn: &mut SqliteConnection,
    message: Option<&MessagePayload>,
    product: &ProductPayload,
    fallback_time: chrono::DateTime<Utc>,
) -> Result<ItemOutcome> {
    if let Some(message) = message.filter(|m| !m.id.is_empty()) {
        register_watch(conn, &message.id, product).await?;
    }

    let latest: Option<SnapshotRow> = sqlx::query_as(
        r#"
        SELECT price, price_low, price_high, stock
        FROM product_update
        WHERE id = ?
        ORDER BY update_time DESC, _id DESC
        LIMIT 1
        "#,
    )
    .bind(&product.id)
    .fetch_optional(&mut *conn)
    .await?;

    let update_time = format_db_time(product.update_time.unwrap_or(fallback_time));
    let outcome = match latest {
        None => ItemOutcome::FirstSeen,
        Some(old) if validate_changed(&product.price(), &old.price()) => ItemOutcome::Changed,
        Some(_) => return Ok(ItemOutcome::Unchanged),
    };
    record_snapshot(conn, product, &update_time).await?;
    Ok(outcome)
}

/// Attaches the sender of `message_id` as a watcher of `product`.
async fn register_watch(conn: &mut SqliteConnection, message_id: &str, product: &ProductPayload) -> Result<()> {
    let origin: Option<MessageOriginRow> =
        sqlx::query_as("SELECT from_user_id, create_time FROM msg WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some(origin) = origin.filter(|o| !o.from_user_id.is_empty()) else {
        debug!(message_id, "No sender for message, watch not registered");
        return Ok(());
    };

    let existing: Option<WatchStateRow> =
        sqlx::query_as("SELECT _id AS row_id, state FROM product_watch WHERE user_id = ? AND product_id = ?")
            .bind(&origin.from_user_id)
            .bind(&product.id)
            .fetch_optional(&mut *conn)
            .await?;

    match existing {
        None => {
            let (price, low, high) = product.price().to_columns();
            sqlx::query(
                r#"
                INSERT INTO product_watch (user_id, product_id, currency, price, price_low, price_high,
                                           stock, watch_time, state)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&origin.from_user_id)
            .bind(&product.id)
            .bind(product.currency)
            .bind(price)
            .bind(low)
            .bind(high)
            .bind(product.stock)
            .bind(&origin.create_time)
            .bind(WatchState::Watching.code())
            .execute(&mut *conn)
            .await?;
            info!(user_id = %origin.from_user_id, product_id = %product.id, "Watch created");
        }
        Some(row) if WatchState::from_code(row.state) == WatchState::Unwatched => {
            sqlx::query("UPDATE product_watch SET state = ?, watch_time = ?, unwatch_time = NULL WHERE _id = ?")
                .bind(WatchState::Watching.code())
                .bind(&origin.create_time)
                .bind(row.row_id)
                .execute(&mut *conn)
                .await?;
            info!(user_id = %origin.from_user_id, product_id = %product.id, "Watch reactivated");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Appends a history row and upserts the product. An update never touches
/// last_dispatch_time and keeps the stored url when the crawl reported none.
async fn record_snapshot(conn: &mut SqliteConnection, product: &ProductPayload, update_time: &str) -> Result<()> {
    let (price, low, high) = product.price().to_columns();
    let comments = product.comments_blob();

    sqlx::query(
        r#"
        INSERT INTO product_update (id, source, url, short_url, title, currency, price, price_low,
                                    price_high, stock, sales, category, comments, update_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&product.id)
    .bind(product.source)
    .bind(&product.url)
    .bind(&product.short_url)
    .bind(&product.title)
    .bind(product.currency)
    .bind(price)
    .bind(low)
    .bind(high)
    .bind(product.stock)
    .bind(product.sales)
    .bind(&product.category)
    .bind(&comments)
    .bind(update_time)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO product (id, source, url, short_url, title, currency, price, price_low, price_high,
                             stock, sales, category, comments, update_time, last_dispatch_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source      = excluded.source,
            url         = CASE WHEN excluded.url = '' THEN product.url ELSE excluded.url END,
            short_url   = CASE WHEN excluded.short_url = '' THEN product.short_url ELSE excluded.short_url END,
            title       = excluded.title,
            currency    = excluded.currency,
            price       = excluded.price,
            price_low   = excluded.price_low,
            price_high  = excluded.price_high,
            stock       = excluded.stock,
            sales       = excluded.sales,
            category    = excluded.category,
            comments    = excluded.comments,
            update_time = excluded.update_time
        "#,
    )
    .bind(&product.id)
    .bind(product.source)
    .bind(&product.url)
    .bind(&product.short_url)
    .bind(&product.title)
    .bind(product.currency)
    .bind(price)
    .bind(low)
    .bind(high)
    .bind(product.stock)
    .bind(product.sales)
    .bind(&product.category)
    .bind(&comments)
    .bind(update_time)
    .bind(update_time)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::MSG_TYPE_LINK;
    use crate::test_support::{count, insert_message, insert_product, insert_watch, LONG_AGO};
    use crate::types::{NO_SCRIPT, RANGE_PRICE};

    fn result_item(id: &str, price: f64, minute: u32) -> Payload {
        Payload {
            message: None,
            product: Some(ProductPayload {
                id: id.to_string(),
                url: format!("https://item.example/{id}"),
                short_url: format!("https://s.example/{id}"),
                title: format!("Product {id}"),
                price,
                stock: 3,
                update_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()),
                ..ProductPayload::default()
            }),
        }
    }

    fn task(payloads: Vec<Payload>) -> Task {
        Task {
            id: "t1".to_string(),
            create_time: Utc::now(),
            report_time: Some(Utc::now()),
            payloads,
        }
    }

    #[test]
    fn change_detection_table() {
        let r = |low, high| Price::Range { low, high };
        let k = Price::Known;
        let cases = [
            (k(10.0), k(10.0), false),
            (k(9.0), k(10.0), true),
            (k(0.0), k(10.0), true),
            (r(1.0, 2.0), r(1.0, 2.0), false),
            (r(1.0, 3.0), r(1.0, 2.0), true),
            (r(0.5, 2.0), r(1.0, 2.0), true),
            (r(-1.0, 2.0), r(1.0, 2.0), false),
            (r(1.0, 2.0), r(1.0, -2.0), false),
            (k(10.0), r(1.0, 2.0), false),
            (r(1.0, 2.0), k(10.0), false),
            (Price::Unknown, k(10.0), false),
            (k(10.0), Price::Unknown, false),
        ];
        for (new, old, expected) in cases {
            assert_eq!(validate_changed(&new, &old), expected, "{new:?} vs {old:?}");
        }
    }

    #[tokio::test]
    async fn first_result_is_a_baseline_then_moves_are_reported() {
        let pool = crate::db::memory_pool().await;
        let reconciler = Reconciler::new(pool.clone());

        let changed = reconciler.collect_changed(&task(vec![result_item("p1", 100.0, 0)])).await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product_update").await, 1);
        let dispatched: String = sqlx::query_scalar("SELECT last_dispatch_time FROM product WHERE id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(dispatched, "2024-05-01 10:00:00");

        let changed = reconciler.collect_changed(&task(vec![result_item("p1", 88.0, 5)])).await.unwrap();
        assert_eq!(changed, vec!["p1".to_string()]);
        let price: f64 = sqlx::query_scalar("SELECT price FROM product WHERE id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(price, 88.0);
        let dispatched: String = sqlx::query_scalar("SELECT last_dispatch_time FROM product WHERE id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(dispatched, "2024-05-01 10:00:00");
    }

    #[tokio::test]
    async fn replaying_a_result_writes_nothing() {
        let pool = crate::db::memory_pool().await;
        let reconciler = Reconciler::new(pool.clone());
        reconciler.collect_changed(&task(vec![result_item("p1", 100.0, 0)])).await.unwrap();
        let moved = task(vec![result_item("p1", 90.0, 5)]);

        assert_eq!(reconciler.collect_changed(&moved).await.unwrap(), vec!["p1".to_string()]);
        let rows = count(&pool, "SELECT COUNT(*) FROM product_update").await;
        assert!(reconciler.collect_changed(&moved).await.unwrap().is_empty());
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product_update").await, rows);
    }

    #[tokio::test]
    async fn unusable_items_are_skipped() {
        let pool = crate::db::memory_pool().await;
        let reconciler = Reconciler::new(pool.clone());
        let payloads = vec![
            Payload::default(),
            result_item("", 10.0, 0),
            result_item("p-unknown", NO_SCRIPT, 0),
        ];
        assert!(reconciler.collect_changed(&task(payloads)).await.unwrap().is_empty());
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product_update").await, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product").await, 0);
    }

    #[tokio::test]
    async fn range_results_compare_bounds() {
        let pool = crate::db::memory_pool().await;
        let reconciler = Reconciler::new(pool.clone());
        let range = |low: f64, high: f64, minute| {
            let mut p = result_item("p1", RANGE_PRICE, minute);
            let product = p.product.as_mut().unwrap();
            product.price_low = low;
            product.price_high = high;
            p
        };
        reconciler.collect_changed(&task(vec![range(10.0, 20.0, 0)])).await.unwrap();
        assert!(reconciler.collect_changed(&task(vec![range(10.0, 20.0, 1)])).await.unwrap().is_empty());
        assert_eq!(
            reconciler.collect_changed(&task(vec![range(10.0, 25.0, 2)])).await.unwrap(),
            vec!["p1".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_result_url_keeps_the_stored_one() {
        let pool = crate::db::memory_pool().await;
        insert_product(&pool, "p1", "https://item.example/original", LONG_AGO).await;
        let reconciler = Reconciler::new(pool.clone());
        let mut item = result_item("p1", 50.0, 0);
        item.product.as_mut().unwrap().url.clear();

        reconciler.collect_changed(&task(vec![item])).await.unwrap();
        let url: String = sqlx::query_scalar("SELECT url FROM product WHERE id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(url, "https://item.example/original");
        let dispatched: String = sqlx::query_scalar("SELECT last_dispatch_time FROM product WHERE id = 'p1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(dispatched, LONG_AGO);
    }

    #[tokio::test]
    async fn message_results_create_and_reactivate_watches() {
        let pool = crate::db::memory_pool().await;
        insert_message(&pool, "m1", MSG_TYPE_LINK, "", "https://item.example/p1", "alice").await;
        insert_message(&pool, "m2", MSG_TYPE_LINK, "", "https://item.example/p2", "bob").await;
        insert_message(&pool, "m3", MSG_TYPE_LINK, "", "https://item.example/p3", "carol").await;
        insert_watch(&pool, "bob", "p2", (120.0, 0.0, 0.0), WatchState::Unwatched.code(), (2, 0.0), (0, 0.0)).await;
        insert_watch(&pool, "carol", "p3", (70.0, 0.0, 0.0), WatchState::Watching.code(), (2, 0.0), (0, 0.0)).await;

        let with_message = |msg: &str, product: &str, price: f64| {
            let mut p = result_item(product, price, 0);
            p.message = Some(MessagePayload {
                id: msg.to_string(),
                ..MessagePayload::default()
            });
            p
        };
        Reconciler::new(pool.clone())
            .collect_changed(&task(vec![
                with_message("m1", "p1", 100.0),
                with_message("m2", "p2", 100.0),
                with_message("m3", "p3", 100.0),
            ]))
            .await
            .unwrap();

        let created: (f64, i64, String, i64) = sqlx::query_as(
            "SELECT price, stock, watch_time, state FROM product_watch WHERE user_id = 'alice' AND product_id = 'p1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(created, (100.0, 3, "2024-05-01 09:30:00".to_string(), 0));

        let reactivated: (i64, String) =
            sqlx::query_as("SELECT state, watch_time FROM product_watch WHERE user_id = 'bob'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(reactivated, (0, "2024-05-01 09:30:00".to_string()));

        let untouched: (f64, String) =
            sqlx::query_as("SELECT price, watch_time FROM product_watch WHERE user_id = 'carol'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(untouched, (70.0, LONG_AGO.to_string()));
    }

    #[tokio::test]
    async fn failing_item_rolls_back_alone() {
        let pool = crate::db::memory_pool().await;
        sqlx::query("DROP TABLE msg").execute(&pool).await.unwrap();

        let mut broken = result_item("p2", 20.0, 0);
        broken.message = Some(MessagePayload {
            id: "m2".to_string(),
            ..MessagePayload::default()
        });
        let changed = Reconciler::new(pool.clone())
            .collect_changed(&task(vec![result_item("p1", 10.0, 0), broken, result_item("p3", 30.0, 0)]))
            .await
            .unwrap();

        assert!(changed.is_empty());
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product").await, 2);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product WHERE id = 'p2'").await, 0);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM product_update WHERE id = 'p2'").await, 0);
    }
}
