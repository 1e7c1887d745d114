pub mod message;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::broker::{put_on, Broker, PutOptions};
use crate::config::{Locale, NOTIFY_TIME_FORMAT};
use crate::db::models::{ProductRow, WatchRow};
use crate::dump::Dumper;
use crate::error::Result;
use crate::types::NotificationEnvelope;

/// Turns changed product ids into per-user messages and publishes them.
pub struct Notifier {
    pool: SqlitePool,
    broker: Arc<dyn Broker>,
    dumper: Dumper,
    notify_tube: String,
    put_opts: PutOptions,
    locale: Locale,
}

impl Notifier {
    pub fn new(
        pool: SqlitePool,
        broker: Arc<dyn Broker>,
        dumper: Dumper,
        notify_tube: String,
        put_opts: PutOptions,
        locale: Locale,
    ) -> Self {
        Self {
            pool,
            broker,
            dumper,
            notify_tube,
            put_opts,
            locale,
        }
    }

    /// Messages keyed by user id. Lookup failures skip the affected product.
    pub async fn build(&self, changed_ids: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut seen = HashSet::new();

        for id in changed_ids {
            if id.is_empty() || !seen.insert(id.as_str()) {
                continue;
            }
            if let Err(e) = self.collect_for_product(id, &mut by_user).await {
                error!(product_id = %id, "Building notifications failed: {e}");
            }
        }
        by_user
    }

    async fn collect_for_product(&self, id: &str, by_user: &mut BTreeMap<String, Vec<String>>) -> Result<()> {
        let product: Option<ProductRow> = sqlx::query_as(
            r#"
            SELECT _id AS row_id, id, source, url, short_url, title, currency, price, price_low,
                   price_high, stock, sales, category, comments, update_time
            FROM product
            WHERE id = ?
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(product) = product.filter(|p| !p.price().is_unknown()) else {
            return Ok(());
        };

        let watchers: Vec<WatchRow> = sqlx::query_as(
            r#"
            SELECT user_id, currency, price, price_low, price_high, stock, watch_time,
                   remind_decrease_option, remind_decrease_value,
                   remind_increase_option, remind_increase_value
            FROM product_watch
            WHERE product_id = ? AND state = 0
            ORDER BY _id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        for watch in watchers {
            if watch.user_id.is_empty() || watch.price().is_unknown() {
                continue;
            }
            if watch.decrease().is_off() && watch.increase().is_off() {
                continue;
            }
            if let Some(text) = message::compose(&product, &watch, self.locale) {
                debug!(product_id = %id, user_id = %watch.user_id, "{text}");
                by_user.entry(watch.user_id).or_default().push(text);
            }
        }
        Ok(())
    }

    /// Builds and publishes the envelope for `changed_ids`. Returns the number
    /// of users notified; nothing is put when nobody qualifies.
    pub async fn notify(&self, changed_ids: &[String]) -> Result<usize> {
        let by_user = self.build(changed_ids).await;
        if by_user.is_empty() {
            return Ok(0);
        }
        let users = by_user.len();
        let envelope = NotificationEnvelope {
            by_user,
            create_time: Utc::now().format(NOTIFY_TIME_FORMAT).to_string(),
        };
        let body = serde_json::to_vec(&envelope)?;
        put_on(self.broker.as_ref(), &self.notify_tube, self.put_opts, &body).await?;
        self.dumper
            .write(&format!("{}_notify.json", envelope.create_time), &body)
            .await;
        info!(users, products = changed_ids.len(), "Notifications queued");
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::test_support::{insert_priced_product, insert_watch};
    use crate::types::{WatchState, NO_SCRIPT};

    const NOTIFY_TUBE: &str = "notification";

    fn notifier(pool: &SqlitePool, broker: Arc<MemoryBroker>) -> Notifier {
        Notifier::new(
            pool.clone(),
            broker,
            Dumper::disabled(),
            NOTIFY_TUBE.to_string(),
            PutOptions {
                priority: 1024,
                delay: Duration::ZERO,
                ttr: Duration::from_secs(120),
            },
            Locale::Zh,
        )
    }

    #[tokio::test]
    async fn groups_messages_by_watching_user() {
        let pool = crate::db::memory_pool().await;
        insert_priced_product(&pool, "p1", "Kettle", 0, (88.0, 0.0, 0.0)).await;
        insert_priced_product(&pool, "p2", "Lamp", 0, (50.0, 0.0, 0.0)).await;
        let watching = WatchState::Watching.code();
        insert_watch(&pool, "alice", "p1", (100.0, 0.0, 0.0), watching, (2, 10.0), (0, 0.0)).await;
        insert_watch(&pool, "alice", "p2", (60.0, 0.0, 0.0), watching, (2, 0.0), (0, 0.0)).await;
        insert_watch(&pool, "bob", "p1", (100.0, 0.0, 0.0), watching, (2, 20.0), (0, 0.0)).await;
        insert_watch(&pool, "carol", "p1", (100.0, 0.0, 0.0), WatchState::Unwatched.code(), (2, 0.0), (0, 0.0)).await;
        insert_watch(&pool, "dave", "p1", (100.0, 0.0, 0.0), watching, (0, 0.0), (0, 0.0)).await;
        insert_watch(&pool, "erin", "p1", (NO_SCRIPT, 0.0, 0.0), watching, (2, 0.0), (0, 0.0)).await;
        insert_watch(&pool, "", "p1", (100.0, 0.0, 0.0), watching, (2, 0.0), (0, 0.0)).await;

        let ids = vec!["p1".to_string(), "p2".to_string(), "p1".to_string(), "missing".to_string()];
        let by_user = notifier(&pool, Arc::new(MemoryBroker::new())).build(&ids).await;

        assert_eq!(by_user.keys().collect::<Vec<_>>(), vec!["alice"]);
        assert_eq!(
            by_user["alice"],
            vec![
                "Kettle 降价了，关注价￥100.00 现价￥88.00 降幅12% https://s.example/p1".to_string(),
                "Lamp 降价了，关注价￥60.00 现价￥50.00 降幅17% https://s.example/p2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn notify_puts_one_envelope_or_nothing() {
        let pool = crate::db::memory_pool().await;
        insert_priced_product(&pool, "p1", "Kettle", 2, (9.5, 0.0, 0.0)).await;
        insert_watch(&pool, "alice", "p1", (10.0, 0.0, 0.0), 0, (2, 0.0), (0, 0.0)).await;
        let broker = Arc::new(MemoryBroker::new());
        let notifier = notifier(&pool, Arc::clone(&broker));

        assert_eq!(notifier.notify(&["p1".to_string()]).await.unwrap(), 1);
        let bodies = broker.put_bodies(NOTIFY_TUBE);
        assert_eq!(bodies.len(), 1);
        let envelope: NotificationEnvelope = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(envelope.create_time.len(), 14);
        assert!(envelope.by_user["alice"][0].contains("$9.50"));

        assert_eq!(notifier.notify(&["nope".to_string()]).await.unwrap(), 0);
        assert_eq!(broker.put_bodies(NOTIFY_TUBE).len(), 1);
    }
}
