//! Row seeding helpers shared by the pipeline tests.

use sqlx::SqlitePool;

pub const LONG_AGO: &str = "2000-01-01 00:00:00";

pub async fn insert_message(
    pool: &SqlitePool,
    id: &str,
    msg_type: i64,
    content: &str,
    url: &str,
    from_user_id: &str,
) -> i64 {
    sqlx::query(
        "INSERT INTO msg (id, type, content, url, from_user_id, create_time) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(msg_type)
    .bind(content)
    .bind(url)
    .bind(from_user_id)
    .bind("2024-05-01 09:30:00")
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn insert_product(pool: &SqlitePool, id: &str, url: &str, last_dispatch_time: &str) -> i64 {
    sqlx::query(
        "INSERT INTO product (id, url, update_time, last_dispatch_time) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(url)
    .bind(LONG_AGO)
    .bind(last_dispatch_time)
    .execute(pool)
    .await
    .unwrap()
    .last_insert_rowid()
}

/// Product row with a known price, short url and title, as reconciliation would leave it.
pub async fn insert_priced_product(pool: &SqlitePool, id: &str, title: &str, currency: i64, price: (f64, f64, f64)) {
    sqlx::query(
        r#"
        INSERT INTO product (id, url, short_url, title, currency, price, price_low, price_high,
                             update_time, last_dispatch_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(format!("https://item.example/{id}"))
    .bind(format!("https://s.example/{id}"))
    .bind(title)
    .bind(currency)
    .bind(price.0)
    .bind(price.1)
    .bind(price.2)
    .bind(LONG_AGO)
    .bind(LONG_AGO)
    .execute(pool)
    .await
    .unwrap();
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_watch(
    pool: &SqlitePool,
    user_id: &str,
    product_id: &str,
    price: (f64, f64, f64),
    state: i64,
    decrease: (i64, f64),
    increase: (i64, f64),
) {
    sqlx::query(
        r#"
        INSERT INTO product_watch (user_id, product_id, currency, price, price_low, price_high,
                                   watch_time, state,
                                   remind_decrease_option, remind_decrease_value,
                                   remind_increase_option, remind_increase_value)
        VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(product_id)
    .bind(price.0)
    .bind(price.1)
    .bind(price.2)
    .bind(LONG_AGO)
    .bind(state)
    .bind(decrease.0)
    .bind(decrease.1)
    .bind(increase.0)
    .bind(increase.1)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}
