use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::health::HealthState;
use crate::api::timings::CycleTimings;
use crate::db::models::ProductUpdateRow;
use crate::error::AppError;
use crate::state::{CursorKind, Cursors};

const DEFAULT_UPDATES_LIMIT: i64 = 50;
const MAX_UPDATES_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub health: Arc<HealthState>,
    pub timings: Arc<CycleTimings>,
    pub cursors: Arc<Cursors>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/cycles", get(get_stats_cycles))
        .route("/cursors", get(get_cursors))
        .route("/products/:id/updates", get(get_product_updates))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct UpdatesQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
    pub cycles_completed: u64,
    pub last_cycle_at_ns: Option<u64>,
    pub last_dispatched: u64,
    pub last_changed: u64,
}

#[derive(Serialize)]
pub struct CycleStatsResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct CursorsResponse {
    pub last_check_msg: u64,
    pub last_check_product: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let h = &state.health;
    let last = h.last_cycle_at_ns();
    Json(HealthResponse {
        status: if h.broker_connected() { "ok" } else { "degraded" },
        broker_connected: h.broker_connected(),
        cycles_completed: h.cycles_completed(),
        last_cycle_at_ns: (last > 0).then_some(last),
        last_dispatched: h.last_dispatched(),
        last_changed: h.last_changed(),
    })
}

async fn get_stats_cycles(State(state): State<ApiState>) -> Json<CycleStatsResponse> {
    let (p50_ms, p95_ms, p99_ms) = state.timings.percentiles();
    Json(CycleStatsResponse {
        samples: state.timings.len(),
        p50_ms,
        p95_ms,
        p99_ms,
        max_ms: state.timings.max_ms(),
    })
}

async fn get_cursors(State(state): State<ApiState>) -> Json<CursorsResponse> {
    Json(CursorsResponse {
        last_check_msg: state.cursors.get(CursorKind::Messages),
        last_check_product: state.cursors.get(CursorKind::Products),
    })
}

async fn get_product_updates(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
    Query(params): Query<UpdatesQuery>,
) -> Result<Json<Vec<ProductUpdateRow>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_UPDATES_LIMIT)
        .clamp(1, MAX_UPDATES_LIMIT);

    let known: Option<i64> = sqlx::query_scalar("SELECT _id FROM product WHERE id = ?")
        .bind(&product_id)
        .fetch_optional(&state.pool)
        .await?;
    if known.is_none() {
        return Err(AppError::NotFound(format!("product {product_id}")));
    }

    let rows: Vec<ProductUpdateRow> = sqlx::query_as(
        r#"
        SELECT id, title, currency, price, price_low, price_high, stock, sales, comments, update_time
        FROM product_update
        WHERE id = ?
        ORDER BY update_time DESC, _id DESC
        LIMIT ?
        "#,
    )
    .bind(&product_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}
