mod api;
mod broker;
mod config;
mod consumer;
mod db;
mod dispatcher;
mod dump;
mod error;
mod notifier;
mod pipeline;
mod reconcile;
mod scanner;
mod state;
#[cfg(test)]
mod test_support;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::api::{CycleTimings, HealthState};
use crate::broker::BeanstalkClient;
use crate::config::{Config, BROKER_RETRY_BACKOFF_SECS, CONNECT_ATTEMPTS, DB_RETRY_BACKOFF_SECS};
use crate::dump::Dumper;
use crate::error::{AppError, Result};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::state::{CheckpointStore, Cursors};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Stores ---
    let pool = db::connect_with_retry(
        &cfg.db_path,
        CONNECT_ATTEMPTS,
        Duration::from_secs(DB_RETRY_BACKOFF_SECS),
    )
    .await?;
    db::migrate(&pool).await?;

    let checkpoints = CheckpointStore::open(&cfg.checkpoint_path).await?;
    let cursors = Arc::new(Cursors::load(&checkpoints).await?);

    // --- Broker ---
    let broker = BeanstalkClient::connect_with_retry(
        &cfg.broker_addr(),
        CONNECT_ATTEMPTS,
        Duration::from_secs(BROKER_RETRY_BACKOFF_SECS),
    )
    .await
    .map_err(|e| AppError::Bootstrap(format!("broker at {} unreachable: {e}", cfg.broker_addr())))?;
    info!(
        addr = broker.addr(),
        results = %cfg.result_tube,
        tasks = %cfg.task_tube,
        notifications = %cfg.notify_tube,
        "Broker ready"
    );

    let dumper = Dumper::new(cfg.dump_dir.clone());
    dumper.prepare().await;

    let health = Arc::new(HealthState::new());
    health.set_broker_connected(true);
    let timings = Arc::new(CycleTimings::new());
    let cancel = CancellationToken::new();

    // HTTP API server
    let api_state = ApiState {
        pool: pool.clone(),
        health: Arc::clone(&health),
        timings: Arc::clone(&timings),
        cursors: Arc::clone(&cursors),
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });

    // Pipeline (drain + dispatch, every polling interval)
    let ctx = PipelineContext {
        cfg,
        pool,
        broker: Arc::new(broker),
        checkpoints,
        cursors,
        health,
        timings,
        dumper,
    };
    let pipeline = Pipeline::new(&ctx);
    let pipeline_handle = tokio::spawn(pipeline.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = pipeline_handle.await {
        error!("Pipeline task failed: {e}");
    }
    match api_handle.await {
        Ok(Err(e)) => error!("HTTP API stopped with error: {e}"),
        Err(e) => error!("HTTP API task failed: {e}"),
        Ok(Ok(())) => {}
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl-C), starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
