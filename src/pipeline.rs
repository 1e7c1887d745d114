use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{CycleTimings, HealthState};
use crate::broker::{Broker, PutOptions};
use crate::config::Config;
use crate::consumer::{DrainReport, JobConsumer};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::dump::Dumper;
use crate::notifier::Notifier;
use crate::reconcile::Reconciler;
use crate::scanner::ChangeScanner;
use crate::state::{CheckpointStore, Cursors};

/// Everything the pipeline shares with the rest of the process.
#[derive(Clone)]
pub struct PipelineContext {
    pub cfg: Config,
    pub pool: SqlitePool,
    pub broker: Arc<dyn Broker>,
    pub checkpoints: CheckpointStore,
    pub cursors: Arc<Cursors>,
    pub health: Arc<HealthState>,
    pub timings: Arc<CycleTimings>,
    pub dumper: Dumper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub drain: DrainReport,
    pub dispatched: Option<DispatchReport>,
}

/// One drain of the result tube followed by one dispatch, repeated.
pub struct Pipeline {
    consumer: JobConsumer,
    dispatcher: Dispatcher,
    health: Arc<HealthState>,
    timings: Arc<CycleTimings>,
    batch_capacity: usize,
    polling_interval: Duration,
}

impl Pipeline {
    pub fn new(ctx: &PipelineContext) -> Self {
        let cfg = &ctx.cfg;
        let put_opts = PutOptions {
            priority: cfg.put_priority,
            delay: cfg.put_delay,
            ttr: cfg.put_ttr,
        };

        let scanner = ChangeScanner::new(
            ctx.pool.clone(),
            ctx.checkpoints.clone(),
            Arc::clone(&ctx.cursors),
            cfg.redispatch_interval,
        );
        let dispatcher = Dispatcher::new(
            scanner,
            ctx.pool.clone(),
            Arc::clone(&ctx.broker),
            ctx.dumper.clone(),
            cfg.task_tube.clone(),
            put_opts,
        );
        let notifier = Notifier::new(
            ctx.pool.clone(),
            Arc::clone(&ctx.broker),
            ctx.dumper.clone(),
            cfg.notify_tube.clone(),
            put_opts,
            cfg.locale,
        );
        let consumer = JobConsumer::new(
            Arc::clone(&ctx.broker),
            Reconciler::new(ctx.pool.clone()),
            notifier,
            ctx.dumper.clone(),
            Arc::clone(&ctx.health),
            cfg.result_tube.clone(),
            cfg.reserve_timeout,
            cfg.malformed_job_policy,
        );

        Self {
            consumer,
            dispatcher,
            health: Arc::clone(&ctx.health),
            timings: Arc::clone(&ctx.timings),
            batch_capacity: cfg.batch_capacity,
            polling_interval: cfg.polling_interval,
        }
    }

    /// Runs cycles until `cancel` fires. The first cycle starts immediately;
    /// the pause is measured from the end of a cycle, so cycles never overlap.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            capacity = self.batch_capacity,
            interval_secs = self.polling_interval.as_secs(),
            "Pipeline started"
        );
        while !cancel.is_cancelled() {
            self.run_cycle(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.polling_interval) => {}
            }
        }
        info!("Pipeline stopped");
    }

    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let drain = self.consumer.drain(cancel).await;

        let dispatched = if cancel.is_cancelled() {
            None
        } else {
            match self.dispatcher.dispatch(self.batch_capacity).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Dispatch failed: {e}");
                    None
                }
            }
        };

        let elapsed = started.elapsed();
        self.timings.record(elapsed);
        self.health.record_cycle(
            now_ns(),
            dispatched.as_ref().map_or(0, |d| d.total() as u64),
            drain.changed as u64,
        );
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Cycle complete");

        CycleReport { drain, dispatched }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
