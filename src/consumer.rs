use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::broker::{Broker, Reservation};
use crate::config::{MalformedJobPolicy, DEFAULT_TUBE};
use crate::dump::Dumper;
use crate::notifier::Notifier;
use crate::reconcile::Reconciler;
use crate::types::Task;

/// Counters for one drain of the result tube.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub malformed: usize,
    pub changed: usize,
    pub notified_users: usize,
}

/// Drains crawl results: reconcile, notify, then delete each job.
pub struct JobConsumer {
    broker: Arc<dyn Broker>,
    reconciler: Reconciler,
    notifier: Notifier,
    dumper: Dumper,
    health: Arc<HealthState>,
    result_tube: String,
    reserve_timeout: Duration,
    malformed_policy: MalformedJobPolicy,
}

impl JobConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        reconciler: Reconciler,
        notifier: Notifier,
        dumper: Dumper,
        health: Arc<HealthState>,
        result_tube: String,
        reserve_timeout: Duration,
        malformed_policy: MalformedJobPolicy,
    ) -> Self {
        Self {
            broker,
            reconciler,
            notifier,
            dumper,
            health,
            result_tube,
            reserve_timeout,
            malformed_policy,
        }
    }

    /// Reserves jobs until the tube is empty, the broker fails, or `cancel`
    /// fires. Cancellation is only observed between jobs.
    pub async fn drain(&self, cancel: &CancellationToken) -> DrainReport {
        let mut report = DrainReport::default();

        if let Err(e) = self.broker.watch(&self.result_tube).await {
            error!(tube = %self.result_tube, "Watch failed: {e}");
            if e.is_connection() {
                self.health.set_broker_connected(false);
            }
            return report;
        }
        if let Err(e) = self.broker.ignore(DEFAULT_TUBE).await {
            warn!("Ignore '{DEFAULT_TUBE}' failed: {e}");
        }

        let mut abandoned: HashSet<u64> = HashSet::new();
        while !cancel.is_cancelled() {
            let reservation = match self.broker.reserve_with_timeout(self.reserve_timeout).await {
                Ok(r) => r,
                Err(e) => {
                    error!("Reserve failed: {e}");
                    if e.is_connection() {
                        self.health.set_broker_connected(false);
                    }
                    break;
                }
            };
            self.health.set_broker_connected(true);

            let job = match reservation {
                Reservation::Job(job) => job,
                Reservation::TimedOut => break,
                Reservation::DeadlineSoon => {
                    debug!("Deadline soon on a reserved job, ending drain");
                    break;
                }
            };

            let mut task: Task = match serde_json::from_slice(&job.body) {
                Ok(task) => task,
                Err(e) => {
                    report.malformed += 1;
                    if !abandoned.insert(job.id) {
                        warn!(job_id = job.id, "Malformed job came back in the same drain, stopping");
                        break;
                    }
                    warn!(job_id = job.id, policy = ?self.malformed_policy, "Malformed job: {e}");
                    if self.malformed_policy == MalformedJobPolicy::Delete {
                        if let Err(e) = self.broker.delete(job.id).await {
                            error!(job_id = job.id, "Delete failed: {e}");
                        }
                    }
                    continue;
                }
            };
            task.report_time = Some(Utc::now());
            if let Ok(body) = serde_json::to_vec(&task) {
                self.dumper.write(&format!("{}_result.json", task.id), &body).await;
            }
            info!(job_id = job.id, task_id = %task.id, payloads = task.payloads.len(), "Reserved job");

            let changed = match self.reconciler.collect_changed(&task).await {
                Ok(changed) => changed,
                Err(e) => {
                    // Left reserved: the broker hands it out again after TTR.
                    error!(job_id = job.id, task_id = %task.id, "Reconcile failed: {e}");
                    continue;
                }
            };

            if !changed.is_empty() {
                report.changed += changed.len();
                match self.notifier.notify(&changed).await {
                    Ok(users) => report.notified_users += users,
                    Err(e) => error!(task_id = %task.id, "Notification put failed: {e}"),
                }
            }

            if let Err(e) = self.broker.delete(job.id).await {
                error!(job_id = job.id, "Delete failed: {e}");
            }
            report.processed += 1;
        }

        if report.processed > 0 || report.malformed > 0 {
            info!(
                processed = report.processed,
                malformed = report.malformed,
                changed = report.changed,
                notified_users = report.notified_users,
                "Drain complete",
            );
        }
        report
    }
}
