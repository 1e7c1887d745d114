//! Shared health state for the /health endpoint.
//! Updated by the pipeline loop and the job consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared health metrics. Updated by pipeline components, read by API.
#[derive(Default)]
pub struct HealthState {
    /// False once a broker call failed on the connection itself.
    pub broker_connected: AtomicBool,
    pub cycles_completed: AtomicU64,
    /// Nanosecond timestamp of the last finished cycle (0 = none).
    pub last_cycle_at_ns: AtomicU64,
    /// Payloads in the last dispatched task envelope.
    pub last_dispatched: AtomicU64,
    /// Changed products found by the last drain.
    pub last_changed: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broker_connected(&self, v: bool) {
        self.broker_connected.store(v, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, at_ns: u64, dispatched: u64, changed: u64) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_at_ns.store(at_ns, Ordering::Relaxed);
        self.last_dispatched.store(dispatched, Ordering::Relaxed);
        self.last_changed.store(changed, Ordering::Relaxed);
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Relaxed)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn last_cycle_at_ns(&self) -> u64 {
        self.last_cycle_at_ns.load(Ordering::Relaxed)
    }

    pub fn last_dispatched(&self) -> u64 {
        self.last_dispatched.load(Ordering::Relaxed)
    }

    pub fn last_changed(&self) -> u64 {
        self.last_changed.load(Ordering::Relaxed)
    }
}
