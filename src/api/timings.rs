//! In-memory histogram of pipeline cycle durations (drain + dispatch).

use std::sync::Mutex;
use std::time::Duration;

/// Shared cycle stats. Pipeline records, API reads.
/// Values stored in milliseconds.
pub struct CycleTimings {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl CycleTimings {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().clamp(1, 3_600_000) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms);
        }
    }

    /// Return (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn max_ms(&self) -> Option<u64> {
        let h = self.inner.lock().ok()?;
        (h.len() > 0).then(|| h.max())
    }

    /// Sample count.
    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for CycleTimings {
    fn default() -> Self {
        Self::new()
    }
}
