use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::response::HttpResponse;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueStats {
    /// Submitted and not yet running: queued or held by the backoff gate.
    pub pending: u64,
    pub active: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub backoff_trips: u64,
    pub total: u64,
    pub peak_active: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
}

impl QueueStats {
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct QueueCounters {
    inner: Arc<QueueCountersInner>,
}

#[derive(Debug, Default)]
struct QueueCountersInner {
    submitted: AtomicU64,
    queued: AtomicU64,
    held: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

pub(crate) struct HeldGuard {
    counters: QueueCounters,
}

pub(crate) struct ActiveGuard {
    counters: QueueCounters,
}

impl QueueCounters {
    pub(crate) fn record_submitted(&self) {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unsent(&self) {
        self.inner.submitted.fetch_sub(1, Ordering::Relaxed);
        self.inner.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.inner.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_held(&self) -> HeldGuard {
        self.inner.held.fetch_add(1, Ordering::Relaxed);
        HeldGuard {
            counters: self.clone(),
        }
    }

    pub(crate) fn enter_active(&self) -> ActiveGuard {
        let now_active = self.inner.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.peak_active.fetch_max(now_active, Ordering::Relaxed);
        ActiveGuard {
            counters: self.clone(),
        }
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, result: &crate::Result<HttpResponse>, latency: Duration) {
        match result {
            Ok(_) => self.inner.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.inner.failed.fetch_add(1, Ordering::Relaxed),
        };
        let latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        self.inner
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, backoff_trips: u64) -> QueueStats {
        let succeeded = self.inner.succeeded.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let finished = succeeded + failed;
        QueueStats {
            pending: self.inner.queued.load(Ordering::Relaxed)
                + self.inner.held.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            succeeded,
            failed,
            retries: self.inner.retries.load(Ordering::Relaxed),
            backoff_trips,
            total: self.inner.submitted.load(Ordering::Relaxed),
            peak_active: self.inner.peak_active.load(Ordering::Relaxed),
            average_latency_ms: if latency_samples == 0 {
                0.0
            } else {
                latency_total_ms as f64 / latency_samples as f64
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                succeeded as f64 / finished as f64
            },
        }
    }
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        self.counters.inner.held.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.inner.active.fetch_sub(1, Ordering::Relaxed);
    }
}
