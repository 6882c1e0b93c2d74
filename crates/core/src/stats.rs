//! Process-wide counters shared by every data plane component.
//!
//! Each counter has a single logical writer; other threads read relaxed
//! snapshots that only drive heuristics (throttling, drain detection runs
//! under the switch lock and tolerates a value that is briefly stale).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge};

use crate::metrics::{METRICS_DEQUEUED_COUNT, METRICS_DIAL_ERROR_COUNT, METRICS_ENDPOINTS_LIVE, METRICS_ENQUEUED_COUNT, METRICS_QUEUE_FULL_COUNT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub endpoints: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub queue_full: u64,
    pub dial_errors: u64,
}

impl StatsSnapshot {
    pub fn connections(&self) -> usize {
        self.endpoints / 2
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    endpoints: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    queue_full: AtomicU64,
    dial_errors: AtomicU64,
}

impl Stats {
    /// Endpoints tracked by the transporter, including pairs handed over but
    /// not yet picked up by its loop.
    pub fn endpoints(&self) -> usize {
        self.endpoints.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> usize {
        self.endpoints() / 2
    }

    pub(crate) fn add_endpoints(&self, count: usize) {
        let now = self.endpoints.fetch_add(count, Ordering::AcqRel) + count;
        gauge!(METRICS_ENDPOINTS_LIVE).set(now as f64);
    }

    pub(crate) fn remove_endpoints(&self, count: usize) {
        let prev = self
            .endpoints
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| Some(current.saturating_sub(count)))
            .unwrap_or_default();
        gauge!(METRICS_ENDPOINTS_LIVE).set(prev.saturating_sub(count) as f64);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!(METRICS_ENQUEUED_COUNT).increment(1);
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        counter!(METRICS_DEQUEUED_COUNT).increment(1);
    }

    pub(crate) fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
        counter!(METRICS_QUEUE_FULL_COUNT).increment(1);
    }

    pub(crate) fn inc_dial_errors(&self) {
        self.dial_errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRICS_DIAL_ERROR_COUNT).increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            endpoints: self.endpoints(),
            enqueued: self.enqueued(),
            dequeued: self.dequeued(),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
        }
    }
}
