//! Daemon counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the worker loop and its workers
#[derive(Debug, Default)]
pub struct DaemonStats {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    lost: AtomicU64,
}

/// Point-in-time copy of [`DaemonStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Tasks taken from the channel
    pub received: u64,
    /// Result payloads delivered
    pub succeeded: u64,
    /// Error results delivered
    pub failed: u64,
    /// Results that could not be delivered within the publish attempts
    pub lost: u64,
}

impl StatsSnapshot {
    /// Tasks that reached a final outcome
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.lost
    }
}

impl DaemonStats {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}
