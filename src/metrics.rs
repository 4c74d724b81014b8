// SPDX-License-Identifier: MIT
//! In-process counters for the concurrency core.
//!
//! All counters are `AtomicU64` incremented inline on the hot path; there is
//! no sampling and no external metrics library. Embedders read a
//! [`MetricsSnapshot`] and export it however they like.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Shared counters, one instance per runtime.
#[derive(Debug)]
pub struct CoreMetrics {
    /// Transport connections opened by pools.
    pub connections_opened: AtomicU64,
    /// Transport connections closed (any reason).
    pub connections_closed: AtomicU64,
    /// Connect attempts that failed after exhausting retries.
    pub connect_failures: AtomicU64,
    /// Requests that had to wait in a pool queue.
    pub requests_queued: AtomicU64,
    /// Requests failed by their timeout tracker.
    pub requests_timed_out: AtomicU64,
    /// Pipelined responses rejected because they did not match the head of
    /// the in-flight sequence.
    pub ordering_violations: AtomicU64,
    /// Context-wrapped tasks that failed or panicked.
    pub tasks_failed: AtomicU64,
    /// Runtime start time, used for uptime in snapshots.
    started_at: Instant,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            requests_queued: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            ordering_violations: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connect_failures(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_queued(&self) {
        self.requests_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ordering_violations(&self) {
        self.ordering_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            ordering_violations: self.ordering_violations.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`CoreMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub requests_queued: u64,
    pub requests_timed_out: u64,
    pub ordering_violations: u64,
    pub tasks_failed: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = CoreMetrics::new();
        metrics.inc_connections_opened();
        metrics.inc_connections_opened();
        metrics.inc_requests_timed_out();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.requests_timed_out, 1);
        assert_eq!(snap.ordering_violations, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = CoreMetrics::new();
        metrics.inc_tasks_failed();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["tasks_failed"], 1);
        assert!(json["uptime_secs"].is_u64());
    }
}
