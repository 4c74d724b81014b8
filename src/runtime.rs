// SPDX-License-Identifier: MIT
//! Core runtime — owns the event workers and creates execution contexts.
//!
//! The runtime spawns a fixed set of event-processing workers at startup
//! and never resizes it. Contexts with event-loop affinity are distributed
//! over the set round-robin; ordered background contexts each get a
//! dedicated worker of their own. A context never migrates off the worker
//! it was bound to at creation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::metrics::{CoreMetrics, MetricsSnapshot};
use crate::worker::{self, Worker, WorkerKind};

/// Handle to the concurrency core. Cheap to clone; all clones share the
/// same workers and metrics.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: CoreConfig,
    metrics: Arc<CoreMetrics>,
    event_workers: Vec<Worker>,
    next_worker: AtomicUsize,
    closed: AtomicBool,
}

impl Runtime {
    /// Validate `config` and start the event workers.
    ///
    /// Must be called from within a tokio runtime; workers are spawned on
    /// the ambient runtime.
    pub fn new(config: CoreConfig) -> Result<Runtime, CoreError> {
        config.validate()?;
        let event_workers = (0..config.event_workers)
            .map(|_| worker::spawn(WorkerKind::EventLoop))
            .collect();
        info!(event_workers = config.event_workers, "runtime started");
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                metrics: Arc::new(CoreMetrics::new()),
                event_workers,
                next_worker: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Start with default configuration.
    pub fn with_defaults() -> Result<Runtime, CoreError> {
        Self::new(CoreConfig::default())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.inner.metrics
    }

    /// Point-in-time copy of the core's counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Create a context bound to one of the shared event workers,
    /// assigned round-robin.
    pub fn create_event_context(&self) -> ExecutionContext {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("creating context on a runtime that is shut down");
        }
        let workers = &self.inner.event_workers;
        let index = self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
        ExecutionContext::new(
            workers[index].handle.clone(),
            self.inner.config.ambient_propagation,
            self.inner.metrics.clone(),
        )
    }

    /// Create a context with its own ordered background worker. The worker
    /// drains and stops on its own once the context (and every clone of it)
    /// is gone.
    pub fn create_ordered_context(&self) -> ExecutionContext {
        let worker = worker::spawn(WorkerKind::Ordered);
        ExecutionContext::new(
            worker.handle,
            self.inner.config.ambient_propagation,
            self.inner.metrics.clone(),
        )
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the event workers. Queued event-worker tasks are dropped;
    /// ordered workers are unaffected and drain on their own. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.inner.event_workers {
            worker.join.abort();
        }
        info!("runtime shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("event_workers", &self.inner.event_workers.len())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Affinity;
    use tokio::sync::oneshot;

    fn small_runtime() -> Runtime {
        let mut config = CoreConfig::default();
        config.event_workers = 2;
        Runtime::new(config).unwrap()
    }

    #[tokio::test]
    async fn event_contexts_round_robin_over_workers() {
        let runtime = small_runtime();
        let a = runtime.create_event_context();
        let b = runtime.create_event_context();
        let c = runtime.create_event_context();

        assert_eq!(a.affinity(), Affinity::EventLoop);
        assert_ne!(a.worker().id(), b.worker().id());
        // Two workers: the third context wraps around to the first worker.
        assert_eq!(a.worker().id(), c.worker().id());
        runtime.shutdown();
    }

    #[tokio::test]
    async fn ordered_contexts_get_dedicated_workers() {
        let runtime = small_runtime();
        let a = runtime.create_ordered_context();
        let b = runtime.create_ordered_context();
        assert_eq!(a.affinity(), Affinity::OrderedWorker);
        assert_ne!(a.worker().id(), b.worker().id());

        let (tx, rx) = oneshot::channel();
        a.submit(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        runtime.shutdown();
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut config = CoreConfig::default();
        config.event_workers = 0;
        assert!(Runtime::new(config).is_err());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let runtime = small_runtime();
        runtime.shutdown();
        runtime.shutdown();
        assert!(runtime.is_shut_down());
    }
}
