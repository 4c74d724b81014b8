// SPDX-License-Identifier: MIT
//! Execution contexts.
//!
//! An [`ExecutionContext`] is a sticky affinity unit: it binds all work
//! submitted through it to one worker, either one of the shared
//! event-processing workers or a dedicated ordered background worker. The
//! binding never changes after creation, so everything flowing through one
//! context executes with single-threaded semantics regardless of which
//! thread submitted it.
//!
//! Any code can ask "what execution domain am I in" via
//! [`ExecutionContext::current`] without parameter threading; the
//! association is maintained by the task wrapper around every hop and is
//! re-cleared after tasks of a closed context so worker reuse never leaks
//! it into unrelated work.

pub mod ambient;
pub mod close_hooks;
mod task;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::context::close_hooks::{CloseHook, CloseHookRegistry, HookId};
use crate::context::task::DeferredTask;
use crate::error::CoreError;
use crate::metrics::CoreMetrics;
use crate::worker::{self, WorkerHandle, WorkerKind};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Affinity kind of a context, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Bound to one of the shared event-processing workers.
    EventLoop,
    /// Bound to a dedicated ordered background worker.
    OrderedWorker,
}

impl std::fmt::Display for Affinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affinity::EventLoop => write!(f, "event-loop"),
            Affinity::OrderedWorker => write!(f, "ordered-worker"),
        }
    }
}

/// Failure sink implemented by the deployment/lifecycle layer.
pub trait FailureSink: Send + Sync + 'static {
    fn report_failure(&self, cause: &CoreError);
}

/// Back-reference to the deployment owning a context. Set at most once.
#[derive(Clone)]
pub struct DeploymentHandle {
    sink: Arc<dyn FailureSink>,
}

impl DeploymentHandle {
    pub fn new(sink: impl FailureSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn report_failure(&self, cause: &CoreError) {
        self.sink.report_failure(cause);
    }
}

impl std::fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentHandle").finish_non_exhaustive()
    }
}

// ─── ExecutionContext ────────────────────────────────────────────────────────

/// Cloneable handle to one execution context.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    worker: WorkerHandle,
    deployment: OnceCell<DeploymentHandle>,
    closed: AtomicBool,
    hooks: CloseHookRegistry,
    ambient_propagation: bool,
    metrics: Arc<CoreMetrics>,
}

/// Weak context reference stored in worker slots; breaks the reference
/// cycle between a context and its worker.
#[derive(Clone)]
pub(crate) struct WeakContextRef(Weak<ContextInner>);

impl WeakContextRef {
    pub(crate) fn upgrade(&self) -> Option<ExecutionContext> {
        self.0.upgrade().map(|inner| ExecutionContext { inner })
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        worker: WorkerHandle,
        ambient_propagation: bool,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, worker = worker.id(), kind = %worker.kind(), "context created");
        Self {
            inner: Arc::new(ContextInner {
                id,
                worker,
                deployment: OnceCell::new(),
                closed: AtomicBool::new(false),
                hooks: CloseHookRegistry::new(),
                ambient_propagation,
                metrics,
            }),
        }
    }

    /// Stable identity of this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Affinity kind, fixed at creation.
    pub fn affinity(&self) -> Affinity {
        match self.inner.worker.kind() {
            WorkerKind::EventLoop => Affinity::EventLoop,
            WorkerKind::Ordered => Affinity::OrderedWorker,
        }
    }

    /// The worker this context is bound to.
    pub fn worker(&self) -> &WorkerHandle {
        &self.inner.worker
    }

    /// The context associated with the currently executing task, if any.
    pub fn current() -> Option<ExecutionContext> {
        worker::current_context()
    }

    /// Schedule `task` on this context's worker. Returns immediately and
    /// never blocks; the task runs with ambient-state capture/restore and
    /// failure capture. Tasks submitted from one thread run in submission
    /// order.
    ///
    /// Submissions are accepted after [`close`](Self::close) so in-flight
    /// work can drain.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let deferred = DeferredTask::wrap(self, Box::new(task));
        if !self.inner.worker.submit(deferred.into_task()) {
            warn!(context = self.id(), "worker stopped; task dropped");
        }
    }

    /// Run `task` on a specific worker: inline (under the same wrapping as
    /// [`submit`](Self::submit)) when the calling code is already on that
    /// worker, otherwise redirected through this context's own worker.
    pub fn submit_pinned(&self, worker: &WorkerHandle, task: impl FnOnce() + Send + 'static) {
        if worker.is_current() {
            DeferredTask::wrap(self, Box::new(task)).run();
        } else {
            self.submit(task);
        }
    }

    /// Fire-and-forget scheduling with no result channel.
    pub fn run_direct(&self, task: impl FnOnce() + Send + 'static) {
        self.submit(task);
    }

    /// Associate the owning deployment's failure sink. Set at most once;
    /// later calls are ignored.
    pub fn set_deployment_handle(&self, handle: DeploymentHandle) {
        if self.inner.deployment.set(handle).is_err() {
            warn!(context = self.id(), "deployment handle already set; ignoring");
        }
    }

    /// Route an uncaught task failure to the deployment's failure sink, or
    /// log it when none is registered. Never propagates to the worker.
    pub fn report_failure(&self, cause: CoreError) {
        self.inner.metrics.inc_tasks_failed();
        match self.inner.deployment.get() {
            Some(deployment) => deployment.report_failure(&cause),
            None => error!(context = self.id(), error = %cause, "unhandled task failure"),
        }
    }

    /// Register a cleanup hook run when the owning resource shuts down.
    pub fn add_close_hook(&self, hook: CloseHook) -> HookId {
        self.inner.hooks.add(hook)
    }

    /// Unregister a close hook. Idempotent.
    pub fn remove_close_hook(&self, id: HookId) -> bool {
        self.inner.hooks.remove(id)
    }

    /// Run every registered close hook concurrently and invoke `done`
    /// exactly once after all of them have reported, with a combined
    /// failure if any hook failed. Fires immediately with success when no
    /// hooks are registered.
    pub fn run_close_hooks(&self, done: impl FnOnce(Result<(), CoreError>) + Send + 'static) {
        self.inner.hooks.run(self, Box::new(done));
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark the context closed and clear the current-context association.
    /// Queued and later-submitted tasks still run (graceful drain); each of
    /// them re-clears the association after executing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.worker.clear_current_if(self.id());
        debug!(context = self.id(), "context closed");
    }

    pub(crate) fn propagates_ambient(&self) -> bool {
        self.inner.ambient_propagation
    }

    pub(crate) fn downgrade(&self) -> WeakContextRef {
        WeakContextRef(Arc::downgrade(&self.inner))
    }

    pub(crate) fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id())
            .field("affinity", &self.affinity())
            .field("worker", &self.worker().id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ExecutionContext {}
