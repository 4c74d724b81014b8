// SPDX-License-Identifier: MIT
//! Serial task workers.
//!
//! A worker is a queue of closures drained one at a time by a dedicated
//! task. Everything submitted to the same worker executes in queue order
//! with exclusive access to the worker's state, which is what lets an
//! execution context promise single-threaded semantics without pinning an
//! OS thread per context.
//!
//! Two worker kinds exist: a small fixed set of *event* workers shared by
//! many contexts (round-robin assignment at context creation), and *ordered*
//! workers created one per background context. Both run the same loop. An
//! ordered worker stops on its own once every handle to its queue is gone;
//! event workers are stopped by the runtime at shutdown.
//!
//! Each worker owns a current-context slot. The slot is written only by the
//! task wrapper around each execution, which keeps it race-free: during a
//! task the slot names the context that submitted it, and the wrapper
//! re-clears it after tasks of a closed context so the association cannot
//! leak into unrelated work on the same worker.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::{ExecutionContext, WeakContextRef};

/// A unit of work queued on a worker.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // The worker currently executing a task on this thread. The drain loop
    // runs task bodies synchronously, so the marker is set and cleared
    // within a single poll and can never leak across threads.
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerShared>>> = const { RefCell::new(None) };
}

/// Affinity kind of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// One of the fixed event-processing workers. Must never be blocked.
    EventLoop,
    /// A dedicated ordered queue for background work.
    Ordered,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::EventLoop => write!(f, "event-loop"),
            WorkerKind::Ordered => write!(f, "ordered"),
        }
    }
}

struct WorkerShared {
    id: u64,
    kind: WorkerKind,
    current: Mutex<Option<WeakContextRef>>,
}

impl WorkerShared {
    fn current_context(&self) -> Option<ExecutionContext> {
        self.current
            .lock()
            .expect("worker slot lock poisoned")
            .as_ref()
            .and_then(WeakContextRef::upgrade)
    }
}

// ─── WorkerHandle ────────────────────────────────────────────────────────────

/// Cloneable handle to a worker's queue and its current-context slot.
///
/// The drain loop itself holds no handle, so an ordered worker's loop ends
/// as soon as the last handle is dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    tx: mpsc::UnboundedSender<Task>,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.shared.kind
    }

    /// True when the calling code is currently executing a task on this
    /// worker.
    pub fn is_current(&self) -> bool {
        CURRENT_WORKER.with(|w| {
            w.borrow()
                .as_ref()
                .map(|current| current.id == self.id())
                .unwrap_or(false)
        })
    }

    /// The context most recently installed on this worker, if it is still
    /// alive.
    pub fn current_context(&self) -> Option<ExecutionContext> {
        self.shared.current_context()
    }

    /// Queue a task. Returns `false` when the worker has already stopped;
    /// the task is dropped in that case.
    pub(crate) fn submit(&self, task: Task) -> bool {
        self.tx.send(task).is_ok()
    }

    pub(crate) fn set_current(&self, ctx: WeakContextRef) {
        *self
            .shared
            .current
            .lock()
            .expect("worker slot lock poisoned") = Some(ctx);
    }

    /// Clear the slot if it still names the given context.
    pub(crate) fn clear_current_if(&self, context_id: u64) {
        let mut slot = self
            .shared
            .current
            .lock()
            .expect("worker slot lock poisoned");
        let names_it = slot
            .as_ref()
            .and_then(WeakContextRef::upgrade)
            .map(|ctx| ctx.id() == context_id)
            // A dead weak ref no longer names anything; clearing is fine.
            .unwrap_or(true);
        if names_it {
            *slot = None;
        }
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for WorkerHandle {}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// The context associated with the worker currently executing the calling
/// code.
pub(crate) fn current_context() -> Option<ExecutionContext> {
    CURRENT_WORKER.with(|w| {
        w.borrow()
            .as_ref()
            .and_then(|shared| shared.current_context())
    })
}

// ─── Worker loop ─────────────────────────────────────────────────────────────

/// A spawned worker: its handle plus the join handle of its drain loop.
pub(crate) struct Worker {
    pub handle: WorkerHandle,
    pub join: JoinHandle<()>,
}

/// Spawn a worker loop on the ambient tokio runtime.
pub(crate) fn spawn(kind: WorkerKind) -> Worker {
    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::new(WorkerShared {
        id,
        kind,
        current: Mutex::new(None),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle {
        shared: shared.clone(),
        tx,
    };
    let join = tokio::spawn(run_loop(shared, rx));
    Worker { handle, join }
}

async fn run_loop(shared: Arc<WorkerShared>, mut rx: mpsc::UnboundedReceiver<Task>) {
    debug!(worker = shared.id, kind = %shared.kind, "worker started");
    while let Some(task) = rx.recv().await {
        CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(shared.clone()));
        task();
        CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
    }
    debug!(worker = shared.id, kind = %shared.kind, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_tasks_in_submission_order() {
        let worker = spawn(WorkerKind::Ordered);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();

        for i in 0..100 {
            let seen = seen.clone();
            worker.handle.submit(Box::new(move || {
                seen.lock().unwrap().push(i);
            }));
        }
        worker.handle.submit(Box::new(move || {
            let _ = tx.send(());
        }));

        rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn is_current_only_inside_tasks() {
        let worker = spawn(WorkerKind::EventLoop);
        assert!(!worker.handle.is_current());

        let (tx, rx) = oneshot::channel();
        let handle = worker.handle.clone();
        worker.handle.submit(Box::new(move || {
            let _ = tx.send(handle.is_current());
        }));
        assert!(rx.await.unwrap());
        assert!(!worker.handle.is_current());
    }

    #[tokio::test]
    async fn loop_ends_when_handles_are_gone() {
        let worker = spawn(WorkerKind::Ordered);
        let (tx, rx) = oneshot::channel();
        worker.handle.submit(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.await.unwrap();

        let join = worker.join;
        drop(worker.handle);
        // With every sender gone the drain loop observes a closed queue.
        tokio::time::timeout(std::time::Duration::from_secs(1), join)
            .await
            .expect("worker loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn aborted_worker_drops_tasks() {
        let worker = spawn(WorkerKind::Ordered);
        worker.join.abort();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let accepted = worker.handle.submit(Box::new(move || {
            calls2.fetch_add(1, Ordering::Relaxed);
        }));
        // The channel may still accept until the receiver is dropped, but
        // once the loop is gone nothing runs.
        if accepted {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
