// SPDX-License-Identifier: MIT
//! Close-hook registry and aggregation.
//!
//! A context owns a set of cleanup hooks run when its owning resource shuts
//! down. Hooks complete asynchronously through a [`HookDone`] handle, all
//! hooks are started together, and a single done-callback fires exactly once
//! after every hook has reported. Aggregation is fail-open: a failing hook
//! is surfaced through the context's failure path and folded into the
//! aggregate result, but never prevents the aggregate from completing.
//!
//! Hooks run off a snapshot taken when the run starts, so a hook that
//! registers or removes hooks during its own execution cannot disturb the
//! iteration.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::context::ExecutionContext;
use crate::error::CoreError;

/// Identifier returned by `add_close_hook`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// A cleanup hook. Invoked at most once; reports its outcome through the
/// provided [`HookDone`].
pub type CloseHook = Box<dyn FnOnce(HookDone) + Send + 'static>;

pub(crate) type DoneCallback = Box<dyn FnOnce(Result<(), CoreError>) + Send + 'static>;

#[derive(Default)]
pub(crate) struct CloseHookRegistry {
    hooks: Mutex<HashMap<u64, CloseHook>>,
    next_id: AtomicU64,
}

impl CloseHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: CloseHook) -> HookId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.hooks
            .lock()
            .expect("close hook lock poisoned")
            .insert(id, hook);
        HookId(id)
    }

    /// Unregister a hook. Safe to call for ids that were already removed or
    /// already consumed by a run.
    pub fn remove(&self, id: HookId) -> bool {
        self.hooks
            .lock()
            .expect("close hook lock poisoned")
            .remove(&id.0)
            .is_some()
    }

    /// Start every registered hook and aggregate their completions into a
    /// single `done` invocation. Hooks registered at run time are consumed;
    /// hooks added afterwards (including from inside a running hook) stay
    /// registered for a later run.
    pub fn run(&self, ctx: &ExecutionContext, done: DoneCallback) {
        let snapshot: Vec<CloseHook> = {
            let mut hooks = self.hooks.lock().expect("close hook lock poisoned");
            let ids: Vec<u64> = hooks.keys().copied().collect();
            ids.into_iter().filter_map(|id| hooks.remove(&id)).collect()
        };

        if snapshot.is_empty() {
            done(Ok(()));
            return;
        }

        debug!(context = ctx.id(), hooks = snapshot.len(), "running close hooks");
        let agg = Arc::new(Aggregate {
            remaining: AtomicUsize::new(snapshot.len()),
            total: snapshot.len(),
            failed: AtomicUsize::new(0),
            first_failure: Mutex::new(None),
            done: Mutex::new(Some(done)),
            ctx: ctx.clone(),
        });

        for hook in snapshot {
            let handle = HookDone {
                agg: Some(agg.clone()),
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || hook(handle))) {
                // The dropped HookDone has already counted this hook as
                // failed; keep the panic visible in the log.
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "close hook panicked".to_string());
                error!(context = ctx.id(), %message, "close hook panicked");
            }
        }
    }
}

/// Completion handle passed to each hook.
///
/// Dropping the handle without calling [`complete`](HookDone::complete)
/// counts the hook as failed, so a panicking hook can never stall the
/// aggregate.
pub struct HookDone {
    agg: Option<Arc<Aggregate>>,
}

impl HookDone {
    pub fn complete(mut self, result: Result<(), CoreError>) {
        if let Some(agg) = self.agg.take() {
            agg.hook_finished(result);
        }
    }
}

impl Drop for HookDone {
    fn drop(&mut self) {
        if let Some(agg) = self.agg.take() {
            agg.hook_finished(Err(CoreError::TaskFailed {
                message: "close hook dropped its completion handle".to_string(),
            }));
        }
    }
}

struct Aggregate {
    remaining: AtomicUsize,
    total: usize,
    failed: AtomicUsize,
    first_failure: Mutex<Option<String>>,
    done: Mutex<Option<DoneCallback>>,
    ctx: ExecutionContext,
}

impl Aggregate {
    fn hook_finished(&self, result: Result<(), CoreError>) {
        if let Err(err) = result {
            self.failed.fetch_add(1, Ordering::AcqRel);
            self.first_failure
                .lock()
                .expect("aggregate lock poisoned")
                .get_or_insert_with(|| err.to_string());
            self.ctx.report_failure(err);
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let done = self
                .done
                .lock()
                .expect("aggregate lock poisoned")
                .take();
            let Some(done) = done else { return };

            let failed = self.failed.load(Ordering::Acquire);
            let result = if failed == 0 {
                Ok(())
            } else {
                Err(CoreError::CloseHooksFailed {
                    failed,
                    total: self.total,
                    first: self
                        .first_failure
                        .lock()
                        .expect("aggregate lock poisoned")
                        .clone()
                        .unwrap_or_default(),
                })
            };
            // Deliver on the owning context so callers observe completion
            // with the same affinity as any other context event.
            self.ctx.run_direct(move || done(result));
        }
    }
}
