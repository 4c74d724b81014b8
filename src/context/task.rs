// SPDX-License-Identifier: MIT
//! Deferred task wrapping.
//!
//! Every hop through an execution context goes through [`DeferredTask`]: it
//! carries the ambient snapshot captured at submission, installs the
//! submitting context into the worker's current-context slot, runs the task
//! with panic capture, and restores the worker's previous ambient map no
//! matter how the task ended. A failing task is reported through the
//! context's failure path and never unwinds into the worker loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::context::ambient::{self, AmbientSnapshot};
use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::worker::Task;

pub(crate) struct DeferredTask {
    ctx: ExecutionContext,
    ambient: Option<AmbientSnapshot>,
    task: Task,
}

impl DeferredTask {
    /// Wrap a task for execution on `ctx`'s worker, capturing the ambient
    /// map now if propagation is enabled.
    pub fn wrap(ctx: &ExecutionContext, task: Task) -> Self {
        let ambient = ctx
            .propagates_ambient()
            .then(AmbientSnapshot::capture);
        Self {
            ctx: ctx.clone(),
            ambient,
            task,
        }
    }

    /// Convert into a plain queue task.
    pub fn into_task(self) -> Task {
        Box::new(move || self.run())
    }

    /// Execute now, on the calling worker.
    pub fn run(self) {
        let DeferredTask { ctx, ambient, task } = self;

        // Restores the worker's prior map on drop, even when the task
        // panics.
        let _ambient_guard = ambient.as_ref().map(AmbientGuard::install);

        ctx.worker().set_current(ctx.downgrade());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            ctx.report_failure(CoreError::TaskFailed {
                message: panic_message(payload),
            });
        }
        if ctx.is_closed() {
            // Tasks may run after close, but the association must not leak
            // to whatever runs next on this worker.
            ctx.worker().clear_current_if(ctx.id());
        }
    }
}

struct AmbientGuard {
    saved: Option<HashMap<String, String>>,
}

impl AmbientGuard {
    fn install(snapshot: &AmbientSnapshot) -> Self {
        Self {
            saved: Some(ambient::swap_in(snapshot)),
        }
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            ambient::restore(saved);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
