// SPDX-License-Identifier: MIT
//! Ambient diagnostic map.
//!
//! Key/value state (correlation ids, tenant tags) that travels with a
//! logical task across asynchronous hops. The live map is worker-local
//! mutable state owned by whichever task is currently executing; the task
//! wrapper captures an [`AmbientSnapshot`] at submission time and installs
//! it around execution, restoring the previous map afterwards so state from
//! one task never bleeds into the next task on the same worker.

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static AMBIENT: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// Set a key in the current task's ambient map.
pub fn put(key: impl Into<String>, value: impl Into<String>) {
    AMBIENT.with(|map| {
        map.borrow_mut().insert(key.into(), value.into());
    });
}

/// Read a key from the current task's ambient map.
pub fn get(key: &str) -> Option<String> {
    AMBIENT.with(|map| map.borrow().get(key).cloned())
}

/// Remove a key, returning its previous value.
pub fn remove(key: &str) -> Option<String> {
    AMBIENT.with(|map| map.borrow_mut().remove(key))
}

/// Drop every entry in the current task's ambient map.
pub fn clear() {
    AMBIENT.with(|map| map.borrow_mut().clear());
}

/// Point-in-time copy of the submitting task's ambient map.
#[derive(Debug, Clone, Default)]
pub struct AmbientSnapshot {
    entries: HashMap<String, String>,
}

impl AmbientSnapshot {
    /// Capture the calling task's current ambient map.
    pub fn capture() -> Self {
        Self {
            entries: AMBIENT.with(|map| map.borrow().clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Install a snapshot as the live map, returning what it replaced.
pub(crate) fn swap_in(snapshot: &AmbientSnapshot) -> HashMap<String, String> {
    AMBIENT.with(|map| std::mem::replace(&mut *map.borrow_mut(), snapshot.entries.clone()))
}

/// Put a previously saved map back in place.
pub(crate) fn restore(saved: HashMap<String, String>) {
    AMBIENT.with(|map| *map.borrow_mut() = saved);
}
