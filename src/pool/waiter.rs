// SPDX-License-Identifier: MIT
//! FIFO waiter queue.
//!
//! Requests that cannot be satisfied immediately wait here in arrival
//! order. A waiter whose timeout fires while still queued is removed by id:
//! the id map drops it in O(1) and its slot in the order queue becomes a
//! tombstone skipped lazily on pop, so cancellation never degenerates into
//! a scan that could remove a different equal-valued entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use super::{FailureCallback, ReadyCallback, RequestId};
use crate::timeout::{TerminalLatch, TimeoutTracker};

/// A queued request waiting for connection capacity.
pub(crate) struct Waiter {
    pub id: RequestId,
    pub latch: Arc<TerminalLatch>,
    pub timeout: TimeoutTracker,
    pub on_ready: ReadyCallback,
    pub on_failed: Option<FailureCallback>,
    pub enqueued_at: Instant,
}

#[derive(Default)]
pub(crate) struct WaiterQueue {
    order: VecDeque<RequestId>,
    by_id: HashMap<RequestId, Waiter>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, waiter: Waiter) {
        self.order.push_back(waiter.id);
        self.by_id.insert(waiter.id, waiter);
    }

    /// Remove a waiter by id. Its order slot is left behind as a tombstone.
    pub fn cancel(&mut self, id: RequestId) -> Option<Waiter> {
        self.by_id.remove(&id)
    }

    /// Oldest live waiter, skipping tombstones.
    pub fn pop_front(&mut self) -> Option<Waiter> {
        while let Some(id) = self.order.pop_front() {
            if let Some(waiter) = self.by_id.remove(&id) {
                return Some(waiter);
            }
        }
        None
    }

    /// Remove every live waiter, oldest first.
    pub fn drain(&mut self) -> Vec<Waiter> {
        let mut out = Vec::with_capacity(self.by_id.len());
        while let Some(waiter) = self.pop_front() {
            out.push(waiter);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_waiter(id: RequestId) -> Waiter {
        Waiter {
            id,
            latch: Arc::new(TerminalLatch::new()),
            timeout: TimeoutTracker::disarmed(),
            on_ready: Box::new(|_| {}),
            on_failed: None,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut queue = WaiterQueue::new();
        let ids: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
        for &id in &ids {
            queue.push(test_waiter(id));
        }
        for &id in &ids {
            assert_eq!(queue.pop_front().unwrap().id, id);
        }
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn cancel_skips_only_the_cancelled_entry() {
        let mut queue = WaiterQueue::new();
        let ids: Vec<RequestId> = (0..4).map(|_| RequestId::new()).collect();
        for &id in &ids {
            queue.push(test_waiter(id));
        }
        assert!(queue.cancel(ids[1]).is_some());
        assert!(queue.cancel(ids[1]).is_none());
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_front().unwrap().id, ids[0]);
        assert_eq!(queue.pop_front().unwrap().id, ids[2]);
        assert_eq!(queue.pop_front().unwrap().id, ids[3]);
        assert!(queue.is_empty());
    }

    proptest! {
        /// Cancelling an arbitrary subset never disturbs the relative order
        /// of the surviving waiters.
        #[test]
        fn fifo_order_survives_arbitrary_cancellation(cancel_mask in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut queue = WaiterQueue::new();
            let ids: Vec<RequestId> = cancel_mask.iter().map(|_| RequestId::new()).collect();
            for &id in &ids {
                queue.push(test_waiter(id));
            }

            let mut expected = Vec::new();
            for (i, &cancel) in cancel_mask.iter().enumerate() {
                if cancel {
                    prop_assert!(queue.cancel(ids[i]).is_some());
                } else {
                    expected.push(ids[i]);
                }
            }

            let mut popped = Vec::new();
            while let Some(w) = queue.pop_front() {
                popped.push(w.id);
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
