// SPDX-License-Identifier: MIT
//! Pooled connection state.
//!
//! One [`PooledConnection`] tracks a single transport connection: its
//! lifecycle state, the ordered sequence of exchanges written but not yet
//! fully responded to, and write-queue watermark accounting. Response
//! demultiplexing is strictly head-of-line: the next terminal event on the
//! wire must belong to the oldest unmatched exchange.
//!
//! # State machine
//!
//! ```text
//! Idle ──(assign)──► Active ──(assign, pipelining)──► PipeliningActive
//!   ▲                  │  ▲                                │
//!   └──(exchange done)─┘  └──────(slots drain to 1)────────┘
//!
//! Closing is reachable from every state on I/O failure, timeout discard,
//! ordering violation, or shutdown; Closed is terminal.
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::{DrainCallback, FailureCallback, RequestId};
use crate::timeout::{TerminalLatch, TimeoutTracker};
use crate::transport::{EndpointKey, TransportConn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Open with no in-flight exchange; eligible for assignment.
    Idle,
    /// Exactly one exchange in flight.
    Active,
    /// More than one exchange in flight (pipelining only).
    PipeliningActive,
    /// Being torn down; no further assignment.
    Closing,
    /// Terminal.
    Closed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Idle => write!(f, "idle"),
            ConnState::Active => write!(f, "active"),
            ConnState::PipeliningActive => write!(f, "pipelining-active"),
            ConnState::Closing => write!(f, "closing"),
            ConnState::Closed => write!(f, "closed"),
        }
    }
}

/// One exchange written to a connection and not yet fully responded to.
pub(crate) struct InFlight {
    pub id: RequestId,
    pub latch: Arc<TerminalLatch>,
    pub timeout: TimeoutTracker,
    pub on_failed: Option<FailureCallback>,
}

pub(crate) struct PooledConnection {
    pub id: u64,
    pub key: EndpointKey,
    pub transport: Box<dyn TransportConn>,
    pub state: ConnState,
    pub in_flight: VecDeque<InFlight>,
    pub buffered_bytes: usize,
    pub writable: bool,
    pub drain_hooks: Vec<DrainCallback>,
    pub last_used: Instant,
}

impl PooledConnection {
    pub fn new(key: EndpointKey, transport: Box<dyn TransportConn>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            transport,
            state: ConnState::Idle,
            in_flight: VecDeque::new(),
            buffered_bytes: 0,
            writable: true,
            drain_hooks: Vec::new(),
            last_used: Instant::now(),
        }
    }

    /// Whether a new exchange may be assigned to this connection.
    pub fn available(&self, pipelining: bool, max_pipeline_depth: usize) -> bool {
        match self.state {
            ConnState::Idle => true,
            ConnState::Active | ConnState::PipeliningActive => {
                pipelining && self.in_flight.len() < max_pipeline_depth
            }
            ConnState::Closing | ConnState::Closed => false,
        }
    }

    /// Append an exchange to the in-flight sequence and update state.
    pub fn begin_exchange(&mut self, exchange: InFlight) {
        self.in_flight.push_back(exchange);
        self.state = if self.in_flight.len() > 1 {
            ConnState::PipeliningActive
        } else {
            ConnState::Active
        };
        self.last_used = Instant::now();
    }

    /// Head of the in-flight sequence: the only exchange the next wire
    /// event may belong to.
    pub fn head(&self) -> Option<&InFlight> {
        self.in_flight.front()
    }

    /// Pop the completed head exchange and recompute state.
    pub fn finish_head(&mut self) -> Option<InFlight> {
        let head = self.in_flight.pop_front();
        self.state = match self.in_flight.len() {
            0 => ConnState::Idle,
            1 => ConnState::Active,
            _ => ConnState::PipeliningActive,
        };
        self.last_used = Instant::now();
        head
    }

    pub fn mark_idle(&mut self) {
        self.state = ConnState::Idle;
        self.last_used = Instant::now();
    }

    /// Record queued bytes. Returns `true` when this write crossed the high
    /// watermark and the queue just became full.
    pub fn record_write(&mut self, len: usize, high_watermark: usize) -> bool {
        self.buffered_bytes += len;
        if self.writable && self.buffered_bytes > high_watermark {
            self.writable = false;
            debug!(
                connection = self.id,
                buffered = self.buffered_bytes,
                "write queue full"
            );
            return true;
        }
        false
    }

    /// Record drained bytes. When the buffer falls back below the low
    /// watermark after being full, the queue becomes writable again and the
    /// registered drain hooks are returned to be fired — exactly once per
    /// crossing.
    pub fn record_drain(&mut self, len: usize, low_watermark: usize) -> Vec<DrainCallback> {
        self.buffered_bytes = self.buffered_bytes.saturating_sub(len);
        if !self.writable && self.buffered_bytes <= low_watermark {
            self.writable = true;
            debug!(
                connection = self.id,
                buffered = self.buffered_bytes,
                "write queue drained"
            );
            return std::mem::take(&mut self.drain_hooks);
        }
        Vec::new()
    }

    /// Combined backpressure signal: pool watermark state or the
    /// transport's own saturation.
    pub fn write_queue_full(&self) -> bool {
        !self.writable || self.transport.write_queue_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    struct NullConn;

    impl TransportConn for NullConn {
        fn write(&self, _bytes: &[u8]) -> Result<(), CoreError> {
            Ok(())
        }
        fn close(&self) {}
    }

    fn conn() -> PooledConnection {
        PooledConnection::new(EndpointKey::plain("host", 80), Box::new(NullConn))
    }

    fn exchange() -> InFlight {
        InFlight {
            id: RequestId::new(),
            latch: Arc::new(TerminalLatch::new()),
            timeout: TimeoutTracker::disarmed(),
            on_failed: None,
        }
    }

    #[test]
    fn state_follows_in_flight_depth() {
        let mut c = conn();
        assert_eq!(c.state, ConnState::Idle);

        c.begin_exchange(exchange());
        assert_eq!(c.state, ConnState::Active);

        c.begin_exchange(exchange());
        assert_eq!(c.state, ConnState::PipeliningActive);

        c.finish_head();
        assert_eq!(c.state, ConnState::Active);

        c.finish_head();
        assert_eq!(c.state, ConnState::Idle);
    }

    #[test]
    fn availability_honours_pipeline_depth() {
        let mut c = conn();
        assert!(c.available(false, 4));

        c.begin_exchange(exchange());
        assert!(!c.available(false, 4));
        assert!(c.available(true, 4));

        c.begin_exchange(exchange());
        c.begin_exchange(exchange());
        c.begin_exchange(exchange());
        assert!(!c.available(true, 4));
    }

    #[test]
    fn watermark_crossings_fire_once() {
        let mut c = conn();
        c.drain_hooks.push(Box::new(|| {}));

        assert!(!c.record_write(512, 1024));
        assert!(c.record_write(1024, 1024));
        // Already full; further writes do not re-cross.
        assert!(!c.record_write(1024, 1024));
        assert!(c.write_queue_full());

        // Draining above the low watermark releases nothing.
        assert!(c.record_drain(1000, 512).is_empty());
        // Crossing the low watermark releases the hooks exactly once.
        let hooks = c.record_drain(1500, 512);
        assert_eq!(hooks.len(), 1);
        assert!(!c.write_queue_full());
        assert!(c.record_drain(60, 512).is_empty());
    }
}
