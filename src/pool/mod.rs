// SPDX-License-Identifier: MIT
//! Connection pool.
//!
//! One [`ConnectionPool`] multiplexes outbound requests over a bounded set
//! of transport connections, partitioned by endpoint key. Three event
//! classes drive each partition's state machine: request arrival, a
//! connection becoming available, and a connection closing.
//!
//! - An arriving request takes an available connection, triggers creation
//!   of a new one while the partition is under its connection bound, or
//!   joins the FIFO waiter queue.
//! - A completed exchange hands the connection to the oldest waiter,
//!   returns it to idle, or (under pipelining) frees one in-flight slot.
//! - A closed connection fails its in-flight exchanges and, if waiters
//!   remain, triggers creation of a replacement.
//!
//! All callbacks are delivered through the execution context that owns the
//! pool, so completion events observe the same affinity as any other work
//! on that context. Nothing in here blocks: waiting callers exist only as
//! queued continuations.
//!
//! The illegal pipelining-without-keep-alive combination is decided once at
//! construction and becomes a standing error: every acquire on such a pool
//! fails and no connection is ever opened.

mod connection;
mod waiter;

pub use connection::ConnState;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolOptions;
use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::metrics::CoreMetrics;
use crate::observability::ConnectTimer;
use crate::retry;
use crate::timeout::{TerminalLatch, TimeoutTracker};
use crate::transport::{CodecEvent, EndpointKey, Transport, TransportConn};

use connection::{InFlight, PooledConnection};
use waiter::{Waiter, WaiterQueue};

/// Callback receiving the outcome of an acquire: a lease, or the failure
/// that ended the request before a connection was assigned.
pub type ReadyCallback = Box<dyn FnOnce(Result<ConnectionLease, CoreError>) + Send + 'static>;

/// Callback receiving a terminal failure after a connection was assigned
/// (timeout, connection loss, ordering violation).
pub type FailureCallback = Box<dyn FnOnce(CoreError) + Send + 'static>;

/// Callback fired when a full write queue drains below its low watermark.
pub type DrainCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identity of one request for the lifetime of its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── PoolRequest ─────────────────────────────────────────────────────────────

/// A request handed to [`ConnectionPool::acquire`].
pub struct PoolRequest {
    timeout: Option<Duration>,
    on_ready: ReadyCallback,
    on_failed: Option<FailureCallback>,
}

impl PoolRequest {
    pub fn new(on_ready: impl FnOnce(Result<ConnectionLease, CoreError>) + Send + 'static) -> Self {
        Self {
            timeout: None,
            on_ready: Box::new(on_ready),
            on_failed: None,
        }
    }

    /// Deadline for the whole exchange, including time spent queued. A zero
    /// duration means no timeout. Requests without their own deadline fall
    /// back to the pool's `request_timeout_ms` option.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Handler for terminal failures occurring after the connection was
    /// assigned. Invoked at most once; mutually exclusive with normal
    /// completion.
    pub fn on_failed(mut self, on_failed: impl FnOnce(CoreError) + Send + 'static) -> Self {
        self.on_failed = Some(Box::new(on_failed));
        self
    }
}

/// What a finished exchange means for its connection.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// Exchange completed cleanly and the connection may be reused.
    Reusable,
    /// One of several pipelined exchanges completed; the connection stays
    /// active and the freed slot may take the next waiter.
    PipelinedSlotFreed,
    /// The connection must not be reused.
    MustClose { reason: String },
}

// ─── ConnectionLease ─────────────────────────────────────────────────────────

/// A connection assigned to one request.
///
/// The lease is the protocol codec's handle for the write side of the
/// exchange; terminal events flow back through
/// [`ConnectionPool::codec_event`].
#[derive(Clone)]
pub struct ConnectionLease {
    request: RequestId,
    connection: u64,
    key: EndpointKey,
    pool: Arc<ConnectionPool>,
}

impl ConnectionLease {
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    pub fn connection_id(&self) -> u64 {
        self.connection
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.key
    }

    /// The execution context completion events are delivered on.
    pub fn context(&self) -> &ExecutionContext {
        self.pool.context()
    }

    /// Queue bytes on the leased connection.
    pub fn write(&self, bytes: &[u8]) -> Result<(), CoreError> {
        self.pool.write_bytes(self.connection, bytes)
    }

    /// Backpressure signal. While true, the caller should stop writing and
    /// wait for [`notify_on_drain`](Self::notify_on_drain).
    pub fn write_queue_full(&self) -> bool {
        self.pool.is_write_queue_full(self.connection)
    }

    /// Register a one-shot callback fired when the write queue drains
    /// below the low watermark. Fires immediately if the queue is not
    /// currently full.
    pub fn notify_on_drain(&self, callback: impl FnOnce() + Send + 'static) {
        self.pool.add_drain_hook(self.connection, Box::new(callback));
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("request", &self.request)
            .field("connection", &self.connection)
            .field("endpoint", &self.key)
            .finish()
    }
}

// ─── ConnectionPool ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Endpoint {
    conns: HashMap<u64, PooledConnection>,
    connecting: usize,
    waiters: WaiterQueue,
}

impl Endpoint {
    /// Open plus in-establishment connections; both count against the
    /// partition bound.
    fn total(&self) -> usize {
        self.conns.len() + self.connecting
    }
}

#[derive(Default)]
struct PoolState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    conn_index: HashMap<u64, EndpointKey>,
}

fn conn_mut<'a>(state: &'a mut PoolState, connection: u64) -> Option<&'a mut PooledConnection> {
    let key = state.conn_index.get(&connection)?;
    state.endpoints.get_mut(key)?.conns.get_mut(&connection)
}

/// Callbacks and side effects accumulated under the state lock and executed
/// after it is released. User callbacks are delivered through the pool's
/// context; transport closes and connect attempts run directly.
#[derive(Default)]
struct AfterUnlock {
    notify: Vec<Box<dyn FnOnce() + Send + 'static>>,
    connects: Vec<EndpointKey>,
    closes: Vec<Box<dyn TransportConn>>,
}

impl AfterUnlock {
    fn flush(self, pool: &Arc<ConnectionPool>) {
        for transport in self.closes {
            transport.close();
        }
        for key in self.connects {
            pool.spawn_connect(key);
        }
        for callback in self.notify {
            pool.ctx.run_direct(callback);
        }
    }
}

/// Bounded, keyed pool of transport connections with keep-alive reuse and
/// optional pipelining.
///
/// Must be used from within a tokio runtime; timers and connect attempts
/// are spawned on the ambient runtime.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    opts: PoolOptions,
    ctx: ExecutionContext,
    metrics: Arc<CoreMetrics>,
    state: Mutex<PoolState>,
    config_error: Option<CoreError>,
    shut_down: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool. An illegal option combination is not an immediate
    /// error: it is recorded once and every subsequent acquire fails with
    /// it, leaving other pools untouched.
    pub fn new(
        transport: Arc<dyn Transport>,
        opts: PoolOptions,
        ctx: ExecutionContext,
    ) -> Arc<Self> {
        let config_error = opts.validate().err();
        if let Some(err) = &config_error {
            error!(error = %err, "connection pool misconfigured; all requests will fail");
        }
        let metrics = ctx.metrics().clone();
        let pool = Arc::new(Self {
            transport,
            opts,
            ctx,
            metrics,
            state: Mutex::new(PoolState::default()),
            config_error,
            shut_down: AtomicBool::new(false),
        });
        if pool.config_error.is_none() && pool.opts.idle_timeout().is_some() {
            Self::spawn_idle_sweeper(&pool);
        }
        pool
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    // ── acquire ──────────────────────────────────────────────────────────

    /// Request a connection for `key`.
    ///
    /// Resolution is immediate when an available connection exists,
    /// deferred behind a connect when the partition is under its bound,
    /// and queued FIFO otherwise. The request's timeout covers the whole
    /// exchange, including queue time; firing while queued removes the
    /// waiter by id.
    pub fn acquire(self: &Arc<Self>, key: EndpointKey, request: PoolRequest) {
        let PoolRequest {
            timeout,
            on_ready,
            on_failed,
        } = request;

        if let Some(err) = &self.config_error {
            let err = err.clone();
            self.ctx.run_direct(move || on_ready(Err(err)));
            return;
        }
        if self.shut_down.load(Ordering::Acquire) {
            self.ctx.run_direct(move || on_ready(Err(CoreError::PoolShutDown)));
            return;
        }

        let id = RequestId::new();
        let timeout = timeout.or_else(|| self.opts.request_timeout());
        let latch = Arc::new(TerminalLatch::new());
        let tracker = {
            let weak = Arc::downgrade(self);
            let timeout_key = key.clone();
            let after = timeout.unwrap_or_default();
            TimeoutTracker::arm(timeout, move || {
                if let Some(pool) = weak.upgrade() {
                    pool.request_timed_out(timeout_key, id, after);
                }
            })
        };
        let waiter = Waiter {
            id,
            latch,
            timeout: tracker,
            on_ready,
            on_failed,
            enqueued_at: Instant::now(),
        };

        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let endpoint = state.endpoints.entry(key.clone()).or_default();

            // A new arrival may only jump onto a connection when nobody
            // older is still waiting.
            let available = if endpoint.waiters.is_empty() {
                endpoint
                    .conns
                    .values()
                    .filter(|c| c.available(self.opts.pipelining, self.opts.max_pipeline_depth))
                    .min_by_key(|c| (c.state != ConnState::Idle, c.in_flight.len()))
                    .map(|c| c.id)
            } else {
                None
            };

            if let Some(conn_id) = available {
                if let Some(conn) = endpoint.conns.get_mut(&conn_id) {
                    self.assign_locked(conn, waiter, &mut out);
                }
            } else if endpoint.total() < self.opts.max_connections_per_endpoint {
                endpoint.connecting += 1;
                endpoint.waiters.push(waiter);
                self.metrics.inc_requests_queued();
                out.connects.push(key.clone());
                debug!(endpoint = %key, request = %id, "creating connection for request");
            } else {
                endpoint.waiters.push(waiter);
                self.metrics.inc_requests_queued();
                debug!(
                    endpoint = %key,
                    request = %id,
                    queued = endpoint.waiters.len(),
                    "request queued; partition at connection bound"
                );
            }
        }
        out.flush(self);
    }

    /// Async convenience over [`acquire`](Self::acquire).
    pub async fn acquire_wait(
        self: &Arc<Self>,
        key: EndpointKey,
        timeout: Option<Duration>,
    ) -> Result<ConnectionLease, CoreError> {
        let (tx, rx) = oneshot::channel();
        let mut request = PoolRequest::new(move |result| {
            let _ = tx.send(result);
        });
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        self.acquire(key, request);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::PoolShutDown),
        }
    }

    // ── codec boundary ───────────────────────────────────────────────────

    /// Terminal event reported by the protocol codec for one exchange on
    /// `connection`. Events must match the head of the connection's
    /// in-flight sequence; any other attribution is an ordering violation
    /// that closes the connection.
    pub fn codec_event(self: &Arc<Self>, connection: u64, event: CodecEvent) {
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let Some(key) = state.conn_index.get(&connection).cloned() else {
                debug!(connection, ?event, "codec event for unknown connection; ignoring");
                return;
            };

            match event {
                CodecEvent::ResponseHead { request } => {
                    let mismatch = match conn_mut(&mut state, connection) {
                        Some(conn) => match conn.head() {
                            Some(head) if head.id == request => None,
                            head => Some(expected_of(head)),
                        },
                        None => None,
                    };
                    if let Some(expected) = mismatch {
                        self.ordering_violation_locked(
                            &mut state,
                            &key,
                            connection,
                            expected,
                            request.to_string(),
                            &mut out,
                        );
                    }
                }
                CodecEvent::ResponseComplete { request } => {
                    let head_matches = conn_mut(&mut state, connection)
                        .map(|conn| match conn.head() {
                            Some(head) if head.id == request => Ok(()),
                            head => Err(expected_of(head)),
                        })
                        .unwrap_or(Ok(()));
                    match head_matches {
                        Err(expected) => {
                            self.ordering_violation_locked(
                                &mut state,
                                &key,
                                connection,
                                expected,
                                request.to_string(),
                                &mut out,
                            );
                        }
                        Ok(()) => {
                            self.complete_head_locked(&mut state, &key, connection, &mut out);
                        }
                    }
                }
                CodecEvent::ExchangeFailed { request, reason } => {
                    let failure = CoreError::ConnectionClosed {
                        reason: format!("exchange failed: {reason}"),
                    };
                    if let Some(conn) = conn_mut(&mut state, connection) {
                        if let Some(entry) =
                            conn.in_flight.iter_mut().find(|r| r.id == request)
                        {
                            if entry.latch.try_claim() {
                                entry.timeout.cancel();
                                if let Some(callback) = entry.on_failed.take() {
                                    let err = failure.clone();
                                    out.notify.push(Box::new(move || callback(err)));
                                }
                            }
                        }
                    }
                    warn!(endpoint = %key, connection, request = %request, "exchange failed");
                    self.close_connection_locked(&mut state, &key, connection, failure, &mut out);
                }
            }
        }
        out.flush(self);
    }

    /// Transport-level notification that a connection dropped.
    pub fn connection_closed(self: &Arc<Self>, connection: u64, reason: &str) {
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let Some(key) = state.conn_index.get(&connection).cloned() else {
                return;
            };
            self.close_connection_locked(
                &mut state,
                &key,
                connection,
                CoreError::ConnectionClosed {
                    reason: reason.to_string(),
                },
                &mut out,
            );
        }
        out.flush(self);
    }

    /// Hand a finished exchange's connection back to the pool.
    ///
    /// [`codec_event`](Self::codec_event) calls this internally; it is
    /// public for codecs that track exchange completion themselves.
    pub fn release(self: &Arc<Self>, connection: u64, outcome: ReleaseOutcome) {
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let Some(key) = state.conn_index.get(&connection).cloned() else {
                return;
            };
            self.release_locked(&mut state, &key, connection, outcome, &mut out);
        }
        out.flush(self);
    }

    // ── write side ───────────────────────────────────────────────────────

    fn write_bytes(&self, connection: u64, bytes: &[u8]) -> Result<(), CoreError> {
        let mut state = self.lock_state();
        let Some(conn) = conn_mut(&mut state, connection) else {
            return Err(CoreError::ConnectionClosed {
                reason: "connection is no longer pooled".to_string(),
            });
        };
        conn.transport.write(bytes)?;
        conn.record_write(bytes.len(), self.opts.write_queue_high_watermark);
        Ok(())
    }

    fn is_write_queue_full(&self, connection: u64) -> bool {
        let mut state = self.lock_state();
        match conn_mut(&mut state, connection) {
            Some(conn) => conn.write_queue_full(),
            None => true,
        }
    }

    /// Transport acknowledgement that `bytes` buffered bytes were flushed.
    pub fn write_drained(self: &Arc<Self>, connection: u64, bytes: usize) {
        let hooks = {
            let mut state = self.lock_state();
            match conn_mut(&mut state, connection) {
                Some(conn) => conn.record_drain(bytes, self.opts.write_queue_low_watermark),
                None => Vec::new(),
            }
        };
        for hook in hooks {
            self.ctx.run_direct(hook);
        }
    }

    fn add_drain_hook(self: &Arc<Self>, connection: u64, callback: DrainCallback) {
        let immediate = {
            let mut state = self.lock_state();
            match conn_mut(&mut state, connection) {
                Some(conn) if conn.write_queue_full() => {
                    conn.drain_hooks.push(callback);
                    None
                }
                // Not under backpressure (or already closed): the caller
                // may write immediately.
                _ => Some(callback),
            }
        };
        if let Some(callback) = immediate {
            self.ctx.run_direct(callback);
        }
    }

    // ── maintenance ──────────────────────────────────────────────────────

    /// Close idle connections older than the configured idle timeout.
    /// Returns how many were closed. No-op when no idle timeout is set.
    pub fn close_idle(self: &Arc<Self>, now: Instant) -> usize {
        let Some(limit) = self.opts.idle_timeout() else {
            return 0;
        };
        let mut out = AfterUnlock::default();
        let mut closed = 0;
        {
            let mut state = self.lock_state();
            let expired: Vec<(EndpointKey, u64)> = state
                .endpoints
                .iter()
                .flat_map(|(key, endpoint)| {
                    endpoint
                        .conns
                        .values()
                        .filter(|c| {
                            c.state == ConnState::Idle
                                && now.duration_since(c.last_used) >= limit
                        })
                        .map(|c| (key.clone(), c.id))
                        .collect::<Vec<_>>()
                })
                .collect();
            for (key, conn_id) in expired {
                self.close_connection_locked(
                    &mut state,
                    &key,
                    conn_id,
                    CoreError::ConnectionClosed {
                        reason: "idle timeout".to_string(),
                    },
                    &mut out,
                );
                closed += 1;
            }
        }
        out.flush(self);
        if closed > 0 {
            debug!(closed, "closed idle connections");
        }
        closed
    }

    /// Shut the pool down: fail every waiter, close every connection, and
    /// reject all later acquires. Idempotent.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let keys: Vec<EndpointKey> = state.endpoints.keys().cloned().collect();
            for key in keys {
                let conn_ids: Vec<u64> = {
                    let Some(endpoint) = state.endpoints.get_mut(&key) else {
                        continue;
                    };
                    for waiter in endpoint.waiters.drain() {
                        if waiter.latch.try_claim() {
                            waiter.timeout.cancel();
                            let callback = waiter.on_ready;
                            out.notify
                                .push(Box::new(move || callback(Err(CoreError::PoolShutDown))));
                        }
                    }
                    endpoint.conns.keys().copied().collect()
                };
                for conn_id in conn_ids {
                    self.close_connection_locked(
                        &mut state,
                        &key,
                        conn_id,
                        CoreError::PoolShutDown,
                        &mut out,
                    );
                }
            }
            state.endpoints.clear();
        }
        info!("connection pool shut down");
        out.flush(self);
    }

    // ── introspection ────────────────────────────────────────────────────

    /// Open connections for an endpoint (excludes in-establishment ones).
    pub fn open_connections(&self, key: &EndpointKey) -> usize {
        self.lock_state()
            .endpoints
            .get(key)
            .map(|e| e.conns.len())
            .unwrap_or(0)
    }

    /// Requests currently queued for an endpoint.
    pub fn queued_waiters(&self, key: &EndpointKey) -> usize {
        self.lock_state()
            .endpoints
            .get(key)
            .map(|e| e.waiters.len())
            .unwrap_or(0)
    }

    /// Lifecycle state of a pooled connection, if it is still pooled.
    pub fn connection_state(&self, connection: u64) -> Option<ConnState> {
        let mut state = self.lock_state();
        conn_mut(&mut state, connection).map(|c| c.state)
    }

    // ── internals ────────────────────────────────────────────────────────

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state lock poisoned")
    }

    /// Board waiters onto a connection while it has capacity: one exchange
    /// for a plain connection, up to the pipeline depth for a pipelined
    /// one. Oldest waiter first.
    fn assign_waiters_locked(
        self: &Arc<Self>,
        endpoint: &mut Endpoint,
        connection: u64,
        out: &mut AfterUnlock,
    ) -> usize {
        let mut assigned = 0;
        loop {
            let available = endpoint
                .conns
                .get(&connection)
                .map(|c| c.available(self.opts.pipelining, self.opts.max_pipeline_depth))
                .unwrap_or(false);
            if !available {
                break;
            }
            let Some(waiter) = endpoint.waiters.pop_front() else {
                break;
            };
            if let Some(conn) = endpoint.conns.get_mut(&connection) {
                self.assign_locked(conn, waiter, out);
                assigned += 1;
            }
        }
        assigned
    }

    fn assign_locked(
        self: &Arc<Self>,
        conn: &mut PooledConnection,
        waiter: Waiter,
        out: &mut AfterUnlock,
    ) {
        let lease = ConnectionLease {
            request: waiter.id,
            connection: conn.id,
            key: conn.key.clone(),
            pool: Arc::clone(self),
        };
        debug!(
            endpoint = %conn.key,
            connection = conn.id,
            request = %waiter.id,
            depth = conn.in_flight.len() + 1,
            waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
            "connection assigned"
        );
        conn.begin_exchange(InFlight {
            id: waiter.id,
            latch: waiter.latch,
            timeout: waiter.timeout,
            on_failed: waiter.on_failed,
        });
        let on_ready = waiter.on_ready;
        out.notify.push(Box::new(move || on_ready(Ok(lease))));
    }

    fn complete_head_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &EndpointKey,
        connection: u64,
        out: &mut AfterUnlock,
    ) {
        let outcome = {
            let Some(conn) = conn_mut(state, connection) else {
                return;
            };
            let Some(finished) = conn.finish_head() else {
                return;
            };
            if finished.latch.try_claim() {
                finished.timeout.cancel();
            }
            debug!(
                endpoint = %key,
                connection,
                request = %finished.id,
                remaining = conn.in_flight.len(),
                "exchange complete"
            );
            if !self.opts.keep_alive {
                ReleaseOutcome::MustClose {
                    reason: "keep-alive disabled".to_string(),
                }
            } else if !conn.in_flight.is_empty() {
                ReleaseOutcome::PipelinedSlotFreed
            } else {
                ReleaseOutcome::Reusable
            }
        };
        self.release_locked(state, key, connection, outcome, out);
    }

    fn release_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &EndpointKey,
        connection: u64,
        outcome: ReleaseOutcome,
        out: &mut AfterUnlock,
    ) {
        match outcome {
            ReleaseOutcome::Reusable => {
                let Some(endpoint) = state.endpoints.get_mut(key) else {
                    return;
                };
                if !endpoint.conns.contains_key(&connection) {
                    return;
                }
                if endpoint.waiters.is_empty() {
                    if let Some(conn) = endpoint.conns.get_mut(&connection) {
                        conn.mark_idle();
                    }
                } else {
                    // FIFO fairness: the freed connection goes straight to
                    // the oldest waiter instead of resting idle.
                    self.assign_waiters_locked(endpoint, connection, out);
                }
            }
            ReleaseOutcome::PipelinedSlotFreed => {
                let Some(endpoint) = state.endpoints.get_mut(key) else {
                    return;
                };
                self.assign_waiters_locked(endpoint, connection, out);
            }
            ReleaseOutcome::MustClose { reason } => {
                self.close_connection_locked(
                    state,
                    key,
                    connection,
                    CoreError::ConnectionClosed { reason },
                    out,
                );
            }
        }
    }

    fn ordering_violation_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &EndpointKey,
        connection: u64,
        expected: String,
        got: String,
        out: &mut AfterUnlock,
    ) {
        self.metrics.inc_ordering_violations();
        error!(
            endpoint = %key,
            connection,
            expected = %expected,
            got = %got,
            "pipelined response out of order; closing connection"
        );
        let err = CoreError::OrderingViolation {
            connection,
            expected,
            got,
        };
        self.close_connection_locked(state, key, connection, err, out);
    }

    /// Remove a connection, fail its unsettled in-flight exchanges with
    /// `reason`, close its transport, and schedule a replacement when
    /// waiters remain under the partition bound.
    fn close_connection_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &EndpointKey,
        connection: u64,
        reason: CoreError,
        out: &mut AfterUnlock,
    ) {
        let Some(endpoint) = state.endpoints.get_mut(key) else {
            return;
        };
        let Some(mut conn) = endpoint.conns.remove(&connection) else {
            return;
        };
        state.conn_index.remove(&connection);
        conn.state = ConnState::Closing;

        for mut entry in conn.in_flight.drain(..) {
            if entry.latch.try_claim() {
                entry.timeout.cancel();
                if let Some(callback) = entry.on_failed.take() {
                    let err = reason.clone();
                    out.notify.push(Box::new(move || callback(err)));
                }
            }
        }

        self.metrics.inc_connections_closed();
        debug!(endpoint = %key, connection, reason = %reason, "connection closed");
        conn.state = ConnState::Closed;
        out.closes.push(conn.transport);

        let Some(endpoint) = state.endpoints.get_mut(key) else {
            return;
        };
        if !endpoint.waiters.is_empty()
            && !self.shut_down.load(Ordering::Acquire)
            && endpoint.total() < self.opts.max_connections_per_endpoint
        {
            endpoint.connecting += 1;
            out.connects.push(key.clone());
            debug!(endpoint = %key, "creating replacement connection for waiters");
        }
    }

    fn request_timed_out(self: &Arc<Self>, key: EndpointKey, id: RequestId, after: Duration) {
        let after_ms = after.as_millis() as u64;
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let Some(endpoint) = state.endpoints.get_mut(&key) else {
                return;
            };

            if let Some(waiter) = endpoint.waiters.cancel(id) {
                if waiter.latch.try_claim() {
                    self.metrics.inc_requests_timed_out();
                    warn!(endpoint = %key, request = %id, after_ms, "request timed out in queue");
                    let callback = waiter.on_ready;
                    out.notify.push(Box::new(move || {
                        callback(Err(CoreError::Timeout { after_ms }))
                    }));
                }
            } else {
                // Already assigned: fail the request and discard its
                // connection, whose in-flight sequence position is no
                // longer trustworthy.
                let holder = endpoint
                    .conns
                    .values()
                    .find(|c| c.in_flight.iter().any(|r| r.id == id))
                    .map(|c| c.id);
                let Some(conn_id) = holder else {
                    // Completed before the timer fired; the latch already
                    // settled.
                    return;
                };
                if let Some(conn) = endpoint.conns.get_mut(&conn_id) {
                    if let Some(entry) = conn.in_flight.iter_mut().find(|r| r.id == id) {
                        if entry.latch.try_claim() {
                            self.metrics.inc_requests_timed_out();
                            warn!(
                                endpoint = %key,
                                connection = conn_id,
                                request = %id,
                                after_ms,
                                "request timed out; discarding connection"
                            );
                            if let Some(callback) = entry.on_failed.take() {
                                out.notify.push(Box::new(move || {
                                    callback(CoreError::Timeout { after_ms })
                                }));
                            }
                        }
                    }
                }
                self.close_connection_locked(
                    &mut state,
                    &key,
                    conn_id,
                    CoreError::ConnectionClosed {
                        reason: "connection discarded after request timeout".to_string(),
                    },
                    &mut out,
                );
            }
        }
        out.flush(self);
    }

    fn connect_succeeded(self: &Arc<Self>, key: EndpointKey, transport_conn: Box<dyn TransportConn>) {
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let conn_entry = {
                let endpoint = state.endpoints.entry(key.clone()).or_default();
                endpoint.connecting = endpoint.connecting.saturating_sub(1);
                if self.shut_down.load(Ordering::Acquire) {
                    out.closes.push(transport_conn);
                    None
                } else {
                    let conn = PooledConnection::new(key.clone(), transport_conn);
                    let conn_id = conn.id;
                    self.metrics.inc_connections_opened();
                    debug!(
                        endpoint = %key,
                        connection = conn_id,
                        open = endpoint.conns.len() + 1,
                        "connection established"
                    );
                    endpoint.conns.insert(conn_id, conn);
                    self.assign_waiters_locked(endpoint, conn_id, &mut out);
                    Some(conn_id)
                }
            };
            if let Some(conn_id) = conn_entry {
                state.conn_index.insert(conn_id, key);
            }
        }
        out.flush(self);
    }

    fn connect_failed(self: &Arc<Self>, key: EndpointKey, err: CoreError) {
        self.metrics.inc_connect_failures();
        let mut out = AfterUnlock::default();
        {
            let mut state = self.lock_state();
            let endpoint = state.endpoints.entry(key.clone()).or_default();
            endpoint.connecting = endpoint.connecting.saturating_sub(1);
            warn!(endpoint = %key, error = %err, "connection establishment failed");
            // The triggering request and everything queued behind it for
            // this endpoint fail together; other partitions are untouched.
            for waiter in endpoint.waiters.drain() {
                if waiter.latch.try_claim() {
                    waiter.timeout.cancel();
                    let failure = err.clone();
                    let callback = waiter.on_ready;
                    out.notify.push(Box::new(move || callback(Err(failure))));
                }
            }
        }
        out.flush(self);
    }

    fn spawn_connect(self: &Arc<Self>, key: EndpointKey) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let timer = ConnectTimer::start(&key);
            let result = retry::connect_with_retry(
                pool.transport.as_ref(),
                &key,
                &pool.opts.connect_retry,
                pool.opts.connect_timeout(),
            )
            .await;
            timer.finish(result.is_ok());
            match result {
                Ok(conn) => pool.connect_succeeded(key, conn),
                Err(err) => pool.connect_failed(key, err),
            }
        });
    }

    fn spawn_idle_sweeper(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let every = pool.opts.idle_sweep_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.shut_down.load(Ordering::Acquire) {
                    break;
                }
                pool.close_idle(Instant::now());
            }
        });
    }
}

fn expected_of(head: Option<&InFlight>) -> String {
    head.map(|h| h.id.to_string())
        .unwrap_or_else(|| "none".to_string())
}
