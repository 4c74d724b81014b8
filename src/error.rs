// SPDX-License-Identifier: MIT
//! Core error taxonomy.
//!
//! Every failure the core can hand to a caller is a [`CoreError`]. Failures
//! stay scoped: a timeout or connection loss fails the specific pending
//! operation it belongs to, while a configuration error is raised once at
//! construction and then stands for the lifetime of that pool instance.
//! Errors are `Clone` because a single root cause (a failed connect, a closed
//! connection) may have to be delivered to several queued callers.

/// Failure surfaced by the execution-context and connection-pool core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Invalid configuration, e.g. pipelining without keep-alive or a pool
    /// size below 1. Fatal to the pool instance that carries it; every
    /// acquire on that pool fails with this error.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The transport could not establish a connection to the endpoint.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// No terminal response arrived within the caller-set deadline. The
    /// connection assigned to the request (if any) has been discarded.
    #[error("request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// A pipelined response could not be matched to the head of the
    /// connection's in-flight sequence. Fatal for that connection only.
    #[error("pipelined response out of order on connection {connection}: expected {expected}, got {got}")]
    OrderingViolation {
        connection: u64,
        expected: String,
        got: String,
    },

    /// The connection carrying the request was closed before the exchange
    /// reached a terminal state.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The pool has been shut down; no further requests are accepted.
    #[error("pool is shut down")]
    PoolShutDown,

    /// Application-supplied work inside a context-wrapped task failed or
    /// panicked. Captured and reported, never propagated to the worker.
    #[error("task failed: {message}")]
    TaskFailed { message: String },

    /// Aggregate outcome of running close hooks when at least one failed.
    #[error("{failed} of {total} close hooks failed; first failure: {first}")]
    CloseHooksFailed {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl CoreError {
    /// True for errors that represent a standing condition of the pool
    /// rather than the outcome of one request.
    pub fn is_standing(&self) -> bool {
        matches!(self, CoreError::Configuration(_) | CoreError::PoolShutDown)
    }
}
