// SPDX-License-Identifier: MIT
//! Strand — execution-context and connection-management core for async
//! network services.
//!
//! Two halves make up the crate. Execution contexts pin logical units of
//! work to one event-processing worker (or a dedicated ordered background
//! worker), carrying an ambient diagnostic map and failure reporting across
//! every asynchronous hop. The connection pool multiplexes outbound
//! requests over a bounded set of transport connections per endpoint, with
//! keep-alive reuse, optional pipelining with strict response ordering,
//! FIFO waiter fairness, per-request timeouts, and write-queue
//! backpressure. Wire formats, TLS, and sockets live behind the
//! [`transport`] boundary traits and are not part of the core.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod pool;
mod retry;
pub mod runtime;
pub mod timeout;
pub mod transport;
pub mod worker;

pub use config::{CoreConfig, PoolOptions, RetryConfig};
pub use context::{Affinity, DeploymentHandle, ExecutionContext, FailureSink};
pub use error::CoreError;
pub use pool::{ConnectionLease, ConnectionPool, PoolRequest, ReleaseOutcome, RequestId};
pub use runtime::Runtime;
pub use transport::{CodecEvent, EndpointKey, Transport, TransportConn};
