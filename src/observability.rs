// SPDX-License-Identifier: MIT
//! Observability utilities.
//!
//! Structured logging setup for embedders and tests, plus a timer around
//! connection establishment.

use std::time::Instant;

use tracing::{debug, info};

use crate::transport::EndpointKey;

/// Establishment slower than this is logged at info instead of debug.
const SLOW_CONNECT_MS: u64 = 1_000;

/// Install a `tracing` subscriber reading the `RUST_LOG` filter.
///
/// Safe to call more than once; later calls are no-ops. Intended for
/// binaries and tests embedding the core — libraries never install a
/// subscriber implicitly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Times connection establishment for one endpoint, retries included, and
/// emits a single structured event when the attempt resolves.
pub(crate) struct ConnectTimer {
    endpoint: String,
    start: Instant,
}

impl ConnectTimer {
    pub fn start(endpoint: &EndpointKey) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            start: Instant::now(),
        }
    }

    /// Log the elapsed time, promoted to info when a successful connect was
    /// slow. Failures stay at debug; the pool's failure path owns the warn.
    pub fn finish(self, connected: bool) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        if !connected {
            debug!(endpoint = %self.endpoint, elapsed_ms, "connect attempt gave up");
        } else if elapsed_ms > SLOW_CONNECT_MS {
            info!(endpoint = %self.endpoint, elapsed_ms, "slow connect");
        } else {
            debug!(endpoint = %self.endpoint, elapsed_ms, "connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn timer_finishes_quietly() {
        let timer = ConnectTimer::start(&EndpointKey::plain("host", 80));
        timer.finish(true);
        let timer = ConnectTimer::start(&EndpointKey::tls("host", 443));
        timer.finish(false);
    }
}
