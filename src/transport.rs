// SPDX-License-Identifier: MIT
//! Transport and codec boundary.
//!
//! The core never parses wire formats and never opens sockets itself. It
//! talks to a [`Transport`] to establish connections, hands bytes to a
//! [`TransportConn`] to write, and receives one terminal [`CodecEvent`] per
//! exchange from whatever protocol codec owns the framing. Everything on the
//! far side of these traits is a collaborator, not part of the core.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::pool::RequestId;

/// Identity of a remote endpoint as the pool partitions it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// Host name or IP address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Whether the connection is TLS-wrapped.
    pub tls: bool,
}

impl EndpointKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Plaintext endpoint.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    /// TLS endpoint.
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, true)
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Connection factory implemented by the transport layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish one physical connection to the endpoint.
    async fn connect(&self, key: &EndpointKey) -> Result<Box<dyn TransportConn>, CoreError>;
}

/// One established transport connection.
///
/// Writes are fire-and-forget from the pool's perspective; the transport
/// reports drained bytes back through the pool so watermark accounting stays
/// accurate. `close` must be idempotent.
pub trait TransportConn: Send + Sync + 'static {
    /// Queue bytes for sending.
    fn write(&self, bytes: &[u8]) -> Result<(), CoreError>;

    /// Transport-level saturation signal, combined with the pool's own
    /// watermark accounting.
    fn write_queue_full(&self) -> bool {
        false
    }

    /// Close the underlying connection.
    fn close(&self);
}

/// Terminal signal reported by the protocol codec for one exchange.
///
/// The `request` field names the exchange the codec believes it is
/// completing; the pool verifies it against the head of the connection's
/// in-flight sequence and treats any mismatch as an ordering violation.
#[derive(Debug, Clone)]
pub enum CodecEvent {
    /// First byte(s) of a response arrived and were attributed.
    ResponseHead { request: RequestId },
    /// The exchange finished cleanly; the connection slot is free.
    ResponseComplete { request: RequestId },
    /// The exchange failed mid-flight; the connection state is unknown.
    ExchangeFailed { request: RequestId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_key_display_and_hash() {
        use std::collections::HashSet;

        let a = EndpointKey::plain("example.com", 80);
        let b = EndpointKey::tls("example.com", 443);
        assert_eq!(a.to_string(), "tcp://example.com:80");
        assert_eq!(b.to_string(), "tls://example.com:443");

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b.clone());
        set.insert(EndpointKey::plain("example.com", 80));
        assert_eq!(set.len(), 2);
    }
}
