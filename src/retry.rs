// SPDX-License-Identifier: MIT
//! Connection-establishment retry.
//!
//! Connect attempts are the one place the core retries on its own: a failed
//! attempt can be repeated with exponentially increasing delays, bounded by
//! [`RetryConfig`]. The default policy performs a single attempt, so retries
//! are strictly opt-in. Each attempt is individually capped by the pool's
//! connect timeout.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::CoreError;
use crate::transport::{EndpointKey, Transport, TransportConn};

/// Establish a connection, retrying per `config`.
///
/// Returns the connection from the first successful attempt, or the error
/// of the last attempt once `config.max_attempts` is exhausted. Each attempt
/// is bounded by `attempt_timeout`; an attempt that exceeds it counts as a
/// failed attempt with a timeout reason.
pub(crate) async fn connect_with_retry(
    transport: &dyn Transport,
    key: &EndpointKey,
    config: &RetryConfig,
    attempt_timeout: Duration,
) -> Result<Box<dyn TransportConn>, CoreError> {
    let mut delay = config.initial_delay();
    let mut last_err = None;

    for attempt in 1..=config.max_attempts {
        match connect_once(transport, key, attempt_timeout).await {
            Ok(conn) => {
                if attempt > 1 {
                    debug!(endpoint = %key, attempt, "connect retry succeeded");
                }
                return Ok(conn);
            }
            Err(e) => {
                if attempt < config.max_attempts {
                    warn!(
                        endpoint = %key,
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        err = %e,
                        "connect attempt failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    // Compute next delay: multiply and cap.
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(
                        next_ms.min(config.max_delay().as_millis()) as u64
                    );
                } else {
                    last_err = Some(e);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CoreError::ConnectFailed {
        endpoint: key.to_string(),
        reason: "no connect attempts were made".to_string(),
    }))
}

async fn connect_once(
    transport: &dyn Transport,
    key: &EndpointKey,
    attempt_timeout: Duration,
) -> Result<Box<dyn TransportConn>, CoreError> {
    match tokio::time::timeout(attempt_timeout, transport.connect(key)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::ConnectFailed {
            endpoint: key.to_string(),
            reason: format!("connect timed out after {} ms", attempt_timeout.as_millis()),
        }),
    }
}
