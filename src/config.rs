// SPDX-License-Identifier: MIT
//! Core configuration — consumed by the runtime and connection pools.
//!
//! The core does not own configuration discovery; embedders either build
//! [`CoreConfig`] in code, deserialize it from a TOML file via
//! [`CoreConfig::load`], or accept the defaults. All duration-valued fields
//! are plain millisecond integers in the file format and exposed as
//! [`Duration`] through accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT: usize = 1;
const DEFAULT_MAX_PIPELINE_DEPTH: usize = 4;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_IDLE_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_WRITE_QUEUE_HIGH_WATERMARK: usize = 64 * 1024;
const DEFAULT_WRITE_QUEUE_LOW_WATERMARK: usize = 32 * 1024;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

fn default_event_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// ─── CoreConfig ──────────────────────────────────────────────────────────────

/// Top-level configuration for the concurrency core (`[core]` plus a
/// `[pool]` section in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of event-processing workers. Contexts with event-loop affinity
    /// are distributed over these round-robin.
    ///
    /// Default: available CPU parallelism.
    pub event_workers: usize,
    /// Whether the ambient diagnostic map travels with tasks across
    /// asynchronous hops. When disabled, task wrapping skips all
    /// save/restore overhead.
    ///
    /// Default: true
    pub ambient_propagation: bool,
    /// Per-endpoint connection pool policy.
    pub pool: PoolOptions,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            event_workers: default_event_workers(),
            ambient_propagation: true,
            pool: PoolOptions::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults; the result is validated
    /// before it is returned.
    pub fn load(path: impl AsRef<Path>) -> Result<CoreConfig, CoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: CoreConfig = toml::from_str(&raw)
            .map_err(|e| CoreError::Configuration(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.event_workers < 1 {
            return Err(CoreError::Configuration(
                "event_workers must be at least 1".to_string(),
            ));
        }
        self.pool.validate()
    }
}

// ─── PoolOptions ─────────────────────────────────────────────────────────────

/// Per-endpoint connection pool policy (`[pool]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Upper bound on simultaneously open connections per endpoint key.
    /// Connections being established count against the bound.
    ///
    /// Default: 1
    pub max_connections_per_endpoint: usize,
    /// Reuse a connection for multiple sequential exchanges instead of
    /// closing it after each one.
    ///
    /// Default: true
    pub keep_alive: bool,
    /// Write multiple requests on one connection before their responses
    /// arrive. Requires `keep_alive`; enabling it without keep-alive is a
    /// configuration error that fails every acquire on the pool.
    ///
    /// Default: false
    pub pipelining: bool,
    /// Maximum number of in-flight exchanges on one pipelined connection.
    ///
    /// Default: 4
    pub max_pipeline_depth: usize,
    /// Deadline for establishing one transport connection, in milliseconds.
    ///
    /// Default: 60 000 (one minute)
    pub connect_timeout_ms: u64,
    /// Default deadline for a whole exchange, queue time included, applied
    /// to requests that do not set their own. 0 means no default deadline.
    ///
    /// Default: 0
    pub request_timeout_ms: u64,
    /// Close idle connections older than this, in milliseconds.
    /// `None` keeps idle connections until the pool shuts down.
    ///
    /// Default: None
    pub idle_timeout_ms: Option<u64>,
    /// How often the idle sweep runs when `idle_timeout_ms` is set,
    /// in milliseconds.
    ///
    /// Default: 30 000
    pub idle_sweep_interval_ms: u64,
    /// Buffered-but-unsent bytes at which a connection reports its write
    /// queue as full and suppresses further writes.
    ///
    /// Default: 64 KiB
    pub write_queue_high_watermark: usize,
    /// Buffered-but-unsent bytes below which a full write queue drains and
    /// fires its drain notification (once per crossing).
    ///
    /// Default: 32 KiB
    pub write_queue_low_watermark: usize,
    /// Retry policy for connection establishment. The default performs a
    /// single attempt, so connect failures surface immediately.
    pub connect_retry: RetryConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            keep_alive: true,
            pipelining: false,
            max_pipeline_depth: DEFAULT_MAX_PIPELINE_DEPTH,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: 0,
            idle_timeout_ms: None,
            idle_sweep_interval_ms: DEFAULT_IDLE_SWEEP_INTERVAL_MS,
            write_queue_high_watermark: DEFAULT_WRITE_QUEUE_HIGH_WATERMARK,
            write_queue_low_watermark: DEFAULT_WRITE_QUEUE_LOW_WATERMARK,
            connect_retry: RetryConfig::default(),
        }
    }
}

impl PoolOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The default exchange deadline, or `None` when unset.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    /// Validate the pool policy. The pipelining/keep-alive combination is
    /// also checked at pool construction so the error becomes a standing
    /// condition for that instance.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_connections_per_endpoint < 1 {
            return Err(CoreError::Configuration(
                "max_connections_per_endpoint must be at least 1".to_string(),
            ));
        }
        if self.pipelining && !self.keep_alive {
            return Err(CoreError::Configuration(
                "pipelining requires keep_alive".to_string(),
            ));
        }
        if self.max_pipeline_depth < 1 {
            return Err(CoreError::Configuration(
                "max_pipeline_depth must be at least 1".to_string(),
            ));
        }
        if self.write_queue_low_watermark > self.write_queue_high_watermark {
            return Err(CoreError::Configuration(
                "write_queue_low_watermark must not exceed write_queue_high_watermark".to_string(),
            ));
        }
        self.connect_retry.validate()
    }
}

// ─── RetryConfig ─────────────────────────────────────────────────────────────

/// Exponential backoff policy for connection establishment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of connect attempts (including the first try).
    ///
    /// Default: 1 (no retries)
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    ///
    /// Each subsequent delay is multiplied by `multiplier`.
    /// Default: 500
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between attempts, in milliseconds.
    ///
    /// Default: 30 000
    pub max_delay_ms: u64,
    /// Multiplier applied to the previous delay on each retry.
    ///
    /// Default: 2.0 (doubles each time)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts < 1 {
            return Err(CoreError::Configuration(
                "connect_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(CoreError::Configuration(
                "connect_retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.ambient_propagation);
        assert_eq!(config.pool.max_connections_per_endpoint, 1);
        assert!(config.pool.keep_alive);
        assert!(!config.pool.pipelining);
        assert_eq!(config.pool.request_timeout(), None);
        assert_eq!(config.pool.connect_retry.max_attempts, 1);
    }

    #[test]
    fn rejects_zero_pool_size() {
        let mut config = CoreConfig::default();
        config.pool.max_connections_per_endpoint = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn rejects_pipelining_without_keep_alive() {
        let mut config = CoreConfig::default();
        config.pool.pipelining = true;
        config.pool.keep_alive = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keep_alive"));
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut config = CoreConfig::default();
        config.pool.write_queue_low_watermark = 1024;
        config.pool.write_queue_high_watermark = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
event_workers = 2

[pool]
max_connections_per_endpoint = 10
pipelining = true
max_pipeline_depth = 8
request_timeout_ms = 5000
"#,
        )
        .unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.event_workers, 2);
        assert_eq!(config.pool.max_connections_per_endpoint, 10);
        assert!(config.pool.pipelining);
        assert_eq!(config.pool.max_pipeline_depth, 8);
        assert_eq!(config.pool.request_timeout(), Some(Duration::from_secs(5)));
        // Untouched keys keep their defaults.
        assert!(config.pool.keep_alive);
        assert_eq!(config.pool.connect_timeout_ms, 60_000);
    }

    #[test]
    fn load_rejects_invalid_combination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[pool]
keep_alive = false
pipelining = true
"#,
        )
        .unwrap();

        assert!(CoreConfig::load(&path).is_err());
    }
}
