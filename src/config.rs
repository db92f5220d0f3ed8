//! Configuration handling.
//!
//! Process-level settings come from CLI arguments and `DBO_*` environment
//! variables. [`ManagerConfig`] is the runtime view the [`Manager`] consumes,
//! and [`PoolOptions`] carries per-connection pool tuning parsed from URLs.
//!
//! [`Manager`]: crate::manager::Manager

use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;

// Manager defaults
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_SCHEMA_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SCHEMA_SETTLE_DELAY_MS: u64 = 5_000;
pub const DEFAULT_SCHEMA_RECHECK_DELAY_MS: u64 = 2_000;
pub const DEFAULT_EXECUTION_CEILING_SECS: u64 = 60;
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_ROLLBACK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_LOOP_RESTARTS: u32 = 5;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

// Query defaults
pub const DEFAULT_ROW_LIMIT: u32 = 1000;
pub const MAX_ROW_LIMIT: u32 = 10_000;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection pool tuning, parsed from URL query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Default: 10 for MySQL/PostgreSQL/MongoDB, 1 for SQLite
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    /// Idle timeout of individual physical connections inside the pool
    pub idle_timeout_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub test_before_acquire: Option<bool>,
    /// Budget for the initial connect plus verification ping
    pub connect_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Query parameter names consumed by [`PoolOptions::extract`].
    pub const KEYS: &'static [&'static str] = &[
        "max_connections",
        "min_connections",
        "idle_timeout",
        "acquire_timeout",
        "test_before_acquire",
        "connect_timeout",
    ];

    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs
            .unwrap_or(DEFAULT_POOL_IDLE_TIMEOUT_SECS)
    }

    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    pub fn connect_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// Build pool options from already-extracted query parameters.
    /// Unparseable values are ignored and fall back to defaults.
    pub fn extract(opts: &mut HashMap<String, String>) -> Self {
        Self {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            min_connections: opts.remove("min_connections").and_then(|v| v.parse().ok()),
            idle_timeout_secs: opts.remove("idle_timeout").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
            test_before_acquire: opts.remove("test_before_acquire").and_then(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }),
            connect_timeout_secs: opts.remove("connect_timeout").and_then(|v| v.parse().ok()),
        }
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min == 0 {
                return Err("min_connections must be greater than 0".to_string());
            }
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Timing and supervision settings for a [`Manager`](crate::manager::Manager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Sessions and unreferenced pools idle longer than this are reclaimed.
    pub idle_timeout: Duration,
    /// Period of the eviction loop.
    pub cleanup_interval: Duration,
    /// Period of the per-session schema refresh.
    pub schema_check_interval: Duration,
    /// Delay between connect and the first schema check.
    pub schema_settle_delay: Duration,
    /// Delay between a committed schema-mutating statement and its re-check.
    pub schema_recheck_delay: Duration,
    /// Upper bound on any single query execution.
    pub execution_ceiling: Duration,
    /// Liveness ping budget for `is_connected`.
    pub ping_timeout: Duration,
    /// How long a cancelled, timed-out or failed execution waits for its
    /// rollback before returning.
    pub rollback_timeout: Duration,
    /// Budget for closing one pool. A pool whose connection is still busy
    /// with an abandoned statement is dropped once it passes.
    pub close_timeout: Duration,
    /// Restarts the eviction supervisor allows after panics.
    pub max_loop_restarts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            schema_check_interval: Duration::from_secs(DEFAULT_SCHEMA_CHECK_INTERVAL_SECS),
            schema_settle_delay: Duration::from_millis(DEFAULT_SCHEMA_SETTLE_DELAY_MS),
            schema_recheck_delay: Duration::from_millis(DEFAULT_SCHEMA_RECHECK_DELAY_MS),
            execution_ceiling: Duration::from_secs(DEFAULT_EXECUTION_CEILING_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            rollback_timeout: Duration::from_millis(DEFAULT_ROLLBACK_TIMEOUT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            max_loop_restarts: DEFAULT_MAX_LOOP_RESTARTS,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "chat-db-orchestrator",
    about = "Chat-scoped database session orchestrator speaking line-delimited JSON on stdio",
    version,
    author
)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBO_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBO_JSON_LOGS")]
    pub json_logs: bool,

    /// Idle threshold for sessions and unreferenced pools, in seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "DBO_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Eviction loop period, in seconds
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "DBO_CLEANUP_INTERVAL")]
    pub cleanup_interval: u64,

    /// Schema refresh period, in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_SCHEMA_CHECK_INTERVAL_SECS,
        env = "DBO_SCHEMA_CHECK_INTERVAL"
    )]
    pub schema_check_interval: u64,

    /// Delay before the first schema check after connect, in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_SCHEMA_SETTLE_DELAY_MS,
        env = "DBO_SCHEMA_SETTLE_DELAY_MS"
    )]
    pub schema_settle_delay_ms: u64,

    /// Delay before re-checking schema after a committed DDL statement, in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_SCHEMA_RECHECK_DELAY_MS,
        env = "DBO_SCHEMA_RECHECK_DELAY_MS"
    )]
    pub schema_recheck_delay_ms: u64,

    /// Hard ceiling for a single query execution, in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_EXECUTION_CEILING_SECS,
        env = "DBO_EXECUTION_TIMEOUT"
    )]
    pub execution_timeout: u64,

    /// Liveness ping timeout, in seconds
    #[arg(long, default_value_t = DEFAULT_PING_TIMEOUT_SECS, env = "DBO_PING_TIMEOUT")]
    pub ping_timeout: u64,

    /// Wait for a rollback before answering a cancelled or timed-out query, in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_ROLLBACK_TIMEOUT_MS,
        env = "DBO_ROLLBACK_TIMEOUT_MS"
    )]
    pub rollback_timeout_ms: u64,

    /// Per-pool close budget at eviction and shutdown, in milliseconds
    #[arg(long, default_value_t = DEFAULT_CLOSE_TIMEOUT_MS, env = "DBO_CLOSE_TIMEOUT_MS")]
    pub close_timeout_ms: u64,

    /// Maximum restarts of the eviction loop after a panic
    #[arg(long, default_value_t = DEFAULT_MAX_LOOP_RESTARTS, env = "DBO_MAX_LOOP_RESTARTS")]
    pub max_loop_restarts: u32,

    /// Maximum rows returned by a single read statement
    #[arg(long, default_value_t = DEFAULT_ROW_LIMIT, env = "DBO_ROW_LIMIT")]
    pub row_limit: u32,

    /// Capacity of the event broadcast channel
    #[arg(long, default_value_t = DEFAULT_EVENT_BUFFER, env = "DBO_EVENT_BUFFER")]
    pub event_buffer: usize,
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            schema_check_interval: DEFAULT_SCHEMA_CHECK_INTERVAL_SECS,
            schema_settle_delay_ms: DEFAULT_SCHEMA_SETTLE_DELAY_MS,
            schema_recheck_delay_ms: DEFAULT_SCHEMA_RECHECK_DELAY_MS,
            execution_timeout: DEFAULT_EXECUTION_CEILING_SECS,
            ping_timeout: DEFAULT_PING_TIMEOUT_SECS,
            rollback_timeout_ms: DEFAULT_ROLLBACK_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            max_loop_restarts: DEFAULT_MAX_LOOP_RESTARTS,
            row_limit: DEFAULT_ROW_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Row limit clamped to `[1, MAX_ROW_LIMIT]`.
    pub fn effective_row_limit(&self) -> u32 {
        self.row_limit.clamp(1, MAX_ROW_LIMIT)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            cleanup_interval: Duration::from_secs(self.cleanup_interval.max(1)),
            schema_check_interval: Duration::from_secs(self.schema_check_interval.max(1)),
            schema_settle_delay: Duration::from_millis(self.schema_settle_delay_ms),
            schema_recheck_delay: Duration::from_millis(self.schema_recheck_delay_ms),
            execution_ceiling: Duration::from_secs(self.execution_timeout.max(1)),
            ping_timeout: Duration::from_secs(self.ping_timeout.max(1)),
            rollback_timeout: Duration::from_millis(self.rollback_timeout_ms.max(1)),
            close_timeout: Duration::from_millis(self.close_timeout_ms.max(1)),
            max_loop_restarts: self.max_loop_restarts,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
