//! Engine configuration.
//!
//! Each component takes its own plain config struct; [`EngineConfig`]
//! bundles them for the engine facade and the server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StoreConfig;

/// WebSocket listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (default: 127.0.0.1:9090)
    pub bind_addr: SocketAddr,
    /// Heartbeat ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Sessions silent for this long are reaped
    pub session_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            heartbeat_interval_secs: 30,
            session_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on localhost.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            heartbeat_interval_secs: 5,
            session_timeout_secs: 30,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Session broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-document broadcast channel capacity
    pub broadcast_capacity: usize,
    /// Presence flush interval (~30 updates/s)
    pub presence_interval: Duration,
    pub max_sessions_per_document: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            presence_interval: Duration::from_millis(33),
            max_sessions_per_document: 100,
        }
    }
}

impl BrokerConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            presence_interval: Duration::from_millis(10),
            max_sessions_per_document: 8,
        }
    }
}

/// Query sandbox limits.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Rows returned before the result is truncated
    pub row_limit: usize,
    /// Wall-clock bound for one query
    pub time_limit: Duration,
    /// Rows scanned between cancellation checks
    pub cancel_check_rows: usize,
    /// Delay before the single retry of a transient dataset failure
    pub retry_backoff: Duration,
    /// Longest accepted query text, in bytes
    pub max_query_len: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            row_limit: 1000,
            time_limit: Duration::from_secs(5),
            cancel_check_rows: 256,
            retry_backoff: Duration::from_millis(50),
            max_query_len: 16 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn for_testing() -> Self {
        Self {
            row_limit: 3,
            time_limit: Duration::from_millis(200),
            cancel_check_rows: 1,
            retry_backoff: Duration::from_millis(5),
            max_query_len: 1024,
        }
    }
}

/// Execution scheduler admission limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Executions running at once for one document
    pub per_document_concurrency: usize,
    /// Executions running at once across all documents
    pub global_concurrency: usize,
    /// Queued plus running requests per document before `Overloaded`
    pub max_pending_per_document: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            per_document_concurrency: 2,
            global_concurrency: 8,
            max_pending_per_document: 32,
        }
    }
}

impl SchedulerConfig {
    pub fn for_testing() -> Self {
        Self {
            per_document_concurrency: 2,
            global_concurrency: 4,
            max_pending_per_document: 4,
        }
    }
}

/// Everything the engine facade needs.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Small limits, no persistence.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::for_testing(),
            broker: BrokerConfig::for_testing(),
            store: StoreConfig::in_memory(),
            sandbox: SandboxConfig::for_testing(),
            scheduler: SchedulerConfig::for_testing(),
        }
    }

    /// Small limits, persisted under `path`.
    pub fn for_testing_at(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::for_testing(path),
            ..Self::for_testing()
        }
    }
}
