//! Command-line flags for the notebook server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use folio_collab::config::EngineConfig;
use folio_collab::storage::StoreConfig;

/// Collaborative notebook server
#[derive(Parser, Debug)]
#[command(name = "folio-server")]
#[command(version)]
pub struct Cli {
    /// Address to accept WebSocket connections on
    #[arg(short, long, default_value = "127.0.0.1:9090", env = "FOLIO_BIND")]
    pub bind: SocketAddr,

    /// Directory for the notebook database. Notebooks live in memory only
    /// when omitted.
    #[arg(short = 'D', long, env = "FOLIO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds between WebSocket pings
    #[arg(long, default_value_t = 30, env = "FOLIO_HEARTBEAT_SECS")]
    pub heartbeat_secs: u64,

    /// Seconds of silence before a session is dropped
    #[arg(long, default_value_t = 120, env = "FOLIO_SESSION_TIMEOUT_SECS")]
    pub session_timeout_secs: u64,

    /// Maximum sessions attached to one notebook
    #[arg(long, default_value_t = 100, env = "FOLIO_MAX_SESSIONS")]
    pub max_sessions: usize,

    /// Rows returned per query before truncation
    #[arg(long, default_value_t = 1000, env = "FOLIO_ROW_LIMIT")]
    pub row_limit: usize,

    /// Query time limit in milliseconds
    #[arg(long, default_value_t = 5000, env = "FOLIO_TIME_LIMIT_MS")]
    pub time_limit_ms: u64,

    /// Concurrent executions per notebook
    #[arg(long, default_value_t = 2, env = "FOLIO_DOC_CONCURRENCY")]
    pub doc_concurrency: usize,

    /// Concurrent executions across the server
    #[arg(long, default_value_t = 8, env = "FOLIO_GLOBAL_CONCURRENCY")]
    pub global_concurrency: usize,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.server.bind_addr = self.bind;
        config.server.heartbeat_interval_secs = self.heartbeat_secs;
        config.server.session_timeout_secs = self.session_timeout_secs;
        config.broker.max_sessions_per_document = self.max_sessions;
        config.store = StoreConfig {
            path: self.data_dir.clone(),
            ..StoreConfig::default()
        };
        config.sandbox.row_limit = self.row_limit;
        config.sandbox.time_limit = Duration::from_millis(self.time_limit_ms);
        config.scheduler.per_document_concurrency = self.doc_concurrency.max(1);
        config.scheduler.global_concurrency = self.global_concurrency.max(1);
        config
    }
}
