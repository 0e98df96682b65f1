//! # folio-collab: Collaborative session engine
//!
//! Hosts shared notebooks: sequences concurrent edits, fans events out to
//! every participant, and runs read-only queries against a dataset with
//! results written back into the document.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   WebSocket    ┌────────────────┐
//! │ NotebookClient │ ◄────────────► │ NotebookServer │
//! │ (Replica)      │  bincode msgs  └───────┬────────┘
//! └────────────────┘                        │
//!                                   ┌───────▼────────┐
//!                                   │ SessionEngine  │
//!                                   └─┬─────┬──────┬─┘
//!                ┌────────────────────┘     │      └──────────────────┐
//!        ┌───────▼───────┐         ┌────────▼──────┐        ┌─────────▼─────────┐
//!        │ DocumentStore │         │ SessionBroker │        │ExecutionScheduler │
//!        │ (MergeEngine, │         │ (rooms,       │        │ (per-doc + global │
//!        │  RocksDB)     │         │  presence)    │        │  limits)          │
//!        └───────────────┘         └───────────────┘        └─────────┬─────────┘
//!                                                               ┌─────▼──────┐
//!                                                               │QuerySandbox│
//!                                                               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages (bincode-encoded)
//! - [`document_store`]: Authoritative notebooks, sequencing and persistence
//! - [`broker`]: Sessions, rooms and ordered event streams
//! - [`sandbox`]: Read-only SQL against a [`Dataset`](sandbox::Dataset)
//! - [`scheduler`]: Bounded, cancellable execution queue
//! - [`engine`]: Facade tying the above together
//! - [`server`] / [`client`]: WebSocket transport

pub mod broadcast;
pub mod broker;
pub mod client;
pub mod config;
pub mod document_store;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod sandbox;
pub mod scheduler;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use broker::{EventStream, Session, SessionBroker, StreamItem};
pub use client::{ClientError, ClientEvent, ConnectionState, NotebookClient};
pub use config::{BrokerConfig, EngineConfig, SandboxConfig, SchedulerConfig, ServerConfig};
pub use document_store::{DocumentStore, Sequencer};
pub use engine::{Connection, SessionEngine};
pub use error::EngineError;
pub use protocol::{
    ClientMessage, CursorPosition, ErrorKind, NotebookSummary, ProtocolError, ServerEvent, UserIdentity,
};
pub use sandbox::{Dataset, DatasetError, ExecutionRequest, MemoryDataset, QuerySandbox, SandboxError, Table};
pub use scheduler::{CompletedExecution, ExecutionScheduler, SchedulerError, Ticket};
pub use server::{NotebookServer, ServerStats};
pub use storage::{AuditAction, AuditEntry, NotebookDb, NotebookMetadata, StoreConfig, StoreError};
