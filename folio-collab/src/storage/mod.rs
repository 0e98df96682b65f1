//! Persistent storage layer for notebooks.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  op records   ┌──────────────┐
//! │ DocumentStore │ ────────────► │ NotebookDb   │
//! │ (sequencers)  │               │ (RocksDB)    │
//! └──────┬────────┘               └──────┬───────┘
//!        │                               │
//!        │ on startup                    │ column families
//!        ▼                               ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ Notebook    │     │ CF "snapshots" - notebooks        │
//! │ (snapshot + │     │ CF "ops"       - op records       │
//! │  replay)    │     │ CF "metadata"  - title, version   │
//! └─────────────┘     │ CF "audit"     - audit trail      │
//!                     └──────────────────────────────────┘
//! ```
//!
//! An op record is written before the sequencer commits the operation, so a
//! restart replays exactly the acknowledged history.

pub mod rocks;
pub mod wal;

pub use rocks::{
    AuditAction, AuditEntry, NotebookDb, NotebookMetadata, RecoveredOps, Snapshot, StoreConfig, StoreError,
};
pub use wal::{OpRecord, RecordError, recover_records};
