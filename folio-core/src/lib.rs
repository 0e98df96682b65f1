//! # folio-core: Notebook model and merge engine
//!
//! Pure, synchronous building blocks of the collaborative session engine:
//! the notebook document, edit operations, operational transform, the
//! per-document sequencer and the client replica.
//!
//! ## Data flow
//!
//! ```text
//! ┌─────────────┐   Operation    ┌──────────────┐
//! │  Replica    │ ─────────────► │ MergeEngine  │
//! │ (per user)  │                │ (per doc)    │
//! └──────▲──────┘                └──────┬───────┘
//!        │     (version, op')           │ transform vs unseen
//!        └──────────────────────────────┤
//!                                       ▼
//!                                ┌──────────────┐
//!                                │  Notebook    │
//!                                │ cells, text, │
//!                                │ comments     │
//!                                └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Notebook, cells, comments and validation
//! - [`operation`]: Operations and logical timestamps
//! - [`transform`]: Pairwise operational transform
//! - [`merge`]: Operation log and sequencer
//! - [`replica`]: Client-side replica with pending queue
//! - [`result`]: Typed tabular execution results

pub mod document;
pub mod merge;
pub mod operation;
pub mod replica;
pub mod result;
pub mod transform;

pub use document::{
    Anchor, ApplyError, Cell, CellId, CellKind, Comment, CommentId, DocId, Notebook, SessionId,
};
pub use merge::{DropReason, LogEntry, MergeEngine, MergeError, OperationLog, Outcome, Prepared, replay};
pub use operation::{LogicalTimestamp, MAX_POSITION, OpKind, Operation, SYSTEM_SESSION, TextEdit};
pub use replica::{Replica, ReplicaError};
pub use result::{
    Column, ColumnType, ExecutionResult, ExecutionStatus, ResourceUsage, Value,
};
pub use transform::transform;
