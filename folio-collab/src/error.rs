use folio_core::{ApplyError, MergeError, SessionId};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ErrorKind, ProtocolError};
use crate::scheduler::SchedulerError;
use crate::storage::StoreError;

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("storage failure: {0}")]
    Store(StoreError),

    #[error("notebook {0} not found")]
    DocumentNotFound(Uuid),

    #[error("cell {cell} not found in notebook {doc_id}")]
    CellNotFound { doc_id: Uuid, cell: Uuid },

    #[error("session {0} is not connected")]
    UnknownSession(SessionId),

    #[error("session {0} is already connected")]
    SessionActive(SessionId),

    #[error("notebook {doc_id} already has {max} sessions")]
    SessionLimit { doc_id: Uuid, max: usize },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl EngineError {
    /// Wire category for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Merge(MergeError::ResyncRequired(_)) => ErrorKind::ResyncRequired,
            EngineError::Merge(MergeError::UnknownSession(_)) => ErrorKind::Disconnected,
            EngineError::Merge(_) => ErrorKind::InvalidOperation,
            EngineError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            EngineError::Store(_) => ErrorKind::Storage,
            EngineError::DocumentNotFound(_) | EngineError::CellNotFound { .. } => ErrorKind::NotFound,
            EngineError::UnknownSession(_) => ErrorKind::Disconnected,
            EngineError::SessionActive(_) => ErrorKind::InvalidOperation,
            EngineError::SessionLimit { .. } => ErrorKind::Overloaded,
            EngineError::Scheduler(SchedulerError::Overloaded { .. }) => ErrorKind::Overloaded,
            EngineError::Scheduler(SchedulerError::ShuttingDown) => ErrorKind::ExecutionError,
            EngineError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the client must discard local state and resync.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidOperation | ErrorKind::ResyncRequired | ErrorKind::Storage
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::DocumentNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<ApplyError> for EngineError {
    fn from(e: ApplyError) -> Self {
        EngineError::Merge(MergeError::Apply(e))
    }
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(EngineError::DocumentNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::from(StoreError::NotFound(id)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            EngineError::from(StoreError::DatabaseError("io".into())).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            EngineError::from(MergeError::InvalidOperation("bad".into())).kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            EngineError::from(MergeError::ResyncRequired(id)).kind(),
            ErrorKind::ResyncRequired
        );
        assert_eq!(
            EngineError::from(SchedulerError::Overloaded { doc_id: id, pending: 4 }).kind(),
            ErrorKind::Overloaded
        );
    }

    #[test]
    fn test_requires_resync() {
        let id = Uuid::new_v4();
        assert!(EngineError::from(ApplyError::EmptyEdit).requires_resync());
        assert!(EngineError::Store(StoreError::DatabaseError("disk full".into())).requires_resync());
        assert!(!EngineError::DocumentNotFound(id).requires_resync());
    }
}
