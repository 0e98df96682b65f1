//! Binary wire protocol between notebook clients and the engine.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! [`ClientMessage`] upstream, [`ServerEvent`] downstream. A connection is
//! scoped to one notebook after `Join`; catalog messages (`CreateNotebook`,
//! `ListNotebooks`) work before joining.
//!
//! ```text
//! client                                  server
//!   │── Join{doc, user, token, resume} ──────►│
//!   │◄──────── Joined{session, notebook, v} ──│
//!   │── Edit(op) ────────────────────────────►│ sequence + persist
//!   │◄──────────────── Ack{version, ts} ──────│ (others get Operation)
//!   │── Acknowledge{version} ────────────────►│ trims the unseen list
//! ```

use folio_core::{
    CellId, DocId, ExecutionResult, LogicalTimestamp, Notebook, Operation, SessionId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated user identity handed to the engine by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl UserIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit user id. The color is derived from the id so
    /// it is stable across sessions.
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            user_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Cursor or selection inside a notebook.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    /// Focused cell (None = no cell focused)
    pub cell: Option<CellId>,
    /// Offset in Unicode scalar values
    pub offset: usize,
    /// Selection length (0 = caret)
    pub selection_len: usize,
}

impl CursorPosition {
    pub fn caret(cell: CellId, offset: usize) -> Self {
        Self {
            cell: Some(cell),
            offset,
            selection_len: 0,
        }
    }
}

/// Catalog entry for one notebook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotebookSummary {
    pub id: DocId,
    pub title: String,
    pub owner: String,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Failure category reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidOperation,
    NotFound,
    RejectedQuery,
    ExecutionError,
    Disconnected,
    Storage,
    Overloaded,
    Protocol,
    ResyncRequired,
}

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    CreateNotebook { title: String, user: UserIdentity },
    ListNotebooks,
    /// Join a notebook. `resume` reattaches a previous session id, which is
    /// answered with a resync snapshot instead of a fresh join.
    Join {
        doc_id: DocId,
        user: UserIdentity,
        token: String,
        resume: Option<SessionId>,
    },
    Edit(Operation),
    Cursor(CursorPosition),
    Execute { cell: CellId, query: String },
    /// Everything up to `version` has been incorporated locally
    Acknowledge { version: u64 },
    RequestResync,
    Export,
    Ping,
    Leave,
}

/// Server → client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerEvent {
    Joined {
        session: SessionId,
        notebook: Notebook,
        version: u64,
        /// Last logical counter the server accepted from this session
        last_counter: u64,
    },
    /// A transformed operation sequenced as `version`
    Operation { version: u64, op: Operation },
    /// Direct acknowledgment of the recipient's own operation
    Ack { version: u64, timestamp: LogicalTimestamp },
    /// The recipient's operation targeted a deleted cell and was dropped
    CellRemoved { timestamp: LogicalTimestamp, cell: CellId },
    /// The recipient's operation had already been produced concurrently
    Absorbed { timestamp: LogicalTimestamp },
    Presence {
        session: SessionId,
        user: UserIdentity,
        cursor: CursorPosition,
    },
    ExecutionQueued { request: Uuid, cell: CellId },
    /// A query result written into the notebook as `version`
    ExecutionResult { version: u64, result: ExecutionResult },
    ResyncSnapshot { notebook: Notebook, version: u64 },
    SessionJoined { session: SessionId, user: UserIdentity },
    SessionLeft { session: SessionId },
    Participants { count: usize },
    NotebookCreated { id: DocId },
    Notebooks(Vec<NotebookSummary>),
    Exported { notebook: Notebook },
    Error { kind: ErrorKind, message: String },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            kind,
            message: message.into(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::Operation { .. } => "operation",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::CellRemoved { .. } => "cell_removed",
            ServerEvent::Absorbed { .. } => "absorbed",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::ExecutionQueued { .. } => "execution_queued",
            ServerEvent::ExecutionResult { .. } => "execution_result",
            ServerEvent::ResyncSnapshot { .. } => "resync_snapshot",
            ServerEvent::SessionJoined { .. } => "session_joined",
            ServerEvent::SessionLeft { .. } => "session_left",
            ServerEvent::Participants { .. } => "participants",
            ServerEvent::NotebookCreated { .. } => "notebook_created",
            ServerEvent::Notebooks(_) => "notebooks",
            ServerEvent::Exported { .. } => "exported",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong => "pong",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Text frame or other non-binary payload
    InvalidMessageType,
    /// Document-scoped message sent before `Join`
    NotJoined,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::NotJoined => write!(f, "Join a notebook first"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{CellKind, OpKind};

    #[test]
    fn test_edit_message_roundtrip() {
        let doc = Uuid::new_v4();
        let op = Operation::new(doc, Uuid::new_v4(), 3, 2, OpKind::InsertCell {
            cell: Uuid::new_v4(),
            index: 0,
            kind: CellKind::Code,
            content: "SELECT 1".into(),
        });
        let msg = ClientMessage::Edit(op.clone());
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, ClientMessage::Edit(op));
    }

    #[test]
    fn test_joined_event_carries_snapshot() {
        let notebook = Notebook::new(Uuid::new_v4(), "Sales review");
        let event = ServerEvent::Joined {
            session: Uuid::new_v4(),
            notebook: notebook.clone(),
            version: 0,
            last_counter: 0,
        };
        match ServerEvent::decode(&event.encode().unwrap()).unwrap() {
            ServerEvent::Joined { notebook: nb, .. } => assert_eq!(nb, notebook),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_edit_frame_is_compact() {
        let doc = Uuid::new_v4();
        let op = Operation::new(doc, Uuid::new_v4(), 1, 0, OpKind::InsertText {
            cell: Uuid::new_v4(),
            pos: 4,
            text: "x".into(),
        });
        let encoded = ClientMessage::Edit(op).encode().unwrap();
        // Four uuids (doc, session, timestamp session, cell) plus varints
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_user_identity_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(UserIdentity::with_id(id, "a").color, UserIdentity::with_id(id, "b").color);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerEvent::decode(&garbage).is_err());
        assert!(ClientMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_error_event() {
        let event = ServerEvent::error(ErrorKind::NotFound, "no such notebook");
        assert_eq!(event.name(), "error");
        let decoded = ServerEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
