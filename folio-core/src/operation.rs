//! Edit operations and logical timestamps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::document::{Anchor, ApplyError, CellId, CellKind, Comment, CommentId, DocId, SessionId};
use crate::result::ExecutionResult;

/// Session id used for operations the engine issues itself (result write-back).
pub const SYSTEM_SESSION: SessionId = Uuid::nil();

/// Largest char position, length or cell index an operation may carry.
///
/// Transforms add lengths to positions; keeping every input far below
/// `usize::MAX` means those sums cannot wrap.
pub const MAX_POSITION: usize = 1 << 30;

/// Per-session counter plus session id.
///
/// Ordered by counter first and session id second, which gives the
/// tie-break between concurrent operations at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub counter: u64,
    pub session: SessionId,
}

impl LogicalTimestamp {
    pub fn new(counter: u64, session: SessionId) -> Self {
        Self { counter, session }
    }
}

impl Ord for LogicalTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.session.cmp(&other.session))
    }
}

impl PartialOrd for LogicalTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Primitive positional edit on a cell's text. Positions count chars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEdit {
    Insert { pos: usize, text: String },
    Delete { pos: usize, len: usize },
}

impl TextEdit {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        TextEdit::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        TextEdit::Delete { pos, len }
    }

    /// Edits that change nothing (empty insert, zero-length delete).
    pub fn is_noop(&self) -> bool {
        match self {
            TextEdit::Insert { text, .. } => text.is_empty(),
            TextEdit::Delete { len, .. } => *len == 0,
        }
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    InsertText { cell: CellId, pos: usize, text: String },
    DeleteText { cell: CellId, pos: usize, len: usize },
    /// Several text edits applied in sequence. Produced when a delete is
    /// split around a concurrent insertion.
    EditText { cell: CellId, edits: Vec<TextEdit> },
    InsertCell { cell: CellId, index: usize, kind: CellKind, content: String },
    /// `index` is the position the sender saw; the cell is removed by id.
    DeleteCell { cell: CellId, index: usize },
    /// Remove the cell at `from` and reinsert it at `to` (index in the
    /// list after removal).
    MoveCell { cell: CellId, from: usize, to: usize },
    AddComment { cell: CellId, comment: Comment },
    DeleteComment { cell: CellId, comment: CommentId },
    /// Execution result written back by the engine.
    SetOutput { cell: CellId, result: ExecutionResult },
}

impl OpKind {
    /// The cell this operation targets.
    pub fn cell(&self) -> CellId {
        match self {
            OpKind::InsertText { cell, .. }
            | OpKind::DeleteText { cell, .. }
            | OpKind::EditText { cell, .. }
            | OpKind::InsertCell { cell, .. }
            | OpKind::DeleteCell { cell, .. }
            | OpKind::MoveCell { cell, .. }
            | OpKind::AddComment { cell, .. }
            | OpKind::DeleteComment { cell, .. }
            | OpKind::SetOutput { cell, .. } => *cell,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::InsertText { .. } => "insert-text",
            OpKind::DeleteText { .. } => "delete-text",
            OpKind::EditText { .. } => "edit-text",
            OpKind::InsertCell { .. } => "insert-cell",
            OpKind::DeleteCell { .. } => "delete-cell",
            OpKind::MoveCell { .. } => "move-cell",
            OpKind::AddComment { .. } => "add-comment",
            OpKind::DeleteComment { .. } => "delete-comment",
            OpKind::SetOutput { .. } => "set-output",
        }
    }

    /// Operations that change the cell list rather than a cell.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OpKind::InsertCell { .. } | OpKind::DeleteCell { .. } | OpKind::MoveCell { .. }
        )
    }

    /// Text edits carried by this operation, if it is a text operation.
    pub fn text_edits(&self) -> Option<Vec<TextEdit>> {
        match self {
            OpKind::InsertText { pos, text, .. } => Some(vec![TextEdit::insert(*pos, text.clone())]),
            OpKind::DeleteText { pos, len, .. } => Some(vec![TextEdit::delete(*pos, *len)]),
            OpKind::EditText { edits, .. } => Some(edits.clone()),
            _ => None,
        }
    }

    /// Reject positions, lengths and indices no document could have.
    ///
    /// Runs before any transform so that untrusted input never reaches the
    /// position arithmetic.
    pub fn check_bounds(&self) -> Result<(), ApplyError> {
        let edits = self.text_edits().unwrap_or_default();
        for edit in &edits {
            let (pos, len) = match edit {
                TextEdit::Insert { pos, text } => (*pos, text.chars().count()),
                TextEdit::Delete { pos, len } => (*pos, *len),
            };
            if pos > MAX_POSITION || len > MAX_POSITION {
                return Err(ApplyError::PositionOutOfRange { pos, len: MAX_POSITION });
            }
        }
        let index = match self {
            OpKind::InsertCell { index, .. } | OpKind::DeleteCell { index, .. } => *index,
            OpKind::MoveCell { from, to, .. } => (*from).max(*to),
            OpKind::AddComment { comment, .. } => {
                let Anchor { offset, len } = comment.anchor;
                if offset > MAX_POSITION || len > MAX_POSITION {
                    return Err(ApplyError::AnchorOutOfRange { offset, len });
                }
                0
            }
            _ => 0,
        };
        if index > MAX_POSITION {
            return Err(ApplyError::IndexOutOfRange { index, len: MAX_POSITION });
        }
        Ok(())
    }

    /// Rebuild a text operation from edits, dropping no-ops.
    ///
    /// Returns `None` when nothing is left to apply.
    pub fn from_text_edits(cell: CellId, edits: Vec<TextEdit>) -> Option<OpKind> {
        let mut edits: Vec<TextEdit> = edits.into_iter().filter(|e| !e.is_noop()).collect();
        match edits.len() {
            0 => None,
            1 => match edits.pop() {
                Some(TextEdit::Insert { pos, text }) => Some(OpKind::InsertText { cell, pos, text }),
                Some(TextEdit::Delete { pos, len }) => Some(OpKind::DeleteText { cell, pos, len }),
                None => None,
            },
            _ => Some(OpKind::EditText { cell, edits }),
        }
    }
}

/// An edit submitted by a session, or its transformed form in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub doc_id: DocId,
    pub session: SessionId,
    pub timestamp: LogicalTimestamp,
    /// Last document version the session had incorporated when it created
    /// this operation.
    pub seen_version: u64,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(doc_id: DocId, session: SessionId, counter: u64, seen_version: u64, kind: OpKind) -> Self {
        Self {
            doc_id,
            session,
            timestamp: LogicalTimestamp::new(counter, session),
            seen_version,
            kind,
        }
    }

    /// Copy of this operation carrying a different kind.
    pub fn with_kind(&self, kind: OpKind) -> Operation {
        Operation {
            doc_id: self.doc_id,
            session: self.session,
            timestamp: self.timestamp,
            seen_version: self.seen_version,
            kind,
        }
    }

    pub fn cell(&self) -> CellId {
        self.kind.cell()
    }

    pub fn is_system(&self) -> bool {
        self.session == SYSTEM_SESSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_order_counter_first() {
        let a = Uuid::from_u128(2);
        let b = Uuid::from_u128(1);
        assert!(LogicalTimestamp::new(1, a) < LogicalTimestamp::new(2, b));
        assert!(LogicalTimestamp::new(3, b) < LogicalTimestamp::new(3, a));
    }

    #[test]
    fn test_from_text_edits_collapses() {
        let cell = Uuid::new_v4();
        let single = OpKind::from_text_edits(cell, vec![TextEdit::insert(2, "x"), TextEdit::delete(0, 0)]);
        assert_eq!(single, Some(OpKind::InsertText { cell, pos: 2, text: "x".into() }));

        let none = OpKind::from_text_edits(cell, vec![TextEdit::delete(4, 0)]);
        assert!(none.is_none());

        let many = OpKind::from_text_edits(cell, vec![TextEdit::delete(0, 1), TextEdit::delete(3, 2)]);
        assert!(matches!(many, Some(OpKind::EditText { ref edits, .. }) if edits.len() == 2));
    }

    #[test]
    fn test_with_kind_keeps_original() {
        let cell = Uuid::new_v4();
        let op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), 1, 0, OpKind::DeleteText { cell, pos: 0, len: 3 });
        let derived = op.with_kind(OpKind::DeleteText { cell, pos: 1, len: 3 });
        assert_eq!(op.kind, OpKind::DeleteText { cell, pos: 0, len: 3 });
        assert_eq!(derived.timestamp, op.timestamp);
    }
}
