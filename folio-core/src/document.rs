//! Notebook document model.
//!
//! A notebook is an ordered list of cells. Each cell holds text, an optional
//! execution result and a comment thread anchored into its text. The model
//! only changes through [`Notebook::apply`], which validates first and
//! mutates second, so a rejected operation leaves the notebook untouched.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::operation::{OpKind, TextEdit};
use crate::result::ExecutionResult;
use crate::transform;

pub type DocId = Uuid;
pub type CellId = Uuid;
pub type CommentId = Uuid;
pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    Code,
    Markdown,
    Visualization,
}

/// Character range a comment is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub offset: usize,
    pub len: usize,
}

impl Anchor {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// One past the last anchored char. Saturates instead of wrapping.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    pub anchor: Anchor,
}

impl Comment {
    /// New comment with a time-ordered id, so a cell's thread sorts by
    /// creation time.
    pub fn new(author: impl Into<String>, body: impl Into<String>, anchor: Anchor) -> Self {
        Self {
            id: Uuid::now_v7(),
            author: author.into(),
            body: body.into(),
            anchor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub content: String,
    /// Number of text operations applied to this cell.
    pub clock: u64,
    pub output: Option<ExecutionResult>,
    /// Kept sorted by comment id whatever order they arrive in.
    pub comments: Vec<Comment>,
}

impl Cell {
    pub fn new(id: CellId, kind: CellKind, content: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            content: content.into(),
            clock: 0,
            output: None,
            comments: Vec::new(),
        }
    }

    /// Length of the content in chars.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn comment(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == *id)
    }

    fn check_edits(&self, edits: &[TextEdit]) -> Result<(), ApplyError> {
        let mut len = self.char_len();
        for edit in edits {
            match edit {
                TextEdit::Insert { pos, text } => {
                    if text.is_empty() {
                        return Err(ApplyError::EmptyEdit);
                    }
                    if *pos > len {
                        return Err(ApplyError::PositionOutOfRange { pos: *pos, len });
                    }
                    len += text.chars().count();
                }
                TextEdit::Delete { pos, len: n } => {
                    if *n == 0 {
                        return Err(ApplyError::EmptyEdit);
                    }
                    match pos.checked_add(*n) {
                        Some(end) if end <= len => {}
                        _ => return Err(ApplyError::PositionOutOfRange { pos: *pos, len }),
                    }
                    len -= n;
                }
            }
        }
        Ok(())
    }

    fn apply_edit(&mut self, edit: &TextEdit) {
        match edit {
            TextEdit::Insert { pos, text } => {
                let at = byte_offset(&self.content, *pos);
                self.content.insert_str(at, text);
            }
            TextEdit::Delete { pos, len } => {
                let start = byte_offset(&self.content, *pos);
                let end = byte_offset(&self.content, pos + len);
                self.content.replace_range(start..end, "");
            }
        }
        for comment in &mut self.comments {
            comment.anchor = transform::transform_anchor(comment.anchor, edit);
        }
    }
}

/// Byte offset of the char at `pos`, or the end of the string.
fn byte_offset(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map_or(s.len(), |(i, _)| i)
}

/// Reasons an operation cannot be applied to the current notebook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("cell {0} does not exist")]
    UnknownCell(CellId),
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),
    #[error("cell index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("text position {pos} out of range (len {len})")]
    PositionOutOfRange { pos: usize, len: usize },
    #[error("edit changes nothing")]
    EmptyEdit,
    #[error("comment {0} does not exist")]
    UnknownComment(CommentId),
    #[error("comment {0} already exists")]
    DuplicateComment(CommentId),
    #[error("comment anchor {offset}+{len} outside cell text")]
    AnchorOutOfRange { offset: usize, len: usize },
}

/// The shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: DocId,
    pub title: String,
    /// Number of operations applied since creation.
    pub version: u64,
    pub cells: Vec<Cell>,
}

impl Notebook {
    pub fn new(id: DocId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            version: 0,
            cells: Vec::new(),
        }
    }

    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == *id)
    }

    pub fn cell_index(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| c.id == *id)
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.iter().map(|c| c.id).collect()
    }

    fn existing(&self, id: &CellId) -> Result<&Cell, ApplyError> {
        self.cell(id).ok_or(ApplyError::UnknownCell(*id))
    }

    /// Validate an operation against the current state without applying it.
    pub fn check(&self, kind: &OpKind) -> Result<(), ApplyError> {
        match kind {
            OpKind::InsertText { .. } | OpKind::DeleteText { .. } | OpKind::EditText { .. } => {
                let cell = self.existing(&kind.cell())?;
                let edits = kind.text_edits().unwrap_or_default();
                if edits.is_empty() {
                    return Err(ApplyError::EmptyEdit);
                }
                cell.check_edits(&edits)
            }
            OpKind::InsertCell { cell, index, .. } => {
                if self.cell(cell).is_some() {
                    return Err(ApplyError::DuplicateCell(*cell));
                }
                if *index > self.cells.len() {
                    return Err(ApplyError::IndexOutOfRange { index: *index, len: self.cells.len() });
                }
                Ok(())
            }
            OpKind::DeleteCell { cell, .. } => self.existing(cell).map(|_| ()),
            OpKind::MoveCell { cell, to, .. } => {
                self.existing(cell)?;
                if *to >= self.cells.len() {
                    return Err(ApplyError::IndexOutOfRange { index: *to, len: self.cells.len() });
                }
                Ok(())
            }
            OpKind::AddComment { cell, comment } => {
                let target = self.existing(cell)?;
                if target.comment(&comment.id).is_some() {
                    return Err(ApplyError::DuplicateComment(comment.id));
                }
                let fits = comment
                    .anchor
                    .offset
                    .checked_add(comment.anchor.len)
                    .is_some_and(|end| end <= target.char_len());
                if !fits {
                    return Err(ApplyError::AnchorOutOfRange {
                        offset: comment.anchor.offset,
                        len: comment.anchor.len,
                    });
                }
                Ok(())
            }
            OpKind::DeleteComment { cell, comment } => {
                let target = self.existing(cell)?;
                target
                    .comment(comment)
                    .map(|_| ())
                    .ok_or(ApplyError::UnknownComment(*comment))
            }
            OpKind::SetOutput { cell, .. } => self.existing(cell).map(|_| ()),
        }
    }

    /// Apply an operation. The version counter is left alone; see
    /// [`Notebook::apply_sequenced`].
    pub fn apply(&mut self, kind: &OpKind) -> Result<(), ApplyError> {
        self.check(kind)?;
        match kind {
            OpKind::InsertText { .. } | OpKind::DeleteText { .. } | OpKind::EditText { .. } => {
                let edits = kind.text_edits().unwrap_or_default();
                let cell = self.cell_mut(&kind.cell())?;
                for edit in &edits {
                    cell.apply_edit(edit);
                }
                cell.clock += 1;
            }
            OpKind::InsertCell { cell, index, kind, content } => {
                self.cells.insert(*index, Cell::new(*cell, *kind, content.clone()));
            }
            OpKind::DeleteCell { cell, .. } => {
                self.cells.retain(|c| c.id != *cell);
            }
            OpKind::MoveCell { cell, to, .. } => {
                let from = self.cell_index(cell).ok_or(ApplyError::UnknownCell(*cell))?;
                let moved = self.cells.remove(from);
                let to = (*to).min(self.cells.len());
                self.cells.insert(to, moved);
            }
            OpKind::AddComment { cell, comment } => {
                let comments = &mut self.cell_mut(cell)?.comments;
                let at = comments.partition_point(|c| c.id < comment.id);
                comments.insert(at, comment.clone());
            }
            OpKind::DeleteComment { cell, comment } => {
                self.cell_mut(cell)?.comments.retain(|c| c.id != *comment);
            }
            OpKind::SetOutput { cell, result } => {
                self.cell_mut(cell)?.output = Some(result.clone());
            }
        }
        Ok(())
    }

    /// Apply an operation as the next entry of the document log.
    pub fn apply_sequenced(&mut self, kind: &OpKind) -> Result<u64, ApplyError> {
        self.apply(kind)?;
        self.version += 1;
        Ok(self.version)
    }

    fn cell_mut(&mut self, id: &CellId) -> Result<&mut Cell, ApplyError> {
        self.cells
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or(ApplyError::UnknownCell(*id))
    }

    /// Pretty JSON rendering for hand-off to publishing.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
