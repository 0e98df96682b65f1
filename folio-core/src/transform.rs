//! Positional transformation of concurrent operations.
//!
//! `transform(a, b)` takes two operations defined on the same state and
//! returns `(a', b')` such that applying `a` then `b'` gives the same state
//! as applying `b` then `a'`. A side becomes `None` when it no longer has
//! any effect (its target cell is gone, or the other side already did the
//! same thing).
//!
//! Text positions, cell indices and comment anchors all move through the
//! same two helpers, [`shift_for_insert`] and [`map_through_delete`].

use crate::document::{Anchor, CellId};
use crate::operation::{OpKind, TextEdit};

/// Position of `pos` after `len` items are inserted at `at`.
///
/// `stays_before` decides the tie when `pos == at`.
pub fn shift_for_insert(pos: usize, at: usize, len: usize, stays_before: bool) -> usize {
    if pos < at || (pos == at && stays_before) {
        pos
    } else {
        pos + len
    }
}

/// Position of `pos` after `len` items are deleted at `at`.
///
/// Positions inside the deleted range collapse onto its start.
pub fn map_through_delete(pos: usize, at: usize, len: usize) -> usize {
    if pos <= at {
        pos
    } else if pos >= at.saturating_add(len) {
        pos - len
    } else {
        at
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

// ───────────────────────────────────────────────────────────────────
// Text edits
// ───────────────────────────────────────────────────────────────────

/// Transform an insertion against a concurrent deletion.
fn insert_vs_delete(pos: usize, text: &str, at: usize, len: usize) -> (TextEdit, Vec<TextEdit>) {
    let ins_len = char_len(text);
    let ins = TextEdit::insert(map_through_delete(pos, at, len), text);
    let del = if pos <= at {
        vec![TextEdit::delete(at + ins_len, len)]
    } else if pos >= at + len {
        vec![TextEdit::delete(at, len)]
    } else {
        // The insertion lands inside the deleted range: delete around it.
        vec![
            TextEdit::delete(at, pos - at),
            TextEdit::delete(at + ins_len, at + len - pos),
        ]
    };
    (ins, del)
}

/// Transform two primitive edits. `a_first` breaks ties between
/// insertions at the same position in favour of `a`.
pub fn transform_edit(a: &TextEdit, b: &TextEdit, a_first: bool) -> (Vec<TextEdit>, Vec<TextEdit>) {
    match (a, b) {
        (TextEdit::Insert { pos: p1, text: t1 }, TextEdit::Insert { pos: p2, text: t2 }) => {
            let a2 = TextEdit::insert(shift_for_insert(*p1, *p2, char_len(t2), a_first), t1.clone());
            let b2 = TextEdit::insert(shift_for_insert(*p2, *p1, char_len(t1), !a_first), t2.clone());
            (vec![a2], vec![b2])
        }
        (TextEdit::Insert { pos, text }, TextEdit::Delete { pos: at, len }) => {
            let (ins, del) = insert_vs_delete(*pos, text, *at, *len);
            (vec![ins], del)
        }
        (TextEdit::Delete { pos: at, len }, TextEdit::Insert { pos, text }) => {
            let (ins, del) = insert_vs_delete(*pos, text, *at, *len);
            (del, vec![ins])
        }
        (TextEdit::Delete { pos: p1, len: n1 }, TextEdit::Delete { pos: p2, len: n2 }) => {
            let overlap = (p1 + n1).min(p2 + n2).saturating_sub(*p1.max(p2));
            let a2 = TextEdit::delete(map_through_delete(*p1, *p2, *n2), n1 - overlap);
            let b2 = TextEdit::delete(map_through_delete(*p2, *p1, *n1), n2 - overlap);
            (keep(a2), keep(b2))
        }
    }
}

fn keep(edit: TextEdit) -> Vec<TextEdit> {
    if edit.is_noop() {
        Vec::new()
    } else {
        vec![edit]
    }
}

/// Transform two sequences of edits, each applied in order.
pub fn transform_edits(a: &[TextEdit], b: &[TextEdit], a_first: bool) -> (Vec<TextEdit>, Vec<TextEdit>) {
    if a.is_empty() || b.is_empty() {
        return (a.to_vec(), b.to_vec());
    }
    if a.len() == 1 && b.len() == 1 {
        return transform_edit(&a[0], &b[0], a_first);
    }
    if a.len() > 1 {
        let (head, b1) = transform_edits(&a[..1], b, a_first);
        let (mut tail, b2) = transform_edits(&a[1..], &b1, a_first);
        let mut out = head;
        out.append(&mut tail);
        (out, b2)
    } else {
        let (a1, head) = transform_edits(a, &b[..1], a_first);
        let (a2, mut tail) = transform_edits(&a1, &b[1..], a_first);
        let mut out = head;
        out.append(&mut tail);
        (a2, out)
    }
}

/// Move a comment anchor through an applied edit.
///
/// Insertions at the anchor start push it right, insertions at its end stay
/// outside it. A deletion covering the whole range leaves a zero-length
/// anchor at the deletion point.
pub fn transform_anchor(anchor: Anchor, edit: &TextEdit) -> Anchor {
    let (start, end) = match edit {
        TextEdit::Insert { pos, text } => {
            let n = char_len(text);
            let start = shift_for_insert(anchor.offset, *pos, n, false);
            let end = shift_for_insert(anchor.end(), *pos, n, true);
            (start, end.max(start))
        }
        TextEdit::Delete { pos, len } => (
            map_through_delete(anchor.offset, *pos, *len),
            map_through_delete(anchor.end(), *pos, *len),
        ),
    };
    Anchor::new(start, end - start)
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// Transform two concurrent operations. `a_first` is true when `a` carries
/// the smaller logical timestamp.
pub fn transform(a: &OpKind, b: &OpKind, a_first: bool) -> (Option<OpKind>, Option<OpKind>) {
    if let OpKind::DeleteCell { cell, index } = b {
        return against_delete(a, *cell, *index, b);
    }
    if let OpKind::DeleteCell { .. } = a {
        let (b2, a2) = transform(b, a, !a_first);
        return (a2, b2);
    }

    match (a, b) {
        (_, _) if a.cell() == b.cell() && a.text_edits().is_some() && b.text_edits().is_some() => {
            let cell = a.cell();
            let ea = a.text_edits().unwrap_or_default();
            let eb = b.text_edits().unwrap_or_default();
            let (ea2, eb2) = transform_edits(&ea, &eb, a_first);
            (OpKind::from_text_edits(cell, ea2), OpKind::from_text_edits(cell, eb2))
        }
        (OpKind::AddComment { cell, comment }, text) | (text, OpKind::AddComment { cell, comment })
            if text.cell() == *cell && text.text_edits().is_some() =>
        {
            let mut moved = comment.clone();
            for edit in text.text_edits().unwrap_or_default() {
                moved.anchor = transform_anchor(moved.anchor, &edit);
            }
            let comment_op = OpKind::AddComment { cell: *cell, comment: moved };
            if matches!(a, OpKind::AddComment { .. }) {
                (Some(comment_op), Some(b.clone()))
            } else {
                (Some(a.clone()), Some(comment_op))
            }
        }
        (OpKind::DeleteComment { comment: c1, .. }, OpKind::DeleteComment { comment: c2, .. }) if c1 == c2 => {
            (None, None)
        }
        (OpKind::SetOutput { cell: c1, .. }, OpKind::SetOutput { cell: c2, .. }) if c1 == c2 => {
            later_wins(a, b, a_first)
        }
        (OpKind::MoveCell { cell: c1, .. }, OpKind::MoveCell { cell: c2, .. }) if c1 == c2 => {
            later_wins(a, b, a_first)
        }
        _ if a.is_structural() && b.is_structural() => structural(a, b, a_first),
        _ => (Some(a.clone()), Some(b.clone())),
    }
}

/// Two writes of the same slot: the larger timestamp wins.
fn later_wins(a: &OpKind, b: &OpKind, a_first: bool) -> (Option<OpKind>, Option<OpKind>) {
    match (a, b, a_first) {
        (
            OpKind::MoveCell { cell, to: ta, .. },
            OpKind::MoveCell { to: tb, .. },
            first,
        ) => {
            // Both destinations are indices in the list without the cell.
            if first {
                (None, Some(OpKind::MoveCell { cell: *cell, from: *ta, to: *tb }))
            } else {
                (Some(OpKind::MoveCell { cell: *cell, from: *tb, to: *ta }), None)
            }
        }
        (_, _, true) => (None, Some(b.clone())),
        (_, _, false) => (Some(a.clone()), None),
    }
}

/// Transform `a` against a concurrent deletion of cell `x` at index `j`.
fn against_delete(a: &OpKind, x: CellId, j: usize, b: &OpKind) -> (Option<OpKind>, Option<OpKind>) {
    match a {
        OpKind::DeleteCell { cell, .. } if *cell == x => (None, None),
        OpKind::DeleteCell { cell, index } => {
            let a2 = OpKind::DeleteCell { cell: *cell, index: if j < *index { index - 1 } else { *index } };
            let b2 = OpKind::DeleteCell { cell: x, index: if *index < j { j - 1 } else { j } };
            (Some(a2), Some(b2))
        }
        OpKind::InsertCell { cell, index, kind, content } => {
            let a2 = OpKind::InsertCell {
                cell: *cell,
                index: if j < *index { index - 1 } else { *index },
                kind: *kind,
                content: content.clone(),
            };
            let b2 = OpKind::DeleteCell { cell: x, index: if *index <= j { j + 1 } else { j } };
            (Some(a2), Some(b2))
        }
        OpKind::MoveCell { cell, to, .. } if *cell == x => {
            (None, Some(OpKind::DeleteCell { cell: x, index: *to }))
        }
        OpKind::MoveCell { cell, from, to } => {
            // Index of x in the list without the moved cell.
            let jj = if j > *from { j - 1 } else { j };
            let a2 = OpKind::MoveCell {
                cell: *cell,
                from: if j < *from { from - 1 } else { *from },
                to: if jj < *to { to - 1 } else { *to },
            };
            let b2 = OpKind::DeleteCell { cell: x, index: shift_for_insert(jj, *to, 1, false) };
            (Some(a2), Some(b2))
        }
        other if other.cell() == x => (None, Some(b.clone())),
        other => (Some(other.clone()), Some(b.clone())),
    }
}

/// Insert/move pairs. A move is a removal followed by an insertion into
/// the list without the moved cell; both sides are mapped into the list
/// without either moved cell and resolved like two concurrent inserts.
fn structural(a: &OpKind, b: &OpKind, a_first: bool) -> (Option<OpKind>, Option<OpKind>) {
    match (a, b) {
        (OpKind::InsertCell { cell, index, kind, content }, OpKind::InsertCell { cell: c2, index: k, kind: k2, content: t2 }) => {
            let a2 = OpKind::InsertCell {
                cell: *cell,
                index: shift_for_insert(*index, *k, 1, a_first),
                kind: *kind,
                content: content.clone(),
            };
            let b2 = OpKind::InsertCell {
                cell: *c2,
                index: shift_for_insert(*k, *index, 1, !a_first),
                kind: *k2,
                content: t2.clone(),
            };
            (Some(a2), Some(b2))
        }
        (OpKind::InsertCell { .. }, OpKind::MoveCell { .. }) => insert_vs_move(a, b, a_first),
        (OpKind::MoveCell { .. }, OpKind::InsertCell { .. }) => {
            let (b2, a2) = insert_vs_move(b, a, !a_first);
            (a2, b2)
        }
        (OpKind::MoveCell { cell: x, from: f1, to: t1 }, OpKind::MoveCell { cell: y, from: f2, to: t2 }) => {
            // Where each cell sits in the list after the other was removed.
            let f2_in_a = if f2 > f1 { f2 - 1 } else { *f2 };
            let f1_in_b = if f1 > f2 { f1 - 1 } else { *f1 };
            // Destinations in the list without both cells.
            let t1_base = if f2_in_a < *t1 { t1 - 1 } else { *t1 };
            let t2_base = if f1_in_b < *t2 { t2 - 1 } else { *t2 };
            let a2 = OpKind::MoveCell {
                cell: *x,
                from: shift_for_insert(f1_in_b, *t2, 1, false),
                to: shift_for_insert(t1_base, t2_base, 1, a_first),
            };
            let b2 = OpKind::MoveCell {
                cell: *y,
                from: shift_for_insert(f2_in_a, *t1, 1, false),
                to: shift_for_insert(t2_base, t1_base, 1, !a_first),
            };
            (Some(a2), Some(b2))
        }
        _ => (Some(a.clone()), Some(b.clone())),
    }
}

fn insert_vs_move(ins: &OpKind, mv: &OpKind, ins_first: bool) -> (Option<OpKind>, Option<OpKind>) {
    let (OpKind::InsertCell { cell, index, kind, content }, OpKind::MoveCell { cell: y, from, to }) = (ins, mv) else {
        return (Some(ins.clone()), Some(mv.clone()));
    };
    // Insertion index in the list without the moved cell.
    let base = if *from < *index { index - 1 } else { *index };
    let ins2 = OpKind::InsertCell {
        cell: *cell,
        index: shift_for_insert(base, *to, 1, ins_first),
        kind: *kind,
        content: content.clone(),
    };
    let mv2 = OpKind::MoveCell {
        cell: *y,
        from: if *index <= *from { from + 1 } else { *from },
        to: shift_for_insert(*to, base, 1, !ins_first),
    };
    (Some(ins2), Some(mv2))
}
