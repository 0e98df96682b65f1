//! Operation log and merge engine for one notebook.
//!
//! The engine is the sequencer's state: it owns the authoritative notebook,
//! the operation log, and per-session bookkeeping. It is synchronous and
//! single-owner; callers serialize access per document.
//!
//! ## Concurrency model
//!
//! ```text
//!   session A sends op (seen_version = 4)
//!        │
//!        ▼
//!   unseen[A] = [ v5 (B), v6 (C) ]      ops A had not incorporated
//!        │
//!        ▼  transform(op, v5') → transform(op', v6')
//!   op'' applied as v7, unseen entries rewritten against op
//!        │
//!        ▼
//!   unseen[B] += v7, unseen[C] += v7
//! ```
//!
//! Each session's unseen list holds the operations sequenced by others that
//! the session had not observed, expressed in that session's context. The
//! session trims it by acknowledging versions. Because the list is rewritten
//! against every incoming operation, a session may have several operations
//! in flight at once.
//!
//! Applying is split in two: [`MergeEngine::prepare`] computes the outcome
//! without touching state, and [`MergeEngine::commit`] installs it. The
//! caller persists the prepared operation in between.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::document::{ApplyError, CellId, Notebook, SessionId};
use crate::operation::{LogicalTimestamp, OpKind, Operation};
use crate::transform::transform;

/// Default bound on a session's unseen list before it must resync.
pub const DEFAULT_MAX_UNSEEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("operation cannot be applied: {0}")]
    Apply(#[from] ApplyError),
    #[error("session {0} is not registered with this document")]
    UnknownSession(SessionId),
    #[error("session {0} fell too far behind and must resync")]
    ResyncRequired(SessionId),
}

/// One sequenced operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub version: u64,
    pub op: Operation,
}

/// Append-only log of sequenced operations, trimmed by compaction.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    /// Versions at or below this were folded into a snapshot.
    compacted_through: u64,
}

impl OperationLog {
    pub fn push(&mut self, version: u64, op: Operation) {
        self.entries.push(LogEntry { version, op });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries with a version strictly greater than `version`.
    pub fn since(&self, version: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.version > version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compacted_through(&self) -> u64 {
        self.compacted_through
    }

    /// Drop entries up to and including `version`. Returns how many went.
    pub fn compact_through(&mut self, version: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.version > version);
        self.compacted_through = self.compacted_through.max(version);
        before - self.entries.len()
    }
}

#[derive(Debug, Clone)]
struct UnseenEntry {
    version: u64,
    timestamp: LogicalTimestamp,
    kind: OpKind,
}

#[derive(Debug, Clone)]
struct SessionTrack {
    /// Version at which the session received its snapshot.
    joined_at: u64,
    seen_version: u64,
    last_counter: u64,
    unseen: VecDeque<UnseenEntry>,
    overflowed: bool,
}

impl SessionTrack {
    fn new(version: u64, last_counter: u64) -> Self {
        Self {
            joined_at: version,
            seen_version: version,
            last_counter,
            unseen: VecDeque::new(),
            overflowed: false,
        }
    }

    fn trim(&mut self, version: u64) {
        while self.unseen.front().is_some_and(|e| e.version <= version) {
            self.unseen.pop_front();
        }
    }
}

/// Why an operation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// A concurrent delete-cell removed the target.
    CellRemoved,
    /// A concurrent operation already had the same effect or won the slot.
    Absorbed,
}

/// Result of sequencing an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Applied as `version`; `op` is the transformed form to broadcast.
    Applied { version: u64, op: Operation, lagging: Vec<SessionId> },
    /// Not applied. Only the originating session needs to hear about it.
    Dropped { session: SessionId, timestamp: LogicalTimestamp, cell: CellId, reason: DropReason },
}

/// Computed but not yet installed outcome.
#[derive(Debug, Clone)]
pub struct Prepared {
    session: SessionId,
    counter: u64,
    seen_version: u64,
    unseen: Option<VecDeque<UnseenEntry>>,
    action: PreparedAction,
}

#[derive(Debug, Clone)]
enum PreparedAction {
    Apply { version: u64, op: Operation },
    Drop { timestamp: LogicalTimestamp, cell: CellId, reason: DropReason },
}

impl Prepared {
    /// The operation to persist before commit, if anything will be applied.
    pub fn to_apply(&self) -> Option<(u64, &Operation)> {
        match &self.action {
            PreparedAction::Apply { version, op } => Some((*version, op)),
            PreparedAction::Drop { .. } => None,
        }
    }
}

/// Sequencer state for one notebook.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    notebook: Notebook,
    log: OperationLog,
    sessions: FxHashMap<SessionId, SessionTrack>,
    /// Cells removed by a delete-cell; later operations on them are dropped.
    removed: FxHashSet<CellId>,
    /// Highest counter seen per session, kept across reconnects.
    counters: FxHashMap<SessionId, u64>,
    max_unseen: usize,
}

impl MergeEngine {
    pub fn new(notebook: Notebook) -> Self {
        let log = OperationLog {
            entries: Vec::new(),
            compacted_through: notebook.version,
        };
        Self {
            notebook,
            log,
            sessions: FxHashMap::default(),
            removed: FxHashSet::default(),
            counters: FxHashMap::default(),
            max_unseen: DEFAULT_MAX_UNSEEN,
        }
    }

    pub fn with_max_unseen(mut self, max_unseen: usize) -> Self {
        self.max_unseen = max_unseen.max(1);
        self
    }

    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    pub fn version(&self) -> u64 {
        self.notebook.version
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Highest timestamp counter accepted from `session`, 0 if none.
    pub fn last_counter(&self, session: &SessionId) -> u64 {
        self.counters.get(session).copied().unwrap_or(0)
    }

    pub fn is_removed(&self, cell: &CellId) -> bool {
        self.removed.contains(cell)
    }

    /// Every cell removed so far, sorted.
    pub fn removed_cells(&self) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self.removed.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Restore cells removed before the snapshot this engine starts from.
    pub fn with_removed(mut self, cells: impl IntoIterator<Item = CellId>) -> Self {
        self.removed.extend(cells);
        self
    }

    /// Register a session at the current version; returns its snapshot.
    pub fn register_session(&mut self, session: SessionId) -> Notebook {
        let last = self.counters.get(&session).copied().unwrap_or(0);
        self.sessions.insert(session, SessionTrack::new(self.notebook.version, last));
        log::debug!("Session {session} registered at v{}", self.notebook.version);
        self.notebook.clone()
    }

    pub fn unregister_session(&mut self, session: &SessionId) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Reset a session to the current snapshot, discarding its unseen list.
    pub fn resync(&mut self, session: SessionId) -> Notebook {
        self.register_session(session)
    }

    /// Record that `session` has incorporated everything up to `version`.
    pub fn acknowledge(&mut self, session: &SessionId, version: u64) -> Result<(), MergeError> {
        let current = self.notebook.version;
        let track = self
            .sessions
            .get_mut(session)
            .ok_or(MergeError::UnknownSession(*session))?;
        if version > current {
            return Err(MergeError::InvalidOperation(format!(
                "acknowledged v{version} beyond current v{current}"
            )));
        }
        if version > track.seen_version {
            track.seen_version = version;
            track.trim(version);
        }
        Ok(())
    }

    /// Compute the outcome of `op` without changing any state.
    pub fn prepare(&self, op: &Operation) -> Result<Prepared, MergeError> {
        if op.doc_id != self.notebook.id {
            return Err(MergeError::InvalidOperation(format!(
                "operation for document {} sent to {}",
                op.doc_id, self.notebook.id
            )));
        }
        if op.timestamp.session != op.session {
            return Err(MergeError::InvalidOperation("timestamp session does not match origin".into()));
        }
        op.kind.check_bounds()?;

        let current = self.notebook.version;
        let (mut kind, unseen, seen_version) = if op.is_system() {
            // Engine-issued operations are always built against the head.
            (Some(op.kind.clone()), None, current)
        } else {
            let track = self
                .sessions
                .get(&op.session)
                .ok_or(MergeError::UnknownSession(op.session))?;
            if track.overflowed {
                return Err(MergeError::ResyncRequired(op.session));
            }
            if op.timestamp.counter <= track.last_counter {
                return Err(MergeError::InvalidOperation(format!(
                    "timestamp counter {} is not after {}",
                    op.timestamp.counter, track.last_counter
                )));
            }
            if op.seen_version > current || op.seen_version < track.joined_at {
                return Err(MergeError::InvalidOperation(format!(
                    "seen version {} outside [{}, {current}]",
                    op.seen_version, track.joined_at
                )));
            }

            let seen_version = op.seen_version.max(track.seen_version);
            let mut unseen = track.unseen.clone();
            while unseen.front().is_some_and(|e| e.version <= seen_version) {
                unseen.pop_front();
            }

            let mut kind = Some(op.kind.clone());
            let mut rewritten = VecDeque::with_capacity(unseen.len());
            for entry in unseen {
                match kind.take() {
                    Some(k) => {
                        let a_first = op.timestamp < entry.timestamp;
                        let (k2, e2) = transform(&k, &entry.kind, a_first);
                        kind = k2;
                        if let Some(e2) = e2 {
                            rewritten.push_back(UnseenEntry { kind: e2, ..entry });
                        }
                    }
                    None => rewritten.push_back(entry),
                }
            }
            (kind, Some(rewritten), seen_version)
        };

        let target = op.kind.cell();
        if let Some(k) = &kind {
            let inserts = matches!(k, OpKind::InsertCell { .. });
            if !inserts && self.removed.contains(&k.cell()) {
                kind = None;
            }
        }

        let action = match kind {
            None => {
                let reason = if self.notebook.cell(&target).is_none() {
                    DropReason::CellRemoved
                } else {
                    DropReason::Absorbed
                };
                PreparedAction::Drop { timestamp: op.timestamp, cell: target, reason }
            }
            Some(k) => {
                if let OpKind::InsertCell { cell, .. } = &k {
                    if self.removed.contains(cell) {
                        return Err(ApplyError::DuplicateCell(*cell).into());
                    }
                }
                self.notebook.check(&k)?;
                PreparedAction::Apply { version: current + 1, op: op.with_kind(k) }
            }
        };

        Ok(Prepared {
            session: op.session,
            counter: op.timestamp.counter,
            seen_version,
            unseen,
            action,
        })
    }

    /// Install a prepared outcome.
    ///
    /// Must be called with the result of the most recent `prepare` and no
    /// other mutation in between.
    pub fn commit(&mut self, prepared: Prepared) -> Result<Outcome, MergeError> {
        let Prepared { session, counter, seen_version, unseen, action } = prepared;

        let outcome = match action {
            PreparedAction::Drop { timestamp, cell, reason } => {
                log::debug!("Dropping op {timestamp:?} on cell {cell}: {reason:?}");
                Outcome::Dropped { session, timestamp, cell, reason }
            }
            PreparedAction::Apply { version, op } => {
                if version != self.notebook.version + 1 {
                    return Err(MergeError::InvalidOperation(format!(
                        "stale prepare for v{version} at v{}",
                        self.notebook.version
                    )));
                }
                self.notebook.apply_sequenced(&op.kind)?;
                if let OpKind::DeleteCell { cell, .. } = &op.kind {
                    self.removed.insert(*cell);
                }

                let mut lagging = Vec::new();
                for (id, track) in self.sessions.iter_mut() {
                    if *id == session || track.overflowed {
                        continue;
                    }
                    track.unseen.push_back(UnseenEntry {
                        version,
                        timestamp: op.timestamp,
                        kind: op.kind.clone(),
                    });
                    if track.unseen.len() > self.max_unseen {
                        track.overflowed = true;
                        track.unseen.clear();
                        lagging.push(*id);
                    }
                }
                lagging.sort();

                self.log.push(version, op.clone());
                Outcome::Applied { version, op, lagging }
            }
        };

        if session != crate::operation::SYSTEM_SESSION {
            let last = self.counters.entry(session).or_insert(0);
            *last = (*last).max(counter);
            if let Some(track) = self.sessions.get_mut(&session) {
                track.last_counter = track.last_counter.max(counter);
                track.seen_version = track.seen_version.max(seen_version);
                if let Some(unseen) = unseen {
                    track.unseen = unseen;
                }
            }
        }
        Ok(outcome)
    }

    /// Prepare and commit in one step.
    pub fn apply(&mut self, op: &Operation) -> Result<Outcome, MergeError> {
        let prepared = self.prepare(op)?;
        self.commit(prepared)
    }

    /// Re-apply an already sequenced operation during recovery.
    pub fn replay_entry(&mut self, version: u64, op: Operation) -> Result<(), MergeError> {
        if version != self.notebook.version + 1 {
            return Err(MergeError::InvalidOperation(format!(
                "replayed v{version} does not follow v{}",
                self.notebook.version
            )));
        }
        self.notebook.apply_sequenced(&op.kind)?;
        if let OpKind::DeleteCell { cell, .. } = &op.kind {
            self.removed.insert(*cell);
        }
        let last = self.counters.entry(op.session).or_insert(0);
        *last = (*last).max(op.timestamp.counter);
        self.log.push(version, op);
        Ok(())
    }

    /// Forget log entries folded into a snapshot at `version`.
    pub fn compact_through(&mut self, version: u64) -> usize {
        self.log.compact_through(version)
    }
}

/// Rebuild a notebook by applying sequenced operations in order.
pub fn replay<'a>(
    base: Notebook,
    ops: impl IntoIterator<Item = &'a Operation>,
) -> Result<Notebook, ApplyError> {
    let mut notebook = base;
    for op in ops {
        notebook.apply_sequenced(&op.kind)?;
    }
    Ok(notebook)
}
