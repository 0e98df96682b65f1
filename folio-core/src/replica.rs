//! Client-side replica of a notebook.
//!
//! A replica applies local edits immediately and keeps them pending until
//! the server acknowledges them. Remote operations arrive in the server's
//! order and are transformed past the pending queue before being applied,
//! mirroring what the server does with the session's unseen list.

use std::collections::VecDeque;
use thiserror::Error;

use crate::document::{ApplyError, DocId, Notebook, SessionId};
use crate::operation::{LogicalTimestamp, OpKind, Operation};
use crate::transform::transform;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("local edit rejected: {0}")]
    Rejected(#[from] ApplyError),
    #[error("replica is out of sync and must be reloaded")]
    NeedsResync,
}

#[derive(Debug, Clone)]
struct Pending {
    op: Operation,
    /// A concurrent delete-cell absorbed this edit; the server will drop it.
    voided: bool,
}

#[derive(Debug, Clone)]
pub struct Replica {
    session: SessionId,
    doc_id: DocId,
    notebook: Notebook,
    /// Last server version incorporated.
    server_version: u64,
    pending: VecDeque<Pending>,
    counter: u64,
    needs_resync: bool,
}

impl Replica {
    /// Start from a server snapshot. `counter` is the last counter this
    /// session used, so a reconnecting session keeps its timestamps rising.
    pub fn from_snapshot(session: SessionId, notebook: Notebook, counter: u64) -> Self {
        Self {
            session,
            doc_id: notebook.id,
            server_version: notebook.version,
            notebook,
            pending: VecDeque::new(),
            counter,
            needs_resync: false,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    /// Last server version incorporated into this replica.
    pub fn version(&self) -> u64 {
        self.server_version
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Apply a local edit and return the operation to send.
    pub fn local(&mut self, kind: OpKind) -> Result<Operation, ReplicaError> {
        if self.needs_resync {
            return Err(ReplicaError::NeedsResync);
        }
        self.notebook.apply(&kind)?;
        self.counter += 1;
        let op = Operation::new(self.doc_id, self.session, self.counter, self.server_version, kind);
        self.pending.push_back(Pending { op: op.clone(), voided: false });
        Ok(op)
    }

    /// Incorporate an operation broadcast by the server as `version`.
    pub fn on_remote(&mut self, version: u64, op: &Operation) {
        if version <= self.server_version {
            return;
        }
        if op.session == self.session {
            self.on_ack(version);
            return;
        }

        let mut remote = Some(op.kind.clone());
        for pending in self.pending.iter_mut().filter(|p| !p.voided) {
            let Some(r) = remote.take() else { break };
            let a_first = pending.op.timestamp < op.timestamp;
            let (p2, r2) = transform(&pending.op.kind, &r, a_first);
            match p2 {
                Some(k) => pending.op.kind = k,
                None => pending.voided = true,
            }
            remote = r2;
        }

        if let Some(kind) = remote {
            if let Err(e) = self.notebook.apply(&kind) {
                log::warn!("Replica {} diverged applying v{version}: {e}", self.session);
                self.needs_resync = true;
            }
        }
        self.server_version = version;
    }

    /// The server sequenced our oldest pending operation as `version`.
    pub fn on_ack(&mut self, version: u64) {
        match self.pending.iter().position(|p| !p.voided) {
            Some(i) => {
                self.pending.remove(i);
            }
            None => self.needs_resync = true,
        }
        self.server_version = self.server_version.max(version);
    }

    /// The server dropped one of our operations instead of applying it.
    pub fn on_dropped(&mut self, timestamp: LogicalTimestamp) {
        match self.pending.iter().position(|p| p.op.timestamp == timestamp) {
            Some(i) => {
                if let Some(p) = self.pending.remove(i) {
                    if !p.voided {
                        // We still show an edit the server threw away.
                        self.needs_resync = true;
                    }
                }
            }
            None => self.needs_resync = true,
        }
    }

    /// Replace local state with a fresh server snapshot.
    pub fn on_resync(&mut self, notebook: Notebook) {
        self.server_version = notebook.version;
        self.notebook = notebook;
        self.pending.clear();
        self.needs_resync = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CellKind;
    use crate::merge::{MergeEngine, Outcome};
    use uuid::Uuid;

    fn setup() -> (MergeEngine, Uuid) {
        let doc = Uuid::new_v4();
        let mut engine = MergeEngine::new(Notebook::new(doc, "Q1"));
        let cell = Uuid::new_v4();
        engine
            .apply(&Operation::new(doc, crate::operation::SYSTEM_SESSION, 1, 0, OpKind::InsertCell {
                cell,
                index: 0,
                kind: CellKind::Code,
                content: String::new(),
            }))
            .unwrap();
        (engine, cell)
    }

    fn deliver(replicas: &mut [&mut Replica], outcome: &Outcome) {
        match outcome {
            Outcome::Applied { version, op, .. } => {
                for r in replicas.iter_mut() {
                    r.on_remote(*version, op);
                }
            }
            Outcome::Dropped { session, timestamp, .. } => {
                for r in replicas.iter_mut().filter(|r| r.session() == *session) {
                    r.on_dropped(*timestamp);
                }
            }
        }
    }

    #[test]
    fn test_two_replicas_converge_with_server() {
        let (mut engine, cell) = setup();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let mut ra = Replica::from_snapshot(a, engine.register_session(a), 0);
        let mut rb = Replica::from_snapshot(b, engine.register_session(b), 0);

        let op_a = ra.local(OpKind::InsertText { cell, pos: 0, text: "SELECT 1".into() }).unwrap();
        let op_b = rb.local(OpKind::InsertText { cell, pos: 0, text: "SELECT 2".into() }).unwrap();

        let first = engine.apply(&op_b).unwrap();
        deliver(&mut [&mut ra, &mut rb], &first);
        let second = engine.apply(&op_a).unwrap();
        deliver(&mut [&mut ra, &mut rb], &second);

        let expected = &engine.notebook().cells;
        assert_eq!(&ra.notebook().cells, expected);
        assert_eq!(&rb.notebook().cells, expected);
        assert_eq!(ra.pending_len(), 0);
        assert_eq!(rb.version(), 3);
    }

    #[test]
    fn test_pending_edit_voided_by_remote_delete() {
        let (mut engine, cell) = setup();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let mut ra = Replica::from_snapshot(a, engine.register_session(a), 0);
        let mut rb = Replica::from_snapshot(b, engine.register_session(b), 0);

        let del = ra.local(OpKind::DeleteCell { cell, index: 0 }).unwrap();
        let edit = rb.local(OpKind::InsertText { cell, pos: 0, text: "x".into() }).unwrap();

        let out = engine.apply(&del).unwrap();
        deliver(&mut [&mut ra, &mut rb], &out);
        assert!(rb.notebook().cells.is_empty());

        let out = engine.apply(&edit).unwrap();
        assert!(matches!(out, Outcome::Dropped { .. }));
        deliver(&mut [&mut ra, &mut rb], &out);

        assert_eq!(rb.pending_len(), 0);
        assert!(!rb.needs_resync());
        assert_eq!(rb.version(), engine.version());
    }

    #[test]
    fn test_unexpected_drop_requests_resync() {
        let (engine, cell) = setup();
        let a = Uuid::from_u128(1);
        let mut ra = Replica::from_snapshot(a, engine.notebook().clone(), 0);
        let op = ra.local(OpKind::InsertText { cell, pos: 0, text: "x".into() }).unwrap();
        ra.on_dropped(op.timestamp);
        assert!(ra.needs_resync());
        assert_eq!(ra.local(OpKind::InsertText { cell, pos: 0, text: "y".into() }), Err(ReplicaError::NeedsResync));

        ra.on_resync(engine.notebook().clone());
        assert!(!ra.needs_resync());
        assert_eq!(ra.notebook().cell(&cell).unwrap().content, "");
    }

    #[test]
    fn test_counter_continues_after_reconnect() {
        let (engine, cell) = setup();
        let a = Uuid::from_u128(1);
        let mut ra = Replica::from_snapshot(a, engine.notebook().clone(), 41);
        let op = ra.local(OpKind::InsertText { cell, pos: 0, text: "x".into() }).unwrap();
        assert_eq!(op.timestamp.counter, 42);
        assert_eq!(op.seen_version, 1);
    }
}
