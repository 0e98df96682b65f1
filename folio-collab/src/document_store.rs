//! Arena of live notebooks, each behind its own sequencer.
//!
//! ```text
//! DocumentStore
//!   ├── documents: doc_id → Arc<Mutex<DocumentState>>   (one sequencer each)
//!   │                         ├── MergeEngine (notebook, log, sessions)
//!   │                         └── summary + audit
//!   └── NotebookDb (optional RocksDB)
//! ```
//!
//! Locking a document yields a [`Sequencer`]. Everything that must observe
//! one consistent version (sequencing, session registration, fan-out of the
//! result) happens while the sequencer is held. Documents never share a
//! lock, so edits on different notebooks proceed in parallel.
//!
//! Write-ahead: a transformed operation is appended to the op log before
//! the in-memory notebook changes. If the append fails the notebook stays
//! at the last durable version.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use folio_core::{Cell, CellId, DocId, MergeEngine, Notebook, Operation, Outcome, SessionId};

use crate::error::EngineError;
use crate::protocol::NotebookSummary;
use crate::storage::rocks::now_secs;
use crate::storage::{AuditAction, AuditEntry, NotebookDb, NotebookMetadata, StoreConfig, StoreError};

/// State guarded by a document's sequencer.
struct DocumentState {
    engine: MergeEngine,
    owner: String,
    created_at: u64,
    updated_at: u64,
    ops_since_snapshot: u64,
    /// Audit trail for stores without a database
    audit: Vec<AuditEntry>,
}

impl DocumentState {
    fn summary(&self) -> NotebookSummary {
        let notebook = self.engine.notebook();
        NotebookSummary {
            id: notebook.id,
            title: notebook.title.clone(),
            owner: self.owner.clone(),
            version: notebook.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Exclusive access to one notebook.
pub struct Sequencer {
    state: OwnedMutexGuard<DocumentState>,
    db: Option<Arc<NotebookDb>>,
    snapshot_every: u64,
}

impl Sequencer {
    pub fn doc_id(&self) -> DocId {
        self.state.engine.notebook().id
    }

    pub fn notebook(&self) -> &Notebook {
        self.state.engine.notebook()
    }

    pub fn version(&self) -> u64 {
        self.state.engine.version()
    }

    pub fn engine(&self) -> &MergeEngine {
        &self.state.engine
    }

    /// Sequence `op`: transform, persist, then apply.
    pub fn apply(&mut self, op: &Operation) -> Result<Outcome, EngineError> {
        let doc_id = self.doc_id();
        let prepared = self.state.engine.prepare(op)?;

        if let (Some(db), Some((version, transformed))) = (&self.db, prepared.to_apply()) {
            if let Err(e) = db.append_op(doc_id, version, transformed) {
                log::error!("Durability failure on {doc_id} v{version}: {e}");
                return Err(EngineError::Store(e));
            }
        }

        let outcome = self.state.engine.commit(prepared)?;
        if let Outcome::Applied { version, op, .. } = &outcome {
            log::debug!("Sequenced {} on {doc_id} as v{version}", op.kind.name());
            self.state.updated_at = now_secs();
            self.state.ops_since_snapshot += 1;
            if self.state.ops_since_snapshot >= self.snapshot_every {
                self.checkpoint();
            }
        }
        Ok(outcome)
    }

    /// Snapshot the notebook and fold the op log into it.
    pub fn checkpoint(&mut self) {
        let version = self.version();
        let doc_id = self.doc_id();
        if let Some(db) = &self.db {
            let engine = &self.state.engine;
            let saved = db
                .save_snapshot(engine.notebook(), &engine.removed_cells())
                .and_then(|_| db.compact_ops(doc_id, version));
            match saved {
                Ok(folded) => log::debug!("Snapshot of {doc_id} at v{version}, {folded} op records folded"),
                Err(e) => {
                    // The op records are still there; retry on the next interval.
                    log::error!("Snapshot of {doc_id} at v{version} failed: {e}");
                    return;
                }
            }
        }
        self.state.engine.compact_through(version);
        self.state.ops_since_snapshot = 0;
    }

    pub fn register_session(&mut self, session: SessionId) -> Notebook {
        self.state.engine.register_session(session)
    }

    pub fn unregister_session(&mut self, session: &SessionId) -> bool {
        self.state.engine.unregister_session(session)
    }

    pub fn is_registered(&self, session: &SessionId) -> bool {
        self.state.engine.sessions().contains(session)
    }

    pub fn acknowledge(&mut self, session: &SessionId, version: u64) -> Result<(), EngineError> {
        self.state.engine.acknowledge(session, version)?;
        Ok(())
    }

    pub fn resync(&mut self, session: SessionId) -> Notebook {
        self.state.engine.resync(session)
    }

    pub fn last_counter(&self, session: &SessionId) -> u64 {
        self.state.engine.last_counter(session)
    }

    pub fn summary(&self) -> NotebookSummary {
        self.state.summary()
    }
}

/// Live notebooks plus their persistence.
pub struct DocumentStore {
    documents: RwLock<HashMap<DocId, Arc<Mutex<DocumentState>>>>,
    db: Option<Arc<NotebookDb>>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store. Without a configured path everything stays in memory.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let db = match &config.path {
            Some(_) => Some(Arc::new(NotebookDb::open(config.clone())?)),
            None => None,
        };
        Ok(Self {
            documents: RwLock::new(HashMap::new()),
            db,
            config,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn db(&self) -> Option<&Arc<NotebookDb>> {
        self.db.as_ref()
    }

    fn new_engine(&self, notebook: Notebook) -> MergeEngine {
        MergeEngine::new(notebook).with_max_unseen(self.config.max_unacknowledged)
    }

    /// Load every persisted notebook: latest snapshot plus verified op
    /// records after it. Returns the number of notebooks restored.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };

        let all = db.list_notebooks()?;
        let mut recovered = 0;
        for meta in &all {
            let snapshot = match db.load_snapshot(meta.doc_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Skipping notebook {}: {e}", meta.doc_id);
                    continue;
                }
            };
            let mut engine = self.new_engine(snapshot.notebook).with_removed(snapshot.removed);
            let records = db.load_ops_since(meta.doc_id, engine.version())?;
            if records.corrupted > 0 {
                log::warn!("Notebook {}: {} corrupted op records skipped", meta.doc_id, records.corrupted);
            }
            let mut replayed = 0u64;
            for (version, op) in records.ops {
                if let Err(e) = engine.replay_entry(version, op) {
                    log::warn!("Notebook {}: replay stopped at v{version}: {e}", meta.doc_id);
                    break;
                }
                replayed += 1;
            }

            let state = DocumentState {
                engine,
                owner: meta.owner.clone(),
                created_at: meta.created_at,
                updated_at: meta.updated_at,
                ops_since_snapshot: replayed,
                audit: Vec::new(),
            };
            log::info!(
                "Recovered notebook {} '{}' at v{} ({replayed} ops replayed)",
                meta.doc_id,
                meta.title,
                state.engine.version()
            );
            self.documents
                .write()
                .await
                .insert(meta.doc_id, Arc::new(Mutex::new(state)));
            recovered += 1;
        }

        log::info!("Recovery complete: {recovered}/{} notebooks restored", all.len());
        Ok(recovered)
    }

    /// Create an empty notebook.
    pub async fn create(&self, title: &str, owner: &str) -> Result<DocId, EngineError> {
        let id = Uuid::new_v4();
        let notebook = Notebook::new(id, title);
        let meta = NotebookMetadata::new(id, title, owner);
        let audit = AuditEntry::new(id, AuditAction::Created, owner, serde_json::json!({ "title": title }));

        if let Some(db) = &self.db {
            db.save_metadata(&meta).map_err(EngineError::Store)?;
            db.save_snapshot(&notebook, &[]).map_err(EngineError::Store)?;
            db.append_audit(&audit).map_err(EngineError::Store)?;
        }

        let state = DocumentState {
            engine: self.new_engine(notebook),
            owner: owner.to_string(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            ops_since_snapshot: 0,
            audit: if self.db.is_some() { Vec::new() } else { vec![audit] },
        };
        self.documents.write().await.insert(id, Arc::new(Mutex::new(state)));
        log::info!("Created notebook {id} '{title}' for {owner}");
        Ok(id)
    }

    /// Catalog, most recently updated first.
    pub async fn list(&self) -> Vec<NotebookSummary> {
        let handles: Vec<_> = self.documents.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| {
            Reverse(a.updated_at)
                .cmp(&Reverse(b.updated_at))
                .then_with(|| a.title.cmp(&b.title))
        });
        summaries
    }

    pub async fn contains(&self, doc_id: &DocId) -> bool {
        self.documents.read().await.contains_key(doc_id)
    }

    /// Acquire a notebook's sequencer.
    pub async fn lock(&self, doc_id: &DocId) -> Result<Sequencer, EngineError> {
        let handle = self
            .documents
            .read()
            .await
            .get(doc_id)
            .cloned()
            .ok_or(EngineError::DocumentNotFound(*doc_id))?;
        Ok(Sequencer {
            state: handle.lock_owned().await,
            db: self.db.clone(),
            snapshot_every: self.config.snapshot_every.max(1),
        })
    }

    /// Current snapshot and version.
    pub async fn load(&self, doc_id: &DocId) -> Result<(Notebook, u64), EngineError> {
        let seq = self.lock(doc_id).await?;
        Ok((seq.notebook().clone(), seq.version()))
    }

    /// Sequence one operation. Conflicts are resolved by the merge engine and
    /// never surface here.
    pub async fn apply_operation(&self, op: &Operation) -> Result<Outcome, EngineError> {
        self.lock(&op.doc_id).await?.apply(op)
    }

    pub async fn get_cell(&self, doc_id: &DocId, cell: &CellId) -> Result<Cell, EngineError> {
        let seq = self.lock(doc_id).await?;
        seq.notebook()
            .cell(cell)
            .cloned()
            .ok_or(EngineError::CellNotFound { doc_id: *doc_id, cell: *cell })
    }

    /// Immutable snapshot for publishing; recorded in the audit trail.
    pub async fn export_snapshot(&self, doc_id: &DocId, who: &str) -> Result<Notebook, EngineError> {
        let seq = self.lock(doc_id).await?;
        let notebook = seq.notebook().clone();
        let entry = AuditEntry::new(
            *doc_id,
            AuditAction::Exported,
            who,
            serde_json::json!({ "version": notebook.version, "cells": notebook.cells.len() }),
        );
        self.record_audit(seq, entry)?;
        log::info!("Exported notebook {doc_id} at v{} for {who}", notebook.version);
        Ok(notebook)
    }

    /// The exported snapshot rendered as pretty JSON.
    pub async fn export_json(&self, doc_id: &DocId, who: &str) -> Result<String, EngineError> {
        let notebook = self.export_snapshot(doc_id, who).await?;
        notebook
            .to_json()
            .map_err(|e| EngineError::Store(StoreError::SerializationError(e.to_string())))
    }

    fn record_audit(&self, mut seq: Sequencer, entry: AuditEntry) -> Result<(), EngineError> {
        match &self.db {
            Some(db) => db.append_audit(&entry).map_err(EngineError::Store),
            None => {
                seq.state.audit.push(entry);
                Ok(())
            }
        }
    }

    pub async fn audit(&self, doc_id: &DocId) -> Result<Vec<AuditEntry>, EngineError> {
        let seq = self.lock(doc_id).await?;
        match &self.db {
            Some(db) => db.load_audit(*doc_id).map_err(EngineError::Store),
            None => Ok(seq.state.audit.clone()),
        }
    }

    /// Snapshot every notebook, e.g. before shutdown.
    pub async fn checkpoint_all(&self) {
        let ids: Vec<DocId> = self.documents.read().await.keys().copied().collect();
        for id in ids {
            if let Ok(mut seq) = self.lock(&id).await {
                seq.checkpoint();
            }
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.sync() {
                log::error!("Flush failed: {e}");
            }
        }
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{CellKind, DropReason, OpKind, SYSTEM_SESSION};

    fn insert_cell(doc: DocId, session: SessionId, counter: u64, seen: u64, index: usize) -> (Operation, CellId) {
        let cell = Uuid::new_v4();
        let op = Operation::new(doc, session, counter, seen, OpKind::InsertCell {
            cell,
            index,
            kind: CellKind::Code,
            content: "SELECT 1".into(),
        });
        (op, cell)
    }

    #[tokio::test]
    async fn test_create_load_apply_in_memory() {
        let store = DocumentStore::open(StoreConfig::in_memory()).unwrap();
        let id = store.create("Q1 sales", "alice").await.unwrap();

        let (notebook, version) = store.load(&id).await.unwrap();
        assert_eq!(notebook.title, "Q1 sales");
        assert_eq!(version, 0);

        let session = Uuid::new_v4();
        store.lock(&id).await.unwrap().register_session(session);
        let (op, cell) = insert_cell(id, session, 1, 0, 0);
        match store.apply_operation(&op).await.unwrap() {
            Outcome::Applied { version, .. } => assert_eq!(version, 1),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(store.get_cell(&id, &cell).await.unwrap().content, "SELECT 1");
        assert!(matches!(
            store.get_cell(&id, &Uuid::new_v4()).await,
            Err(EngineError::CellNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_document() {
        let store = DocumentStore::open(StoreConfig::in_memory()).unwrap();
        let missing = Uuid::new_v4();
        assert!(matches!(store.load(&missing).await, Err(EngineError::DocumentNotFound(_))));
        let (op, _) = insert_cell(missing, SYSTEM_SESSION, 0, 0, 0);
        assert!(matches!(store.apply_operation(&op).await, Err(EngineError::DocumentNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_operation_not_applied() {
        let store = DocumentStore::open(StoreConfig::in_memory()).unwrap();
        let id = store.create("nb", "alice").await.unwrap();
        let op = Operation::new(id, SYSTEM_SESSION, 0, 0, OpKind::InsertText {
            cell: Uuid::new_v4(),
            pos: 0,
            text: "x".into(),
        });
        let err = store.apply_operation(&op).await.unwrap_err();
        assert_eq!(err.kind(), crate::protocol::ErrorKind::InvalidOperation);
        assert_eq!(store.load(&id).await.unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_list_orders_by_update() {
        let store = DocumentStore::open(StoreConfig::in_memory()).unwrap();
        let a = store.create("alpha", "alice").await.unwrap();
        let b = store.create("beta", "bob").await.unwrap();
        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        let ids: Vec<DocId> = listed.iter().map(|s| s.id).collect();
        assert!(ids.contains(&a) && ids.contains(&b));
    }

    #[tokio::test]
    async fn test_export_records_audit() {
        let store = DocumentStore::open(StoreConfig::in_memory()).unwrap();
        let id = store.create("nb", "alice").await.unwrap();
        let json = store.export_json(&id, "bob").await.unwrap();
        assert!(json.contains("\"title\": \"nb\""));

        let audit = store.audit(&id).await.unwrap();
        let actions: Vec<AuditAction> = audit.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Created, AuditAction::Exported]);
        assert_eq!(audit[1].who, "bob");
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        let (id, cell) = {
            let store = DocumentStore::open(config.clone()).unwrap();
            let id = store.create("durable", "alice").await.unwrap();
            let session = Uuid::new_v4();
            let mut seq = store.lock(&id).await.unwrap();
            seq.register_session(session);
            let (op, cell) = insert_cell(id, session, 1, 0, 0);
            seq.apply(&op).unwrap();
            for i in 0..12u64 {
                let edit = Operation::new(id, session, i + 2, i + 1, OpKind::InsertText {
                    cell,
                    pos: 0,
                    text: "-".into(),
                });
                seq.apply(&edit).unwrap();
            }
            (id, cell)
        };

        let store = DocumentStore::open(config).unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        let (notebook, version) = store.load(&id).await.unwrap();
        assert_eq!(version, 13);
        assert_eq!(notebook.cell(&cell).unwrap().content, "------------SELECT 1");
        assert_eq!(store.audit(&id).await.unwrap().len(), 1);
        assert_eq!(store.list().await[0].owner, "alice");
    }

    #[tokio::test]
    async fn test_deleted_cells_remembered_across_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path());
        let session = Uuid::new_v4();
        let (id, cell) = {
            let store = DocumentStore::open(config.clone()).unwrap();
            let id = store.create("pruned", "alice").await.unwrap();
            let mut seq = store.lock(&id).await.unwrap();
            seq.register_session(session);
            let (op, cell) = insert_cell(id, session, 1, 0, 0);
            seq.apply(&op).unwrap();
            seq.apply(&Operation::new(id, session, 2, 1, OpKind::DeleteCell { cell, index: 0 })).unwrap();
            seq.checkpoint();
            assert!(seq.engine().log().is_empty());
            (id, cell)
        };

        let store = DocumentStore::open(config).unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        let mut seq = store.lock(&id).await.unwrap();
        assert!(seq.engine().is_removed(&cell));
        seq.register_session(session);
        let late = Operation::new(id, session, 3, 2, OpKind::InsertText { cell, pos: 0, text: "x".into() });
        let outcome = seq.apply(&late).unwrap();
        assert!(matches!(outcome, Outcome::Dropped { reason: DropReason::CellRemoved, .. }));
        assert_eq!(seq.version(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_interval_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let id = store.create("compact", "alice").await.unwrap();
        let mut seq = store.lock(&id).await.unwrap();
        for i in 0..8u64 {
            let (op, _) = insert_cell(id, SYSTEM_SESSION, 0, i, 0);
            seq.apply(&op).unwrap();
        }
        assert!(seq.engine().log().is_empty());
        drop(seq);

        let meta = store.db().unwrap().load_metadata(id).unwrap();
        assert_eq!(meta.snapshot_version, 8);
        assert_eq!(meta.op_count, 0);
    }
}
