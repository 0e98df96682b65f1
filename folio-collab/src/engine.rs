//! # Session engine
//!
//! The facade the transport talks to. It wires the document store, the
//! session broker, the query sandbox and the execution scheduler together:
//!
//! ```text
//!   Edit ──► DocumentStore::lock ──► Sequencer::apply ──► broker (ops, acks)
//! Execute ──► ExecutionScheduler ──► QuerySandbox ──┐
//!                                                   ▼
//!               write-back task ──► set-output op ──► Sequencer::apply ──► broker
//! ```
//!
//! Every event derived from a sequenced operation is handed to the broker
//! while that document's sequencer is held, so each room observes versions
//! in order.

use std::sync::{Arc, Weak};

use folio_core::{
    Cell, CellId, DocId, DropReason, Notebook, OpKind, Operation, Outcome, SessionId, SYSTEM_SESSION,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::{EventStream, Session, SessionBroker};
use crate::config::EngineConfig;
use crate::document_store::{DocumentStore, Sequencer};
use crate::error::EngineError;
use crate::protocol::{CursorPosition, ErrorKind, NotebookSummary, ServerEvent, UserIdentity};
use crate::sandbox::{Dataset, ExecutionRequest, QuerySandbox};
use crate::scheduler::{CompletedExecution, ExecutionScheduler, Ticket};
use crate::storage::AuditEntry;

/// A session attached to a notebook.
pub struct Connection {
    pub session: SessionId,
    pub doc_id: DocId,
    /// `Joined` for a new session, `ResyncSnapshot` for a resumed one
    pub first: ServerEvent,
    pub events: EventStream,
}

pub struct SessionEngine {
    config: EngineConfig,
    store: DocumentStore,
    broker: SessionBroker,
    scheduler: Arc<ExecutionScheduler>,
}

impl SessionEngine {
    /// Open the store, recover persisted notebooks and start the background
    /// tasks. Must be called inside a tokio runtime.
    pub async fn open(config: EngineConfig, dataset: Arc<dyn Dataset>) -> Result<Arc<Self>, EngineError> {
        let store = DocumentStore::open(config.store.clone())?;
        let recovered = store.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} notebooks from persistent storage");
        }

        let sandbox = Arc::new(QuerySandbox::new(dataset, config.sandbox.clone()));
        let (scheduler, completed) = ExecutionScheduler::new(sandbox, config.scheduler.clone());
        let engine = Arc::new(Self {
            broker: SessionBroker::new(config.broker.clone()),
            config,
            store,
            scheduler,
        });
        Self::spawn_background(&engine, completed);
        Ok(engine)
    }

    fn spawn_background(engine: &Arc<Self>, mut completed: mpsc::Receiver<CompletedExecution>) {
        let weak: Weak<Self> = Arc::downgrade(engine);
        tokio::spawn(async move {
            while let Some(done) = completed.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                engine.write_back(done).await;
            }
            log::debug!("Write-back task stopped");
        });

        let weak = Arc::downgrade(engine);
        let interval = engine.config.broker.presence_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                engine.broker.flush_presence().await;
            }
        });

        let weak = Arc::downgrade(engine);
        let period = std::time::Duration::from_secs(engine.config.server.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                engine.reap_idle().await;
            }
        });
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn broker(&self) -> &SessionBroker {
        &self.broker
    }

    pub fn scheduler(&self) -> &Arc<ExecutionScheduler> {
        &self.scheduler
    }

    // ─── Catalog ─────────────────────────────────────────────────────

    pub async fn create_notebook(&self, title: &str, owner: &UserIdentity) -> Result<DocId, EngineError> {
        self.store.create(title, &owner.name).await
    }

    pub async fn list_notebooks(&self) -> Vec<NotebookSummary> {
        self.store.list().await
    }

    // ─── Sessions ────────────────────────────────────────────────────

    /// Attach a session to `doc_id`. With `resume`, the previous session id
    /// is reattached and answered with a fresh snapshot.
    pub async fn connect(
        &self,
        doc_id: DocId,
        user: UserIdentity,
        token: &str,
        resume: Option<SessionId>,
    ) -> Result<Connection, EngineError> {
        let mut seq = self.store.lock(&doc_id).await?;
        let session = match resume {
            Some(id) => {
                if self.broker.is_connected(&id).await {
                    return Err(EngineError::SessionActive(id));
                }
                id
            }
            None => Uuid::new_v4(),
        };

        let notebook = seq.register_session(session);
        let version = notebook.version;
        // Subscribing under the sequencer guarantees the stream starts
        // right after `version`.
        let events = match self.broker.connect(doc_id, session, user, token).await {
            Ok(events) => events,
            Err(e) => {
                seq.unregister_session(&session);
                return Err(e);
            }
        };

        let first = match resume {
            Some(_) => {
                log::info!("Session {session} resumed notebook {doc_id} at v{version}");
                ServerEvent::ResyncSnapshot { notebook, version }
            }
            None => ServerEvent::Joined {
                session,
                notebook,
                version,
                last_counter: seq.last_counter(&session),
            },
        };
        Ok(Connection {
            session,
            doc_id,
            first,
            events,
        })
    }

    /// Detach a session. Sequenced operations stay applied; its pending
    /// executions are abandoned.
    pub async fn disconnect(&self, session: &SessionId) -> bool {
        let Some(current) = self.broker.session(session).await else {
            return false;
        };
        // Under the sequencer, so a concurrent resume cannot interleave.
        let seq = self.store.lock(&current.doc_id).await.ok();
        if self.broker.disconnect(session).await.is_none() {
            return false;
        }
        if let Some(mut seq) = seq {
            seq.unregister_session(session);
        }
        self.scheduler.abandon_session(session).await;
        true
    }

    pub async fn session(&self, session: &SessionId) -> Result<Session, EngineError> {
        self.broker
            .session(session)
            .await
            .ok_or(EngineError::UnknownSession(*session))
    }

    // ─── Edits ───────────────────────────────────────────────────────

    /// Sequence an edit from `session` and fan out the result.
    pub async fn submit_operation(&self, session: &SessionId, op: Operation) -> Result<Outcome, EngineError> {
        let current = self.session(session).await?;
        if op.session != *session || op.doc_id != current.doc_id {
            return Err(folio_core::MergeError::InvalidOperation(
                "operation does not belong to this session".into(),
            )
            .into());
        }

        let mut seq = self.store.lock(&current.doc_id).await?;
        let outcome = match seq.apply(&op) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Rejected {} from session {session}: {e}", op.kind.name());
                return Err(e);
            }
        };

        match &outcome {
            Outcome::Applied { version, op: transformed, lagging } => {
                let doc_id = current.doc_id;
                let event = ServerEvent::Operation { version: *version, op: transformed.clone() };
                self.broker.broadcast(&doc_id, event, Some(*session)).await;
                let ack = ServerEvent::Ack { version: *version, timestamp: op.timestamp };
                self.broker.send_to(&doc_id, *session, ack).await;
                self.resync_lagging(&mut seq, lagging).await;
            }
            Outcome::Dropped { session: origin, timestamp, cell, reason } => {
                log::debug!("Dropped {} from {origin}: {reason:?}", op.kind.name());
                let notice = match reason {
                    DropReason::CellRemoved => ServerEvent::CellRemoved { timestamp: *timestamp, cell: *cell },
                    DropReason::Absorbed => ServerEvent::Absorbed { timestamp: *timestamp },
                };
                self.broker.send_to(&current.doc_id, *origin, notice).await;
            }
        }
        drop(seq);
        self.broker.touch(session).await;
        Ok(outcome)
    }

    /// Sessions whose unseen list overflowed get a snapshot instead of
    /// further operations.
    async fn resync_lagging(&self, seq: &mut Sequencer, lagging: &[SessionId]) {
        let doc_id = seq.doc_id();
        for lagged in lagging {
            let notebook = seq.resync(*lagged);
            let version = notebook.version;
            log::warn!("Session {lagged} overflowed its unseen list; resyncing at v{version}");
            self.broker
                .send_to(&doc_id, *lagged, ServerEvent::ResyncSnapshot { notebook, version })
                .await;
        }
    }

    pub async fn update_cursor(&self, session: &SessionId, cursor: CursorPosition) -> Result<(), EngineError> {
        self.broker.update_cursor(session, cursor).await?;
        self.broker.touch(session).await;
        Ok(())
    }

    pub async fn acknowledge(&self, session: &SessionId, version: u64) -> Result<(), EngineError> {
        let current = self.session(session).await?;
        self.store.lock(&current.doc_id).await?.acknowledge(session, version)?;
        self.broker.touch(session).await;
        Ok(())
    }

    /// Reset `session` to the current notebook.
    pub async fn resync(&self, session: &SessionId) -> Result<(Notebook, u64), EngineError> {
        let current = self.session(session).await?;
        let mut seq = self.store.lock(&current.doc_id).await?;
        let notebook = seq.resync(*session);
        let version = notebook.version;
        log::debug!("Session {session} resynced at v{version}");
        Ok((notebook, version))
    }

    // ─── Executions ──────────────────────────────────────────────────

    /// Queue `query` for `cell`. The requester hears `ExecutionQueued` at
    /// once and the room hears `ExecutionResult` once it is written back.
    pub async fn submit_execution(&self, session: &SessionId, cell: CellId, query: &str) -> Result<Ticket, EngineError> {
        let current = self.session(session).await?;
        let doc_id = current.doc_id;
        // Held until the queued notice is sent, so it precedes the result.
        let seq = self.store.lock(&doc_id).await?;
        if seq.notebook().cell(&cell).is_none() {
            return Err(EngineError::CellNotFound { doc_id, cell });
        }

        let request = ExecutionRequest::new(doc_id, cell, *session, query);
        let ticket = self.scheduler.submit(request).await?;
        let queued = ServerEvent::ExecutionQueued { request: ticket.request_id, cell };
        self.broker.send_to(&doc_id, *session, queued).await;
        drop(seq);

        self.broker.touch(session).await;
        Ok(ticket)
    }

    /// Sequence a claimed result as a set-output operation and broadcast it.
    async fn write_back(&self, done: CompletedExecution) {
        let CompletedExecution { request, generation, result } = done;
        let mut seq = match self.store.lock(&request.doc_id).await {
            Ok(seq) => seq,
            Err(e) => {
                log::warn!("Dropping result for cell {}: {e}", request.cell_id);
                self.scheduler.settle(&request.doc_id, &request.cell_id, generation).await;
                return;
            }
        };
        // Submissions also hold the sequencer, so none can slip in between
        // this check and the write.
        if !self.scheduler.settle(&request.doc_id, &request.cell_id, generation).await {
            log::debug!("Result {} for cell {} was superseded", request.request_id, request.cell_id);
            return;
        }

        let kind = OpKind::SetOutput { cell: request.cell_id, result: result.clone() };
        let op = Operation::new(request.doc_id, SYSTEM_SESSION, 0, seq.version(), kind);
        match seq.apply(&op) {
            Ok(Outcome::Applied { version, lagging, .. }) => {
                log::debug!("Wrote result {} into cell {} as v{version}", request.request_id, request.cell_id);
                self.broker
                    .broadcast(&request.doc_id, ServerEvent::ExecutionResult { version, result }, None)
                    .await;
                self.resync_lagging(&mut seq, &lagging).await;
            }
            Ok(Outcome::Dropped { reason, .. }) => {
                log::debug!("Discarded result for cell {}: {reason:?}", request.cell_id);
            }
            Err(e) => log::warn!("Could not write result into cell {}: {e}", request.cell_id),
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub async fn get_cell(&self, doc_id: &DocId, cell: &CellId) -> Result<Cell, EngineError> {
        self.store.get_cell(doc_id, cell).await
    }

    /// Read-only snapshot for publishing. Recorded in the audit log.
    pub async fn export_snapshot(&self, doc_id: &DocId, who: &str) -> Result<Notebook, EngineError> {
        self.store.export_snapshot(doc_id, who).await
    }

    pub async fn audit_log(&self, doc_id: &DocId) -> Result<Vec<AuditEntry>, EngineError> {
        self.store.audit(doc_id).await
    }

    // ─── Housekeeping ────────────────────────────────────────────────

    /// Disconnect sessions silent for longer than the session timeout.
    pub async fn reap_idle(&self) -> usize {
        let idle = self.broker.idle_sessions(self.config.server.session_timeout()).await;
        for session in &idle {
            if let Some(current) = self.broker.session(session).await {
                let notice = ServerEvent::error(ErrorKind::Disconnected, "session timed out");
                self.broker.send_to(&current.doc_id, *session, notice).await;
            }
            log::info!("Reaping idle session {session}");
            self.disconnect(session).await;
        }
        idle.len()
    }

    /// Stop accepting executions and snapshot every notebook.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.store.checkpoint_all().await;
        log::info!("Session engine shut down");
    }
}
