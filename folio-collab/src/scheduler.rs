//! Per-document admission control for query executions.
//!
//! ```text
//! submit() ──► lane[cell] (generation += 1, older flag cancelled)
//!                 │
//!                 ▼  lane gate (one run per cell)
//!          doc semaphore ──► global semaphore ──► QuerySandbox::execute
//!                                                        │
//!                     claim (generation still current) ◄─┘
//!                                 │
//!                                 ▼
//!                     CompletedExecution ──► write-back ──► settle
//! ```
//!
//! Results that lose the claim (superseded, abandoned) are dropped here and
//! never reach the document. A claimed result keeps its lane until the
//! write-back settles it under the document's sequencer, so a submission
//! arriving in between still supersedes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use folio_core::{CellId, DocId, ExecutionResult, SessionId};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, Semaphore};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::sandbox::{CancelFlag, ExecutionRequest, QuerySandbox};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("notebook {doc_id} already has {pending} executions pending")]
    Overloaded { doc_id: DocId, pending: usize },
    #[error("execution scheduler is shutting down")]
    ShuttingDown,
}

/// Receipt for an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub request_id: Uuid,
    pub cell_id: CellId,
    pub generation: u64,
}

/// A claimed result, ready to be written back.
#[derive(Debug, Clone)]
pub struct CompletedExecution {
    pub request: ExecutionRequest,
    pub generation: u64,
    pub result: ExecutionResult,
}

struct Lane {
    generation: u64,
    cancel: CancelFlag,
    session: SessionId,
    gate: Arc<Mutex<()>>,
}

impl Lane {
    fn new(session: SessionId) -> Self {
        Self {
            generation: 0,
            cancel: CancelFlag::new(),
            session,
            gate: Arc::new(Mutex::new(())),
        }
    }
}

struct DocumentQueue {
    lanes: HashMap<CellId, Lane>,
    pending: usize,
    permits: Arc<Semaphore>,
}

impl DocumentQueue {
    fn is_idle(&self) -> bool {
        self.pending == 0 && self.lanes.is_empty()
    }
}

pub struct ExecutionScheduler {
    sandbox: Arc<QuerySandbox>,
    config: SchedulerConfig,
    global: Arc<Semaphore>,
    documents: Mutex<HashMap<DocId, DocumentQueue>>,
    completed: mpsc::Sender<CompletedExecution>,
    closed: AtomicBool,
}

impl ExecutionScheduler {
    /// Build a scheduler and the receiving end of its completion channel.
    pub fn new(
        sandbox: Arc<QuerySandbox>,
        config: SchedulerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<CompletedExecution>) {
        let (completed, rx) = mpsc::channel(config.global_concurrency.max(1) * 4);
        let scheduler = Arc::new(Self {
            sandbox,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            config,
            documents: Mutex::new(HashMap::new()),
            completed,
            closed: AtomicBool::new(false),
        });
        (scheduler, rx)
    }

    /// Queue `request` and return at once. A pending or running request
    /// for the same cell is superseded.
    pub async fn submit(self: &Arc<Self>, request: ExecutionRequest) -> Result<Ticket, SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        let cancel = CancelFlag::new();
        let (ticket, gate, permits, superseded) = {
            let mut documents = self.documents.lock().await;
            let queue = documents.entry(request.doc_id).or_insert_with(|| DocumentQueue {
                lanes: HashMap::new(),
                pending: 0,
                permits: Arc::new(Semaphore::new(self.config.per_document_concurrency.max(1))),
            });
            if queue.pending >= self.config.max_pending_per_document {
                return Err(SchedulerError::Overloaded {
                    doc_id: request.doc_id,
                    pending: queue.pending,
                });
            }
            queue.pending += 1;

            let lane = queue
                .lanes
                .entry(request.cell_id)
                .or_insert_with(|| Lane::new(request.session));
            let superseded = lane.generation > 0;
            lane.cancel.cancel();
            lane.generation += 1;
            lane.cancel = cancel.clone();
            lane.session = request.session;

            let ticket = Ticket {
                request_id: request.request_id,
                cell_id: request.cell_id,
                generation: lane.generation,
            };
            (ticket, Arc::clone(&lane.gate), Arc::clone(&queue.permits), superseded)
        };

        if superseded {
            log::debug!(
                "Request {} supersedes earlier execution of cell {}",
                request.request_id,
                request.cell_id
            );
        }
        let gate = gate.lock_owned();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let lane = gate.await;
            scheduler.run(lane, request, ticket, cancel, permits).await;
        });
        Ok(ticket)
    }

    /// Execute one request while holding its cell's lane gate. Runs for a
    /// cell never overlap, but they may start in any order; generations
    /// decide which result counts.
    async fn run(
        &self,
        _lane: OwnedMutexGuard<()>,
        request: ExecutionRequest,
        ticket: Ticket,
        cancel: CancelFlag,
        permits: Arc<Semaphore>,
    ) {
        let result = if cancel.is_cancelled() {
            None
        } else {
            self.execute_with_permits(&request, &cancel, permits).await
        };

        let claimed = self.claim(&request, &ticket, &cancel, result.is_some()).await;
        match result {
            Some(result) if claimed => {
                let (doc_id, cell_id) = (request.doc_id, request.cell_id);
                let completed = CompletedExecution { request, generation: ticket.generation, result };
                if self.completed.send(completed).await.is_err() {
                    log::debug!("Completion channel closed; dropping result for cell {cell_id}");
                    self.settle(&doc_id, &cell_id, ticket.generation).await;
                }
            }
            _ => log::debug!(
                "Discarded execution {} of cell {} (generation {})",
                ticket.request_id,
                ticket.cell_id,
                ticket.generation
            ),
        }
    }

    async fn execute_with_permits(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelFlag,
        permits: Arc<Semaphore>,
    ) -> Option<ExecutionResult> {
        let _document = permits.acquire_owned().await.ok()?;
        let _global = Arc::clone(&self.global).acquire_owned().await.ok()?;
        if cancel.is_cancelled() {
            return None;
        }
        Some(self.sandbox.execute(request, cancel.clone()).await)
    }

    /// Account for a finished task and report whether it still owns its
    /// cell. A claimed lane stays in place until [`settle`](Self::settle).
    async fn claim(&self, request: &ExecutionRequest, ticket: &Ticket, cancel: &CancelFlag, produced: bool) -> bool {
        let mut documents = self.documents.lock().await;
        let Some(queue) = documents.get_mut(&request.doc_id) else {
            return false;
        };
        queue.pending = queue.pending.saturating_sub(1);
        let current = queue
            .lanes
            .get(&request.cell_id)
            .is_some_and(|lane| lane.generation == ticket.generation);
        let claimed = current && produced && !cancel.is_cancelled();
        if current && !claimed {
            queue.lanes.remove(&request.cell_id);
        }
        if queue.is_idle() {
            documents.remove(&request.doc_id);
        }
        claimed
    }

    /// Final check before a claimed result is written back. Call it while
    /// holding the document's sequencer: returns `true` when `generation` is
    /// still the latest request for the cell and nobody cancelled it. A lane
    /// still held by `generation` is released either way.
    pub async fn settle(&self, doc_id: &DocId, cell_id: &CellId, generation: u64) -> bool {
        let mut documents = self.documents.lock().await;
        let Some(queue) = documents.get_mut(doc_id) else {
            return false;
        };
        let current = match queue.lanes.get(cell_id) {
            Some(lane) if lane.generation == generation => !lane.cancel.is_cancelled(),
            _ => return false,
        };
        queue.lanes.remove(cell_id);
        if queue.is_idle() {
            documents.remove(doc_id);
        }
        current
    }

    /// Cancel everything `session` has pending or running. Their results are
    /// discarded.
    pub async fn abandon_session(&self, session: &SessionId) -> usize {
        let documents = self.documents.lock().await;
        let mut abandoned = 0;
        for lane in documents.values().flat_map(|q| q.lanes.values()) {
            if lane.session == *session && !lane.cancel.is_cancelled() {
                lane.cancel.cancel();
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            log::debug!("Abandoned {abandoned} executions of session {session}");
        }
        abandoned
    }

    /// Requests submitted for `doc_id` that have not finished.
    pub async fn pending(&self, doc_id: &DocId) -> usize {
        self.documents
            .lock()
            .await
            .get(doc_id)
            .map(|q| q.pending)
            .unwrap_or(0)
    }

    /// Refuse new work and cancel everything in flight.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let documents = self.documents.lock().await;
        for lane in documents.values().flat_map(|q| q.lanes.values()) {
            lane.cancel.cancel();
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
