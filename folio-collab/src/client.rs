//! WebSocket client for the notebook server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, resume after a drop)
//! - A local [`Replica`] kept in step with server events
//! - Automatic acknowledgments and resync requests
//!
//! Every server event is forwarded to the application after the replica
//! has incorporated it.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use folio_core::{
    CellId, DocId, Notebook, OpKind, Operation, Replica, ReplicaError, SessionId, SYSTEM_SESSION,
};

use crate::protocol::{ClientMessage, CursorPosition, ProtocolError, ServerEvent, UserIdentity};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A server event, already applied to the local replica
    Server(ServerEvent),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Session identity remembered across reconnects.
#[derive(Debug, Clone, Copy)]
struct Membership {
    doc_id: DocId,
    session: SessionId,
}

/// The notebook client.
pub struct NotebookClient {
    user: UserIdentity,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    replica: Arc<Mutex<Option<Replica>>>,
    membership: Arc<RwLock<Option<Membership>>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl NotebookClient {
    pub fn new(user: UserIdentity, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(Mutex::new(None)),
            membership: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open the WebSocket. Spawns reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Could not reach {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        // The reader only holds a weak handle, so dropping ours closes the socket.
        let reply_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        let membership = self.membership.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let event = match ServerEvent::decode(&bytes) {
                            Ok(event) => event,
                            Err(e) => {
                                log::warn!("Ignoring undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let reply = {
                            let mut replica = replica.lock().await;
                            incorporate(&mut replica, &membership, &event).await
                        };
                        if let (Some(reply), Some(tx)) = (reply, reply_tx.upgrade()) {
                            if let Ok(encoded) = reply.encode() {
                                let _ = tx.send(encoded).await;
                            }
                        }
                        let _ = event_tx.send(ClientEvent::Server(event)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the WebSocket. The local replica and session id are kept so
    /// the session can be resumed after reconnecting.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = message.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn create_notebook(&self, title: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CreateNotebook {
            title: title.to_string(),
            user: self.user.clone(),
        })
        .await
    }

    pub async fn list_notebooks(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::ListNotebooks).await
    }

    /// Join `doc_id` as a new session.
    pub async fn join(&self, doc_id: DocId, token: &str) -> Result<(), ProtocolError> {
        *self.replica.lock().await = None;
        *self.membership.write().await = None;
        self.send(&ClientMessage::Join {
            doc_id,
            user: self.user.clone(),
            token: token.to_string(),
            resume: None,
        })
        .await
    }

    /// Rejoin the previous notebook under the previous session id. The
    /// server answers with a snapshot that replaces the local replica.
    pub async fn resume(&self, token: &str) -> Result<(), ProtocolError> {
        let Some(m) = *self.membership.read().await else {
            return Err(ProtocolError::NotJoined);
        };
        self.send(&ClientMessage::Join {
            doc_id: m.doc_id,
            user: self.user.clone(),
            token: token.to_string(),
            resume: Some(m.session),
        })
        .await
    }

    /// Apply an edit locally and send it. Edits made while disconnected are
    /// refused rather than queued.
    pub async fn edit(&self, kind: OpKind) -> Result<Operation, ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        // Held across the send so operations leave in local order.
        let mut guard = self.replica.lock().await;
        let replica = guard.as_mut().ok_or(ProtocolError::NotJoined)?;
        let op = replica.local(kind)?;
        self.send(&ClientMessage::Edit(op.clone())).await?;
        Ok(op)
    }

    pub async fn move_cursor(&self, cursor: CursorPosition) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Cursor(cursor)).await
    }

    pub async fn execute(&self, cell: CellId, query: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Execute { cell, query: query.to_string() }).await
    }

    pub async fn request_resync(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::RequestResync).await
    }

    pub async fn export(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Export).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Leave).await?;
        *self.replica.lock().await = None;
        *self.membership.write().await = None;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local view of the notebook.
    pub async fn notebook(&self) -> Option<Notebook> {
        self.replica.lock().await.as_ref().map(|r| r.notebook().clone())
    }

    /// Last server version incorporated locally.
    pub async fn version(&self) -> Option<u64> {
        self.replica.lock().await.as_ref().map(Replica::version)
    }

    pub async fn pending_len(&self) -> usize {
        self.replica.lock().await.as_ref().map_or(0, Replica::pending_len)
    }

    pub async fn session(&self) -> Option<SessionId> {
        self.membership.read().await.map(|m| m.session)
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Fold one server event into the replica. Returns the message to send
/// back, if any.
async fn incorporate(
    replica: &mut Option<Replica>,
    membership: &RwLock<Option<Membership>>,
    event: &ServerEvent,
) -> Option<ClientMessage> {
    match event {
        ServerEvent::Joined { session, notebook, last_counter, .. } => {
            *membership.write().await = Some(Membership { doc_id: notebook.id, session: *session });
            *replica = Some(Replica::from_snapshot(*session, notebook.clone(), *last_counter));
            return None;
        }
        ServerEvent::ResyncSnapshot { notebook, .. } => {
            if let Some(r) = replica.as_mut() {
                r.on_resync(notebook.clone());
            }
            return None;
        }
        _ => {}
    }

    let r = replica.as_mut()?;
    let before = r.version();
    match event {
        ServerEvent::Operation { version, op } => r.on_remote(*version, op),
        ServerEvent::Ack { version, .. } => r.on_ack(*version),
        ServerEvent::CellRemoved { timestamp, .. } | ServerEvent::Absorbed { timestamp } => {
            r.on_dropped(*timestamp)
        }
        ServerEvent::ExecutionResult { version, result } => {
            let kind = OpKind::SetOutput { cell: result.cell_id, result: result.clone() };
            let op = Operation::new(r.notebook().id, SYSTEM_SESSION, 0, version.saturating_sub(1), kind);
            r.on_remote(*version, &op);
        }
        _ => return None,
    }

    if r.needs_resync() {
        log::debug!("Replica {} out of sync, requesting snapshot", r.session());
        Some(ClientMessage::RequestResync)
    } else if r.version() > before {
        Some(ClientMessage::Acknowledge { version: r.version() })
    } else {
        None
    }
}
