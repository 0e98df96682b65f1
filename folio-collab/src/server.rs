//! WebSocket transport for the session engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocumentStore (RocksDB)
//!             ├── NotebookServer ── SessionEngine ── SessionBroker (rooms)
//! Client B ──┘        │                └── ExecutionScheduler ── QuerySandbox
//!                     │
//!          one task per connection:
//!            select! { ws frame, room event, heartbeat }
//! ```
//!
//! Every frame is a bincode-encoded [`ClientMessage`] or [`ServerEvent`].
//! Catalog messages work before `Join`; everything else is scoped to the
//! joined notebook.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broker::StreamItem;
use crate::engine::{Connection, SessionEngine};
use crate::error::EngineError;
use crate::protocol::{ClientMessage, ErrorKind, ProtocolError, ServerEvent};

type Sender = SplitSink<WebSocketStream<TcpStream>, Message>;
type Receiver = SplitStream<WebSocketStream<TcpStream>>;
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The notebook server.
pub struct NotebookServer {
    engine: Arc<SessionEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl NotebookServer {
    pub fn new(engine: Arc<SessionEngine>) -> Self {
        Self {
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.engine.config().server.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Notebook server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SessionEngine>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn: Option<Connection> = None;
        let result = Self::session_loop(&engine, &mut ws_sender, &mut ws_receiver, &mut conn, &stats).await;

        // Cleanup runs whatever ended the loop.
        if let Some(c) = conn.take() {
            engine.disconnect(&c.session).await;
        }
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    async fn session_loop(
        engine: &SessionEngine,
        ws_sender: &mut Sender,
        ws_receiver: &mut Receiver,
        conn: &mut Option<Connection>,
        stats: &RwLock<ServerStats>,
    ) -> ConnectionResult {
        let heartbeat = Duration::from_secs(engine.config().server.heartbeat_interval_secs.max(1));
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let bytes: Vec<u8> = data.into();
                            match ClientMessage::decode(&bytes) {
                                Ok(message) => Self::dispatch(engine, conn, message, ws_sender).await?,
                                Err(e) => {
                                    log::warn!("Failed to decode message: {e}");
                                    send(ws_sender, &ServerEvent::error(ErrorKind::Protocol, e.to_string())).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            let e = ProtocolError::InvalidMessageType;
                            send(ws_sender, &ServerEvent::error(ErrorKind::Protocol, e.to_string())).await?;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            ws_sender.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            if let Some(c) = conn.as_ref() {
                                engine.broker().touch(&c.session).await;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error: {e}");
                            break;
                        }
                    }
                }

                // Outgoing room event
                item = async {
                    match conn.as_mut() {
                        Some(c) => c.events.recv().await,
                        // Not joined yet; wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(c) = conn.as_mut() else { continue };
                    match item {
                        StreamItem::Event(event) => {
                            if let ServerEvent::ResyncSnapshot { version, .. } = &*event {
                                c.events.skip_through(*version);
                            }
                            send(ws_sender, &event).await?;
                            if matches!(&*event, ServerEvent::Error { kind: ErrorKind::Disconnected, .. }) {
                                break;
                            }
                        }
                        StreamItem::Lagged(_) => {
                            let (notebook, version) = engine.resync(&c.session).await?;
                            c.events.skip_through(version);
                            send(ws_sender, &ServerEvent::ResyncSnapshot { notebook, version }).await?;
                        }
                        StreamItem::Closed => break,
                    }
                }

                _ = ping.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Handle one client message. Failures are reported to the client and,
    /// where the client's state can no longer be trusted, followed by a
    /// snapshot.
    async fn dispatch(
        engine: &SessionEngine,
        conn: &mut Option<Connection>,
        message: ClientMessage,
        ws_sender: &mut Sender,
    ) -> ConnectionResult {
        let replies = match Self::apply_message(engine, conn, message).await {
            Ok(replies) => replies,
            Err(e) => {
                let mut replies = vec![ServerEvent::error(e.kind(), e.to_string())];
                if let (Some(c), true) = (conn.as_mut(), e.requires_resync()) {
                    let (notebook, version) = engine.resync(&c.session).await?;
                    c.events.skip_through(version);
                    replies.push(ServerEvent::ResyncSnapshot { notebook, version });
                }
                replies
            }
        };
        for event in &replies {
            send(ws_sender, event).await?;
        }
        Ok(())
    }

    async fn apply_message(
        engine: &SessionEngine,
        conn: &mut Option<Connection>,
        message: ClientMessage,
    ) -> Result<Vec<ServerEvent>, EngineError> {
        match message {
            ClientMessage::CreateNotebook { title, user } => {
                let id = engine.create_notebook(&title, &user).await?;
                return Ok(vec![ServerEvent::NotebookCreated { id }]);
            }
            ClientMessage::ListNotebooks => {
                return Ok(vec![ServerEvent::Notebooks(engine.list_notebooks().await)]);
            }
            ClientMessage::Join { doc_id, user, token, resume } => {
                // Joining another notebook leaves the current one.
                if let Some(previous) = conn.take() {
                    engine.disconnect(&previous.session).await;
                }
                let joined = engine.connect(doc_id, user, &token, resume).await?;
                let first = joined.first.clone();
                *conn = Some(joined);
                return Ok(vec![first]);
            }
            ClientMessage::Ping => {
                if let Some(c) = conn.as_ref() {
                    engine.broker().touch(&c.session).await;
                }
                return Ok(vec![ServerEvent::Pong]);
            }
            _ => {}
        }

        let Some(c) = conn.as_mut() else {
            return Err(ProtocolError::NotJoined.into());
        };
        let session = c.session;
        match message {
            ClientMessage::Edit(op) => {
                engine.submit_operation(&session, op).await?;
                Ok(Vec::new())
            }
            ClientMessage::Cursor(cursor) => {
                engine.update_cursor(&session, cursor).await?;
                Ok(Vec::new())
            }
            ClientMessage::Execute { cell, query } => {
                engine.submit_execution(&session, cell, &query).await?;
                Ok(Vec::new())
            }
            ClientMessage::Acknowledge { version } => {
                engine.acknowledge(&session, version).await?;
                Ok(Vec::new())
            }
            ClientMessage::RequestResync => {
                let (notebook, version) = engine.resync(&session).await?;
                c.events.skip_through(version);
                Ok(vec![ServerEvent::ResyncSnapshot { notebook, version }])
            }
            ClientMessage::Export => {
                let who = engine.session(&session).await?.user.name;
                let notebook = engine.export_snapshot(&c.doc_id, &who).await?;
                Ok(vec![ServerEvent::Exported { notebook }])
            }
            ClientMessage::Leave => {
                engine.disconnect(&session).await;
                *conn = None;
                Ok(Vec::new())
            }
            ClientMessage::CreateNotebook { .. }
            | ClientMessage::ListNotebooks
            | ClientMessage::Join { .. }
            | ClientMessage::Ping => Ok(Vec::new()),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }
}

async fn send(ws_sender: &mut Sender, event: &ServerEvent) -> ConnectionResult {
    let encoded = event.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    log::trace!("Sent {}", event.name());
    Ok(())
}
