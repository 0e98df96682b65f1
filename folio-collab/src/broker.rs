//! Session membership and per-document event delivery.
//!
//! The broker owns one [`BroadcastGroup`] per open notebook and the table
//! of connected sessions. Each session reads its room through an
//! [`EventStream`], which filters envelopes addressed elsewhere and hides
//! sequenced events already covered by a resync snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use folio_core::{DocId, SessionId};
use tokio::sync::{broadcast, RwLock};

use crate::broadcast::{BroadcastGroup, Envelope, Recipients, RoomManager};
use crate::config::BrokerConfig;
use crate::error::EngineError;
use crate::protocol::{CursorPosition, ServerEvent, UserIdentity};

/// A connected session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub doc_id: DocId,
    pub user: UserIdentity,
    pub token: String,
    pub connected_at: Instant,
}

/// What a session's stream yields next.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Arc<ServerEvent>),
    /// The receiver fell behind and `n` envelopes were lost; the session
    /// needs a snapshot.
    Lagged(u64),
    Closed,
}

/// Ordered events for one session.
pub struct EventStream {
    session: SessionId,
    rx: broadcast::Receiver<Envelope>,
    room: Arc<BroadcastGroup>,
    /// Sequenced events at or below this version are already reflected in
    /// a snapshot the session holds.
    floor: u64,
}

impl EventStream {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub async fn recv(&mut self) -> StreamItem {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if !envelope.recipients.includes(&self.session) || self.covered(&envelope.event) {
                        continue;
                    }
                    return StreamItem::Event(envelope.event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.room.record_lag(n);
                    log::warn!("Session {} lagged by {n} events", self.session);
                    return StreamItem::Lagged(n);
                }
                Err(broadcast::error::RecvError::Closed) => return StreamItem::Closed,
            }
        }
    }

    /// Drop sequenced events up to and including `version`.
    pub fn skip_through(&mut self, version: u64) {
        self.floor = self.floor.max(version);
    }

    fn covered(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Operation { version, .. }
            | ServerEvent::Ack { version, .. }
            | ServerEvent::ExecutionResult { version, .. }
            | ServerEvent::ResyncSnapshot { version, .. } => *version <= self.floor,
            _ => false,
        }
    }
}

pub struct SessionBroker {
    rooms: RoomManager,
    sessions: RwLock<HashMap<SessionId, Session>>,
    config: BrokerConfig,
}

impl SessionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            rooms: RoomManager::new(config.broadcast_capacity, config.presence_interval),
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Join `session` to the room of `doc_id`. Events broadcast after this
    /// returns are visible on the stream.
    pub async fn connect(
        &self,
        doc_id: DocId,
        session: SessionId,
        user: UserIdentity,
        token: impl Into<String>,
    ) -> Result<EventStream, EngineError> {
        let room = self.rooms.get_or_create(doc_id).await;
        if room.peer_count().await >= self.config.max_sessions_per_document {
            self.rooms.remove_if_empty(&doc_id).await;
            return Err(EngineError::SessionLimit {
                doc_id,
                max: self.config.max_sessions_per_document,
            });
        }

        let rx = room.add_peer(session, user.clone()).await;
        self.sessions.write().await.insert(
            session,
            Session {
                id: session,
                doc_id,
                user: user.clone(),
                token: token.into(),
                connected_at: Instant::now(),
            },
        );

        room.broadcast(ServerEvent::SessionJoined { session, user: user.clone() }, Some(session));
        room.broadcast(ServerEvent::Participants { count: room.peer_count().await }, None);

        // Late joiners see where everyone already is.
        let published = room.presence().lock().await.published();
        for (other, cursor) in published {
            if other == session {
                continue;
            }
            if let Some(member) = room.member(&other).await {
                room.send_to(session, ServerEvent::Presence { session: other, user: member.user, cursor });
            }
        }

        log::info!("Session {session} ({}) joined notebook {doc_id}", user.name);
        Ok(EventStream {
            session,
            rx,
            room,
            floor: 0,
        })
    }

    /// Remove a session. Document state is untouched.
    pub async fn disconnect(&self, session: &SessionId) -> Option<Session> {
        let removed = self.sessions.write().await.remove(session)?;
        if let Some(room) = self.rooms.get(&removed.doc_id).await {
            room.remove_peer(session).await;
            room.broadcast(ServerEvent::SessionLeft { session: *session }, None);
            room.broadcast(ServerEvent::Participants { count: room.peer_count().await }, None);
        }
        if self.rooms.remove_if_empty(&removed.doc_id).await {
            log::debug!("Closed empty room for notebook {}", removed.doc_id);
        }
        log::info!("Session {session} left notebook {}", removed.doc_id);
        Some(removed)
    }

    /// Fan `event` out to the room, optionally skipping one session.
    pub async fn broadcast(&self, doc_id: &DocId, event: ServerEvent, exclude: Option<SessionId>) -> usize {
        match self.rooms.get(doc_id).await {
            Some(room) => room.broadcast(event, exclude),
            None => 0,
        }
    }

    /// Address one session through its room, in order with other events.
    pub async fn send_to(&self, doc_id: &DocId, session: SessionId, event: ServerEvent) -> usize {
        match self.rooms.get(doc_id).await {
            Some(room) => room.send(Envelope::new(Recipients::Only(session), event)),
            None => 0,
        }
    }

    pub async fn room(&self, doc_id: &DocId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.get(doc_id).await
    }

    pub async fn session(&self, session: &SessionId) -> Option<Session> {
        self.sessions.read().await.get(session).cloned()
    }

    pub async fn is_connected(&self, session: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn participants(&self, doc_id: &DocId) -> Vec<(SessionId, UserIdentity)> {
        match self.rooms.get(doc_id).await {
            Some(room) => room.peers().await,
            None => Vec::new(),
        }
    }

    /// Record activity for idle reaping.
    pub async fn touch(&self, session: &SessionId) {
        let Some(doc_id) = self.sessions.read().await.get(session).map(|s| s.doc_id) else {
            return;
        };
        if let Some(room) = self.rooms.get(&doc_id).await {
            room.touch(session).await;
        }
    }

    /// Queue a cursor move for the next presence flush.
    pub async fn update_cursor(&self, session: &SessionId, cursor: CursorPosition) -> Result<bool, EngineError> {
        let (doc_id, user) = {
            let sessions = self.sessions.read().await;
            let s = sessions.get(session).ok_or(EngineError::UnknownSession(*session))?;
            (s.doc_id, s.user.clone())
        };
        let Some(room) = self.rooms.get(&doc_id).await else {
            return Err(EngineError::UnknownSession(*session));
        };
        let queued = room.presence().lock().await.update(*session, user, cursor);
        Ok(queued)
    }

    /// Broadcast coalesced cursor updates of every room whose interval has
    /// elapsed. Returns the number of updates sent.
    pub async fn flush_presence(&self) -> usize {
        let mut sent = 0;
        for (_, room) in self.rooms.rooms().await {
            let updates = {
                let mut presence = room.presence().lock().await;
                if presence.pending_len() == 0 || !presence.is_due() {
                    continue;
                }
                presence.take()
            };
            for update in updates {
                let event = ServerEvent::Presence {
                    session: update.session,
                    user: update.user,
                    cursor: update.cursor,
                };
                room.send(Envelope::new(Recipients::AllExcept(update.session), event));
                sent += 1;
            }
        }
        if sent > 0 {
            log::trace!("Flushed {sent} presence updates");
        }
        sent
    }

    /// Sessions with no activity for at least `timeout`.
    pub async fn idle_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        let mut idle = Vec::new();
        for (_, room) in self.rooms.rooms().await {
            idle.extend(room.idle_peers(timeout).await);
        }
        idle
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}
