//! Cursor and selection presence, coalesced per broadcast interval.
//!
//! ```text
//! Cursor(pos) ──► PresenceCoalescer::update()   (latest per session wins)
//!                        │
//!        ticker (33ms) ──┤ take()
//!                        ▼
//!              ServerEvent::Presence ──► room (all except the mover)
//! ```
//!
//! Presence is best-effort: a cursor that moves five times within one
//! interval is broadcast once, at its last position. Nothing is queued
//! past the next flush.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use folio_core::SessionId;

use crate::protocol::{CursorPosition, UserIdentity};

// ───────────────────────────────────────────────────────────────────
// Pending updates
// ───────────────────────────────────────────────────────────────────

/// A cursor update waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub session: SessionId,
    pub user: UserIdentity,
    pub cursor: CursorPosition,
}

/// Latest-wins buffer of cursor updates for one document.
#[derive(Debug)]
pub struct PresenceCoalescer {
    pending: HashMap<SessionId, PresenceUpdate>,
    /// Last position actually broadcast per session.
    published: HashMap<SessionId, CursorPosition>,
    /// Updates replaced before they were flushed.
    coalesced: u64,
    last_flush: Instant,
    interval: Duration,
}

impl PresenceCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            published: HashMap::new(),
            coalesced: 0,
            last_flush: Instant::now(),
            interval,
        }
    }

    /// Record a cursor move. Returns false when the position is already the
    /// published one and nothing needs to be sent.
    pub fn update(&mut self, session: SessionId, user: UserIdentity, cursor: CursorPosition) -> bool {
        if self.published.get(&session) == Some(&cursor) {
            // A pending move away and back cancels out.
            if self.pending.remove(&session).is_some() {
                self.coalesced += 1;
            }
            return false;
        }
        let update = PresenceUpdate { session, user, cursor };
        if self.pending.insert(session, update).is_some() {
            self.coalesced += 1;
        }
        true
    }

    /// Forget a session that left.
    pub fn remove(&mut self, session: &SessionId) {
        self.pending.remove(session);
        self.published.remove(session);
    }

    /// Whether an interval has elapsed since the last flush.
    pub fn is_due(&self) -> bool {
        self.last_flush.elapsed() >= self.interval
    }

    /// Drain pending updates, ordered by session for deterministic fan-out.
    pub fn take(&mut self) -> Vec<PresenceUpdate> {
        self.last_flush = Instant::now();
        let mut updates: Vec<PresenceUpdate> = self.pending.drain().map(|(_, u)| u).collect();
        updates.sort_by_key(|u| u.session);
        for update in &updates {
            self.published.insert(update.session, update.cursor);
        }
        updates
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Last published cursor of every session, for late joiners.
    pub fn published(&self) -> Vec<(SessionId, CursorPosition)> {
        let mut all: Vec<_> = self.published.iter().map(|(s, c)| (*s, *c)).collect();
        all.sort_by_key(|(s, _)| *s);
        all
    }
}

// ───────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn caret(offset: usize) -> CursorPosition {
        CursorPosition::caret(Uuid::from_u128(7), offset)
    }

    #[test]
    fn test_latest_cursor_wins() {
        let mut presence = PresenceCoalescer::new(Duration::from_millis(33));
        let session = Uuid::new_v4();
        let user = UserIdentity::new("Alice");

        for offset in 0..5 {
            assert!(presence.update(session, user.clone(), caret(offset)));
        }
        assert_eq!(presence.pending_len(), 1);
        assert_eq!(presence.coalesced(), 4);

        let flushed = presence.take();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].cursor, caret(4));
        assert_eq!(presence.pending_len(), 0);
    }

    #[test]
    fn test_unchanged_cursor_not_resent() {
        let mut presence = PresenceCoalescer::new(Duration::from_millis(33));
        let session = Uuid::new_v4();
        let user = UserIdentity::new("Bob");

        presence.update(session, user.clone(), caret(3));
        presence.take();
        assert!(!presence.update(session, user.clone(), caret(3)));
        assert!(presence.take().is_empty());

        // Moving away then back before a flush sends nothing.
        presence.update(session, user.clone(), caret(9));
        presence.update(session, user, caret(3));
        assert!(presence.take().is_empty());
    }

    #[test]
    fn test_one_update_per_session() {
        let mut presence = PresenceCoalescer::new(Duration::from_millis(33));
        let a = Uuid::from_u128(2);
        let b = Uuid::from_u128(1);
        presence.update(a, UserIdentity::new("A"), caret(1));
        presence.update(b, UserIdentity::new("B"), caret(2));
        presence.update(a, UserIdentity::new("A"), caret(5));

        let flushed = presence.take();
        let sessions: Vec<SessionId> = flushed.iter().map(|u| u.session).collect();
        assert_eq!(sessions, vec![b, a]);
        assert_eq!(presence.published().len(), 2);
    }

    #[test]
    fn test_remove_session() {
        let mut presence = PresenceCoalescer::new(Duration::from_millis(33));
        let session = Uuid::new_v4();
        presence.update(session, UserIdentity::new("Carol"), caret(0));
        presence.remove(&session);
        assert!(presence.take().is_empty());
        assert!(presence.published().is_empty());
    }

    #[test]
    fn test_is_due_after_interval() {
        let mut presence = PresenceCoalescer::new(Duration::from_millis(5));
        presence.take();
        assert!(!presence.is_due());
        std::thread::sleep(Duration::from_millis(10));
        assert!(presence.is_due());
        assert_eq!(presence.interval(), Duration::from_millis(5));
    }
}
