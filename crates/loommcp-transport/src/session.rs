//! Session store for the Streamable HTTP transport.
//!
//! A session is created on `initialize` and addressed by the
//! `Mcp-Session-Id` header thereafter. Each session keeps a bounded ring of
//! outbound SSE events with monotonically increasing ids; a reconnecting
//! client replays from `Last-Event-Id`, and a replay point older than the
//! ring means the stream is broken and the client must re-initialize.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Session store tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are removed by housekeeping.
    pub session_timeout: Duration,
    /// Ring capacity per session; 0 disables replay entirely.
    pub max_stored_events: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            max_stored_events: 256,
        }
    }
}

/// One event retained for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Monotonic per-session id.
    pub id: u64,
    /// SSE data payload.
    pub payload: String,
}

/// Result of a replay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// Every retained event after the requested id, in order.
    Events(Vec<StoredEvent>),
    /// The requested id predates the ring; the client must re-initialize.
    Gap,
}

struct SessionState {
    created_at: Instant,
    last_seen: Instant,
    next_event_id: u64,
    events: VecDeque<StoredEvent>,
}

impl SessionState {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_seen: now,
            next_event_id: 1,
            events: VecDeque::new(),
        }
    }
}

/// Map of live sessions with per-session event rings.
pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<SessionState>>>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session and return its id.
    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions
            .write()
            .insert(id, Arc::new(Mutex::new(SessionState::new(Instant::now()))));
        debug!(session = %id, "session created");
        id
    }

    /// Refresh a session's idle clock. Returns whether the session exists.
    pub fn touch(&self, id: &Uuid) -> bool {
        match self.lookup(id) {
            Some(state) => {
                state.lock().last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Whether the session exists.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Append an outbound event; returns its id, or `None` for an unknown
    /// session. The oldest event is discarded when the ring is full.
    pub fn append_event(&self, id: &Uuid, payload: impl Into<String>) -> Option<u64> {
        let state = self.lookup(id)?;
        let mut state = state.lock();
        let event_id = state.next_event_id;
        state.next_event_id += 1;
        state.last_seen = Instant::now();
        if self.config.max_stored_events > 0 {
            if state.events.len() >= self.config.max_stored_events {
                state.events.pop_front();
            }
            state.events.push_back(StoredEvent {
                id: event_id,
                payload: payload.into(),
            });
        }
        Some(event_id)
    }

    /// Replay events with id greater than `last_event_id`.
    ///
    /// Returns `None` for an unknown session. A `last_event_id` older than
    /// the oldest retained event yields [`Replay::Gap`]; with a ring size
    /// of 0, replay is always a gap.
    pub fn replay(&self, id: &Uuid, last_event_id: u64) -> Option<Replay> {
        let state = self.lookup(id)?;
        let state = state.lock();
        if self.config.max_stored_events == 0 {
            return Some(Replay::Gap);
        }
        let covered_from = match state.events.front() {
            Some(oldest) => oldest.id,
            // An empty ring covers exactly the present position.
            None => state.next_event_id,
        };
        if last_event_id + 1 < covered_from {
            return Some(Replay::Gap);
        }
        let events = state
            .events
            .iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect();
        Some(Replay::Events(events))
    }

    /// Remove a session and drop its ring. Returns whether it existed.
    pub fn destroy(&self, id: &Uuid) -> bool {
        let existed = self.sessions.write().remove(id).is_some();
        if existed {
            debug!(session = %id, "session destroyed");
        }
        existed
    }

    /// Remove sessions idle beyond the configured timeout; returns how many
    /// were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.session_timeout;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, state| now.duration_since(state.lock().last_seen) <= timeout);
        before - sessions.len()
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of a session since creation, when it exists.
    pub fn age(&self, id: &Uuid) -> Option<Duration> {
        let state = self.lookup(id)?;
        let created_at = state.lock().created_at;
        Some(created_at.elapsed())
    }

    fn lookup(&self, id: &Uuid) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().get(id).cloned()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_events: usize) -> SessionStore {
        SessionStore::new(SessionConfig {
            session_timeout: Duration::from_secs(60),
            max_stored_events: max_events,
        })
    }

    #[test]
    fn event_ids_are_monotonic() {
        let store = store(16);
        let id = store.create();
        assert_eq!(store.append_event(&id, "a"), Some(1));
        assert_eq!(store.append_event(&id, "b"), Some(2));
        assert_eq!(store.append_event(&id, "c"), Some(3));
    }

    #[test]
    fn replay_returns_events_after_cursor_in_order() {
        let store = store(16);
        let id = store.create();
        for payload in ["one", "two", "three"] {
            store.append_event(&id, payload);
        }
        let Replay::Events(events) = store.replay(&id, 1).unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 2);
        assert_eq!(events[1].id, 3);
    }

    #[test]
    fn replay_past_the_ring_is_a_gap() {
        let store = store(2);
        let id = store.create();
        for n in 0..5 {
            store.append_event(&id, format!("e{n}"));
        }
        // Ring holds events 4 and 5; asking to resume from 1 means events
        // 2 and 3 are gone.
        assert_eq!(store.replay(&id, 1).unwrap(), Replay::Gap);
        // Resuming from 3 is fine: everything after 3 is retained.
        let Replay::Events(events) = store.replay(&id, 3).unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn up_to_date_cursor_replays_nothing() {
        let store = store(4);
        let id = store.create();
        store.append_event(&id, "a");
        assert_eq!(store.replay(&id, 1).unwrap(), Replay::Events(Vec::new()));
        // A cursor beyond the newest event also yields nothing.
        assert_eq!(store.replay(&id, 99).unwrap(), Replay::Events(Vec::new()));
    }

    #[test]
    fn zero_capacity_ring_always_gaps() {
        let store = store(0);
        let id = store.create();
        store.append_event(&id, "dropped");
        assert_eq!(store.replay(&id, 0).unwrap(), Replay::Gap);
        assert_eq!(store.replay(&id, 1).unwrap(), Replay::Gap);
    }

    #[test]
    fn unknown_session_is_none() {
        let store = store(4);
        let ghost = Uuid::new_v4();
        assert!(store.replay(&ghost, 0).is_none());
        assert!(store.append_event(&ghost, "x").is_none());
        assert!(!store.touch(&ghost));
        assert!(!store.destroy(&ghost));
    }

    #[test]
    fn destroy_drops_the_ring() {
        let store = store(4);
        let id = store.create();
        store.append_event(&id, "a");
        assert!(store.destroy(&id));
        assert!(store.replay(&id, 0).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn cleanup_removes_idle_sessions() {
        let store = SessionStore::new(SessionConfig {
            session_timeout: Duration::from_millis(10),
            max_stored_events: 4,
        });
        let stale = store.create();
        std::thread::sleep(Duration::from_millis(30));
        let fresh = store.create();
        assert_eq!(store.cleanup_expired(), 1);
        assert!(!store.contains(&stale));
        assert!(store.contains(&fresh));
    }
}
