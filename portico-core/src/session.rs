//! Session storage behind a store trait.
//!
//! The core mandates no persistence backend; the in-memory store below is
//! the reference implementation, with TTL-based expiry. The session
//! middleware (order 450) only needs `load`/`save`/`touch`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "portico_session";

/// Pluggable session persistence.
pub trait SessionStore: Send + Sync + 'static {
    /// Fetch the session data for an id, if the session is alive.
    fn load(&self, session_id: &str) -> Option<Value>;

    /// Persist session data, creating the session when unknown.
    fn save(&self, session_id: &str, data: Value);

    /// Refresh the session's expiry without touching its data.
    fn touch(&self, session_id: &str);

    /// Remove a session eagerly.
    fn remove(&self, session_id: &str);
}

struct Entry {
    data: Value,
    expires_at: Instant,
}

/// In-memory TTL session store.
pub struct InMemorySessionStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> InMemorySessionStore {
        InMemorySessionStore {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop expired sessions; called opportunistically by the middleware.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, session_id: &str) -> Option<Value> {
        let entry = self.entries.get(session_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(session_id);
            return None;
        }
        Some(entry.data.clone())
    }

    fn save(&self, session_id: &str, data: Value) {
        self.entries.insert(
            session_id.to_string(),
            Entry {
                data,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn touch(&self, session_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.expires_at = Instant::now() + self.ttl;
        }
    }

    fn remove(&self, session_id: &str) {
        self.entries.remove(session_id);
    }
}
