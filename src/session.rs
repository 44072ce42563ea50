//! Session store.
//!
//! Sessions live in an in-memory map keyed by id. Each entry sits behind its
//! own async mutex: a turn holds the session's lock from context assembly to
//! the window append, so turns on one session are serialized while turns on
//! different sessions run in parallel.
//!
//! The map itself uses a `std::sync::RwLock` and is only held for lookups and
//! inserts, never across an `.await`.
//!
//! Sessions idle for longer than a configured limit are dropped by
//! [`SessionStore::evict_idle`]. An evicted session is flagged before it
//! leaves the map, so a caller that fetched its handle just before the sweep
//! sees the flag after locking and starts over with a fresh entry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::BusyPolicy;
use crate::error::TurnError;
use crate::window::ConversationWindow;

/// One conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub window: ConversationWindow,
    pub created_at: DateTime<Utc>,
    /// Committed turns since creation, including compacted ones.
    pub turns: u64,
    /// Last time a turn or clear took this session.
    pub last_used: Instant,
    /// Removed from the store; holders must not write to it.
    pub evicted: bool,
}

impl Session {
    pub fn new(id: impl Into<String>, system_prompt: &str) -> Self {
        Self {
            id: id.into(),
            window: ConversationWindow::new(system_prompt),
            created_at: Utc::now(),
            turns: 0,
            last_used: Instant::now(),
            evicted: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Arena of sessions with one mutex per entry.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Return the session `id`, creating it with `system_prompt` if absent.
    pub fn get_or_create(&self, id: &str, system_prompt: &str) -> SessionHandle {
        if let Some(handle) = self.get(id) {
            return handle;
        }
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(session = id, "created session");
                Arc::new(Mutex::new(Session::new(id, system_prompt)))
            })
            .clone()
    }

    /// Drop every session unused for at least `max_idle`. Sessions with a
    /// turn in flight are kept. Returns the evicted ids.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|id, handle| {
            let Ok(mut session) = handle.try_lock() else {
                return true;
            };
            if now.saturating_duration_since(session.last_used) < max_idle {
                return true;
            }
            session.evicted = true;
            tracing::info!(
                session = %id,
                turns = session.turns,
                created_at = %session.created_at,
                "evicted idle session"
            );
            evicted.push(id.clone());
            false
        });
        evicted.sort();
        evicted
    }

    /// Ids of all sessions, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Take exclusive ownership of session `id` for one turn.
///
/// With [`BusyPolicy::Wait`] this waits for an in-flight turn to finish;
/// with [`BusyPolicy::Reject`] it fails immediately.
pub async fn acquire(
    id: &str,
    handle: SessionHandle,
    policy: BusyPolicy,
) -> Result<OwnedMutexGuard<Session>, TurnError> {
    match policy {
        BusyPolicy::Wait => Ok(handle.lock_owned().await),
        BusyPolicy::Reject => handle.try_lock_owned().map_err(|_| {
            tracing::info!(session = id, "rejecting turn, session busy");
            TurnError::SessionBusy(id.to_string())
        }),
    }
}
