//! In-memory session store.
//!
//! The browser cookie carries a random session id; the bearer token stays
//! in a process-local table and never leaves the relay. Sessions do not
//! survive a restart.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use cmdrelay_core::SessionCredential;
use cmdrelay_core::config::SessionConfig;
use tracing::debug;
use uuid::Uuid;

use super::{CookieDirective, CookiePolicy, SessionError, SessionStore};

/// Upper bound on live sessions held in memory.
pub const MAX_SESSIONS: usize = 100_000;

struct Entry {
    credential: SessionCredential,
    issued_at: Instant,
}

/// Session store backed by a `RwLock<HashMap>`.
pub struct MemorySessionStore {
    policy: CookiePolicy,
    ttl: Duration,
    max_sessions: usize,
    sessions: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    /// Creates an empty store from session configuration.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            policy: CookiePolicy::from_config(config),
            ttl: config.max_age(),
            max_sessions: MAX_SESSIONS,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides the session capacity.
    #[must_use]
    pub const fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Number of live entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when no session is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn resolve(&self, headers: &HeaderMap) -> Option<SessionCredential> {
        let id = self.policy.read(headers)?;
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get(id)?;
        if entry.issued_at.elapsed() >= self.ttl {
            debug!("session expired");
            return None;
        }
        Some(entry.credential.clone())
    }

    fn invalidate(&self, headers: &HeaderMap) -> CookieDirective {
        if let Some(id) = self.policy.read(headers) {
            let removed = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id)
                .is_some();
            debug!(removed, "session invalidated");
        }
        self.policy.expire()
    }

    fn establish(&self, credential: SessionCredential) -> Result<CookieDirective, SessionError> {
        let id = Uuid::new_v4().simple().to_string();
        let directive = self.policy.set(&id)?;

        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.len() >= self.max_sessions {
            let ttl = self.ttl;
            sessions.retain(|_, entry| entry.issued_at.elapsed() < ttl);
            if sessions.len() >= self.max_sessions {
                return Err(SessionError::CapacityExceeded {
                    max: self.max_sessions,
                });
            }
        }
        sessions.insert(
            id,
            Entry {
                credential,
                issued_at: Instant::now(),
            },
        );
        Ok(directive)
    }
}
