//! Cookie-backed session store: the bearer token is the cookie value.

use axum::http::HeaderMap;
use cmdrelay_core::SessionCredential;
use cmdrelay_core::config::SessionConfig;

use super::{CookieDirective, CookiePolicy, SessionError, SessionStore};

/// Stateless store that keeps the token in an `HttpOnly` cookie.
#[derive(Debug, Clone)]
pub struct CookieSessionStore {
    policy: CookiePolicy,
}

impl CookieSessionStore {
    /// Creates a store from session configuration.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            policy: CookiePolicy::from_config(config),
        }
    }
}

impl SessionStore for CookieSessionStore {
    fn resolve(&self, headers: &HeaderMap) -> Option<SessionCredential> {
        self.policy.read(headers).and_then(SessionCredential::new)
    }

    fn invalidate(&self, _headers: &HeaderMap) -> CookieDirective {
        self.policy.expire()
    }

    fn establish(&self, credential: SessionCredential) -> Result<CookieDirective, SessionError> {
        self.policy.set(credential.expose())
    }
}
