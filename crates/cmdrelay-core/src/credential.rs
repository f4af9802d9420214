//! Session credentials.
//!
//! A [`SessionCredential`] is the opaque bearer token issued by the backend
//! at sign-in. It is owned by the session store, read on every protected
//! request and forwarded to the backend as `Authorization: Bearer <token>`.
//!
//! # Security Notes
//!
//! - The token is wrapped in a [`SecretString`]; `Debug` output is redacted
//! - Blank tokens are rejected at construction, so a credential that exists
//!   is always presentable to the backend

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Opaque bearer token proving an authenticated session.
#[derive(Clone)]
pub struct SessionCredential {
    token: SecretString,
}

impl SessionCredential {
    /// Wraps a raw token.
    ///
    /// Returns `None` when the token is empty or only whitespace.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return None;
        }
        Some(Self {
            token: SecretString::from(token),
        })
    }

    /// Returns the raw token.
    ///
    /// Callers must not log or persist the returned value outside the
    /// session store.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    /// Formats the value of an `Authorization` header for this credential.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCredential([REDACTED])")
    }
}
