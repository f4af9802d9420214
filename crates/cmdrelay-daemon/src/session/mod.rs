//! Session store.
//!
//! The session store owns the caller's bearer credential between requests.
//! It is injected into the router as `Arc<dyn SessionStore>`; nothing reads
//! session state ambiently.
//!
//! # Architecture
//!
//! ```text
//!            +----------------------+
//! request -->| SessionStore::resolve|--> Option<SessionCredential>
//!            +----------------------+
//!                 |            |
//!      CookieSessionStore   MemorySessionStore
//!      (cookie = token)     (cookie = session id -> token table)
//! ```
//!
//! # Invariants
//!
//! - `resolve` performs no network I/O and never blocks on another request
//! - `invalidate` is idempotent and always yields a clearing `Set-Cookie`
//! - Credentials never appear in logs or `Debug` output

mod cookie;
mod memory;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use cmdrelay_core::SessionCredential;
use cmdrelay_core::config::SessionConfig;
pub use cookie::CookieSessionStore;
pub use memory::{MAX_SESSIONS, MemorySessionStore};
use thiserror::Error;

/// Errors from establishing a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The token contains bytes that cannot be carried in a cookie.
    #[error("credential is not representable as a cookie value")]
    UnrepresentableToken,

    /// The store is at capacity.
    #[error("session table full ({max} sessions)")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
}

/// A `Set-Cookie` header value produced by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieDirective(HeaderValue);

impl CookieDirective {
    /// Appends the directive to `headers`.
    pub fn apply(self, headers: &mut HeaderMap) {
        headers.append(SET_COOKIE, self.0);
    }

    /// The raw header value.
    #[must_use]
    pub const fn header_value(&self) -> &HeaderValue {
        &self.0
    }
}

/// Resolves, clears and establishes session credentials.
pub trait SessionStore: Send + Sync + 'static {
    /// Reads the credential carried by the request, if any.
    fn resolve(&self, headers: &HeaderMap) -> Option<SessionCredential>;

    /// Forgets the request's credential and returns the directive that
    /// expires the cookie. Safe to call when no credential exists.
    fn invalidate(&self, headers: &HeaderMap) -> CookieDirective;

    /// Persists a freshly issued credential.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the credential cannot be stored.
    fn establish(&self, credential: SessionCredential) -> Result<CookieDirective, SessionError>;
}

/// Cookie attributes shared by both store implementations.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    name: String,
    secure: bool,
    max_age_secs: u64,
    expire: HeaderValue,
}

impl CookiePolicy {
    /// Builds the policy from configuration.
    ///
    /// The cookie name is validated when the configuration is loaded.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        let secure = if config.secure_cookie { "; Secure" } else { "" };
        let expire = format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{secure}",
            config.cookie_name
        );
        Self {
            name: config.cookie_name.clone(),
            secure: config.secure_cookie,
            max_age_secs: config.max_age_secs,
            expire: HeaderValue::from_str(&expire)
                .unwrap_or_else(|_| HeaderValue::from_static("session=; Path=/; Max-Age=0")),
        }
    }

    /// Name of the session cookie.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directive that sets the cookie to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnrepresentableToken`] if `value` contains
    /// bytes outside the cookie-octet grammar.
    pub fn set(&self, value: &str) -> Result<CookieDirective, SessionError> {
        if value.is_empty() || !value.bytes().all(is_cookie_octet) {
            return Err(SessionError::UnrepresentableToken);
        }
        let secure = if self.secure { "; Secure" } else { "" };
        let raw = format!(
            "{}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{secure}",
            self.name, self.max_age_secs
        );
        let mut header =
            HeaderValue::from_str(&raw).map_err(|_| SessionError::UnrepresentableToken)?;
        header.set_sensitive(true);
        Ok(CookieDirective(header))
    }

    /// Directive that expires the cookie.
    #[must_use]
    pub fn expire(&self) -> CookieDirective {
        CookieDirective(self.expire.clone())
    }

    /// Extracts this policy's cookie from the request's `Cookie` headers.
    #[must_use]
    pub fn read<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.name)
            .map(|(_, value)| value.trim_matches('"'))
            .filter(|value| !value.is_empty())
    }
}

/// `cookie-octet` from RFC 6265: printable ASCII except `"` `,` `;` `\`.
const fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}
