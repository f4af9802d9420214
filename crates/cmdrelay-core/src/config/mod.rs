//! Configuration parsing and management.
//!
//! The relay daemon reads a single TOML file. Every field has a default so
//! that an empty file is a valid (loopback-only) configuration.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [upstream]
//! base_url = "https://backend.internal"
//!
//! [session]
//! store = "memory"
//!
//! [relay]
//! idle_timeout_secs = 300
//! areas = ["grill", "bar"]
//! ```
//!
//! Backend credentials never appear here; the relay only ever forwards the
//! caller's own session token.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::area::Area;
use crate::permission::identity::DEFAULT_IDENTITY_TIMEOUT;

/// Placeholder substituted with the area in [`UpstreamConfig::stream_path`].
pub const AREA_PLACEHOLDER: &str = "{area}";

/// Maximum number of entries in the area allowlist.
pub const MAX_ALLOWED_AREAS: usize = 64;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend service configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Identity endpoint configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Session cookie configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Stream relay configuration.
    #[serde(default)]
    pub relay: StreamConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.upstream.base_url.trim_end_matches('/');
        let parsed = reqwest::Url::parse(base)
            .map_err(|e| invalid(format!("upstream.base_url {base:?} is not a URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "upstream.base_url must use http or https, got {:?}",
                parsed.scheme()
            )));
        }

        for (key, path) in [
            ("upstream.stream_path", &self.upstream.stream_path),
            ("upstream.login_path", &self.upstream.login_path),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(format!("{key} must start with '/'")));
            }
        }
        if !self.upstream.stream_path.contains(AREA_PLACEHOLDER) {
            return Err(invalid(format!(
                "upstream.stream_path must contain {AREA_PLACEHOLDER}"
            )));
        }
        if self.upstream.connect_timeout_secs == 0 {
            return Err(invalid("upstream.connect_timeout_secs must be > 0"));
        }

        if let Some(url) = &self.identity.url {
            reqwest::Url::parse(url)
                .map_err(|e| invalid(format!("identity.url {url:?} is not a URL: {e}")))?;
        }
        if self.identity.timeout_secs == 0 {
            return Err(invalid("identity.timeout_secs must be > 0"));
        }

        let name = &self.session.cookie_name;
        if name.is_empty() || !name.bytes().all(is_cookie_name_byte) {
            return Err(invalid(format!(
                "session.cookie_name {name:?} is not a valid cookie name"
            )));
        }
        if self.session.max_age_secs == 0 {
            return Err(invalid("session.max_age_secs must be > 0"));
        }

        if self.relay.idle_timeout_secs == Some(0) {
            return Err(invalid(
                "relay.idle_timeout_secs must be > 0 (omit it to disable the idle timeout)",
            ));
        }
        if self.relay.areas.len() > MAX_ALLOWED_AREAS {
            return Err(invalid(format!(
                "relay.areas has {} entries, maximum is {MAX_ALLOWED_AREAS}",
                self.relay.areas.len()
            )));
        }
        for area in &self.relay.areas {
            Area::parse(area).map_err(|e| invalid(format!("relay.areas entry {area:?}: {e}")))?;
        }
        if self
            .relay
            .required_permission
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(invalid("relay.required_permission must not be blank"));
        }

        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the relay listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address of the Prometheus metrics listener.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Whether to serve metrics at all.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            metrics_enabled: true,
        }
    }
}

/// Backend service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the backend, without a trailing slash.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path template of the event source. Must contain `{area}`.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Path of the backend sign-in endpoint.
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// TCP/TLS connect timeout for backend requests, in seconds.
    ///
    /// Streams have no total timeout; only connection setup is bounded.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl UpstreamConfig {
    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// URL of the event source for `area`.
    #[must_use]
    pub fn stream_url(&self, area: &Area) -> String {
        format!(
            "{}{}",
            self.base(),
            self.stream_path.replace(AREA_PLACEHOLDER, area.as_str())
        )
    }

    /// URL of the backend sign-in endpoint.
    #[must_use]
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base(), self.login_path)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stream_path: default_stream_path(),
            login_path: default_login_path(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Identity endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Absolute URL of the identity endpoint. Defaults to
    /// `{upstream.base_url}/auth/me`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Timeout of one identity fetch, in seconds.
    #[serde(default = "default_identity_timeout")]
    pub timeout_secs: u64,
}

impl IdentityConfig {
    /// Resolves the identity URL against the upstream base.
    #[must_use]
    pub fn resolve_url(&self, upstream: &UpstreamConfig) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("{}/auth/me", upstream.base()))
    }

    /// Timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_identity_timeout(),
        }
    }
}

/// Where session credentials are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    /// The token is the cookie value.
    #[default]
    Cookie,
    /// The cookie holds a random id; tokens stay in process memory.
    Memory,
}

/// Session cookie configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Name of the session cookie.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session store implementation.
    #[serde(default)]
    pub store: SessionStoreKind,

    /// Whether to mark the cookie `Secure`.
    #[serde(default = "default_true")]
    pub secure_cookie: bool,

    /// Cookie lifetime in seconds.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl SessionConfig {
    /// Cookie lifetime as a [`Duration`].
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            store: SessionStoreKind::default(),
            secure_cookie: true,
            max_age_secs: default_max_age(),
        }
    }
}

/// Stream relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Tear a stream down after this many seconds without an upstream
    /// chunk. Unset disables the idle timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Allowed areas. Empty allows every syntactically valid area.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub areas: Vec<String>,

    /// Permission a caller must hold to open a stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,
}

impl StreamConfig {
    /// Idle timeout as a [`Duration`], if configured.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

const fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_stream_path() -> String {
    "/sse/commands/{area}".to_string()
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_identity_timeout() -> u64 {
    DEFAULT_IDENTITY_TIMEOUT.as_secs()
}

fn default_cookie_name() -> String {
    "auth_token".to_string()
}

const fn default_max_age() -> u64 {
    7 * 24 * 60 * 60 // one week
}

const fn is_cookie_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
