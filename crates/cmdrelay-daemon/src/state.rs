//! Shared router state.
//!
//! [`AppState`] is cloned into every handler. Every collaborator is behind
//! an `Arc` so the clone is cheap and tests can substitute fakes for the
//! session store, event source and identity provider.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cmdrelay_core::config::{RelayConfig, SessionStoreKind};
use cmdrelay_core::{Area, AreaError, Requirement};
use tokio::sync::watch;

use crate::identity::{BackendIdentityProvider, IdentityProvider};
use crate::metrics::RelayMetrics;
use crate::session::{CookieSessionStore, MemorySessionStore, SessionStore};
use crate::upstream::{EventSource, HttpEventSource};

/// Relay behaviour derived from configuration.
#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    /// Allowed areas; empty allows any valid area.
    pub areas: HashSet<Area>,
    /// Permission required to open a stream.
    pub required: Option<Requirement>,
    /// Tear-down after this long without an upstream chunk.
    pub idle_timeout: Option<Duration>,
    /// Backend sign-in endpoint.
    pub login_url: String,
}

impl RelaySettings {
    /// Derives settings from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError`] if an allowlisted area is malformed.
    pub fn from_config(config: &RelayConfig) -> Result<Self, AreaError> {
        let areas = config
            .relay
            .areas
            .iter()
            .map(|raw| Area::parse(raw))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self {
            areas,
            required: config
                .relay
                .required_permission
                .clone()
                .map(Requirement::Single),
            idle_timeout: config.relay.idle_timeout(),
            login_url: config.upstream.login_url(),
        })
    }

    /// Returns `true` if `area` may be streamed.
    #[must_use]
    pub fn allows(&self, area: &Area) -> bool {
        self.areas.is_empty() || self.areas.contains(area)
    }
}

/// Broadcasts process shutdown to every pump task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    /// Creates a handle in the running state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a future-producing signal for one task.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Per-task view of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested.
    ///
    /// Never resolves if every [`ShutdownHandle`] is dropped first, since
    /// nothing can request shutdown any more.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State shared by all routes.
#[derive(Clone)]
pub struct AppState {
    /// Session credential store.
    pub sessions: Arc<dyn SessionStore>,
    /// Upstream event source.
    pub events: Arc<dyn EventSource>,
    /// Backend identity lookups.
    pub identity: Arc<dyn IdentityProvider>,
    /// Shared HTTP client for pass-through requests.
    pub http: reqwest::Client,
    /// Relay behaviour.
    pub settings: Arc<RelaySettings>,
    /// Metrics sink.
    pub metrics: RelayMetrics,
    /// Shutdown broadcast.
    pub shutdown: ShutdownHandle,
}

impl AppState {
    /// Wires the production collaborators described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AreaError`] if an allowlisted area is malformed.
    pub fn from_config(
        config: &RelayConfig,
        http: reqwest::Client,
        metrics: RelayMetrics,
        shutdown: ShutdownHandle,
    ) -> Result<Self, AreaError> {
        let sessions: Arc<dyn SessionStore> = match config.session.store {
            SessionStoreKind::Cookie => Arc::new(CookieSessionStore::new(&config.session)),
            SessionStoreKind::Memory => Arc::new(MemorySessionStore::new(&config.session)),
        };
        let events = Arc::new(HttpEventSource::new(http.clone(), config.upstream.clone()));
        let identity = Arc::new(BackendIdentityProvider::new(
            http.clone(),
            config.identity.resolve_url(&config.upstream),
            config.identity.timeout(),
        ));

        Ok(Self {
            sessions,
            events,
            identity,
            http,
            settings: Arc::new(RelaySettings::from_config(config)?),
            metrics,
            shutdown,
        })
    }

    /// Replaces the session store.
    #[must_use]
    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Replaces the event source.
    #[must_use]
    pub fn with_event_source(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the identity provider.
    #[must_use]
    pub fn with_identity_provider(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }
}
