//! Authenticated stream relay.
//!
//! `GET /sse/commands/{area}` opens one upstream event stream per request,
//! on behalf of the caller's session, and pipes it downstream unmodified.
//!
//! # Architecture
//!
//! ```text
//! browser --GET--> stream_commands
//!                    | Authenticating      SessionStore::resolve (+ gate)
//!                    | ConnectingUpstream  EventSource::open
//!                    | Streaming           spawn Pump ----> mpsc(1) ----> Body
//!                    v
//!              ClosedNormal | ClosedError
//! ```
//!
//! # Security Notes
//!
//! - A request without a credential never reaches the upstream
//! - Upstream 401 invalidates the session before the error is returned
//! - The credential is captured once at open and never re-validated
//!   mid-stream
//!
//! # Invariants
//!
//! - Phases only move forward; a closed connection performs no writes
//! - Payload bytes are never parsed, buffered or coalesced

mod pump;

use std::fmt;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use cmdrelay_core::{Area, IdentityError, PermissionSet, SessionCredential};
use futures::stream;
pub use pump::{DownstreamItem, Pump};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Rejection, RelayError};
use crate::state::{AppState, ShutdownSignal};
use crate::upstream::{UpstreamBody, UpstreamReply};

/// Capacity of the channel between the pump and the response body.
///
/// One slot: a chunk is handed off before the next one is read.
pub const DOWNSTREAM_CAPACITY: usize = 1;

/// Header that disables response buffering in nginx-style proxies.
pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Lifecycle phase of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayPhase {
    /// Resolving the caller's credential.
    Authenticating,
    /// Opening the upstream stream.
    ConnectingUpstream,
    /// Pumping bytes.
    Streaming,
    /// Closed by the client or by shutdown.
    ClosedNormal,
    /// Closed by a failure on the upstream side or before streaming.
    ClosedError,
}

impl RelayPhase {
    /// Returns `true` for the two terminal phases.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ClosedNormal | Self::ClosedError)
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::ConnectingUpstream => "connecting_upstream",
            Self::Streaming => "streaming",
            Self::ClosedNormal => "closed_normal",
            Self::ClosedError => "closed_error",
        }
    }
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a streaming connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away.
    DownstreamClosed,
    /// The process is shutting down.
    Shutdown,
    /// The upstream ended its body.
    UpstreamEnded,
    /// Reading the upstream body failed.
    UpstreamFailed(String),
    /// No upstream chunk arrived within the idle timeout.
    IdleTimeout,
}

impl CloseReason {
    /// Terminal phase for this reason.
    #[must_use]
    pub const fn phase(&self) -> RelayPhase {
        match self {
            Self::DownstreamClosed | Self::Shutdown => RelayPhase::ClosedNormal,
            Self::UpstreamEnded | Self::UpstreamFailed(_) | Self::IdleTimeout => {
                RelayPhase::ClosedError
            },
        }
    }

    /// Label used in logs and the `outcome` metric label.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::DownstreamClosed => "downstream_closed",
            Self::Shutdown => "shutdown",
            Self::UpstreamEnded => "upstream_ended",
            Self::UpstreamFailed(_) => "upstream_failed",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

/// One logical stream between a client and the upstream.
#[derive(Debug)]
pub struct RelayConnection {
    id: Uuid,
    area: Area,
    phase: RelayPhase,
    opened_at: Instant,
}

impl RelayConnection {
    /// Starts a connection in [`RelayPhase::Authenticating`].
    #[must_use]
    pub fn new(id: Uuid, area: Area) -> Self {
        Self {
            id,
            area,
            phase: RelayPhase::Authenticating,
            opened_at: Instant::now(),
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Area this connection is scoped to.
    #[must_use]
    pub const fn area(&self) -> &Area {
        &self.area
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> RelayPhase {
        self.phase
    }

    /// Moves to `next`. Backwards moves and moves out of a terminal phase
    /// are ignored.
    pub fn advance(&mut self, next: RelayPhase) {
        if self.phase.is_terminal() || next <= self.phase {
            debug!(from = %self.phase, to = %next, "ignored relay phase transition");
            return;
        }
        debug!(from = %self.phase, to = %next, "relay phase");
        self.phase = next;
    }

    /// Moves to the terminal phase for `reason`.
    pub fn close(&mut self, reason: &CloseReason) {
        self.advance(reason.phase());
        debug!(
            elapsed_ms = u64::try_from(self.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "relay connection closed"
        );
    }
}

/// Handler for `GET /sse/commands/{area}`.
pub async fn stream_commands(
    State(state): State<AppState>,
    Path(raw_area): Path<String>,
    headers: HeaderMap,
) -> Response {
    let id = Uuid::new_v4();
    let span = info_span!("relay", connection_id = %id, area = tracing::field::Empty);

    async move {
        let area = match admit_area(&state, &raw_area) {
            Ok(area) => area,
            Err(error) => {
                debug!(error = %error, "relay request rejected");
                state.metrics.connection_finished("-", error.outcome());
                return error.into_response();
            },
        };
        tracing::Span::current().record("area", tracing::field::display(&area));

        let label = area.as_str().to_owned();
        match open_relay(&state, RelayConnection::new(id, area), &headers).await {
            Ok(response) => response,
            Err(rejection) => {
                let outcome = rejection.error.outcome();
                match &rejection.error {
                    RelayError::LocalFault(detail) => {
                        error!(error = %detail, "relay failed to reach upstream");
                    },
                    RelayError::UpstreamUnavailable { status } => {
                        warn!(status, "upstream refused relay stream");
                    },
                    other => info!(outcome, error = %other, "relay request rejected"),
                }
                state.metrics.connection_finished(&label, outcome);
                rejection.into_response()
            },
        }
    }
    .instrument(span)
    .await
}

fn admit_area(state: &AppState, raw: &str) -> Result<Area, RelayError> {
    let area = Area::parse(raw).map_err(|_| RelayError::InvalidArea)?;
    if !state.settings.allows(&area) {
        return Err(RelayError::UnknownArea);
    }
    Ok(area)
}

/// Drives a connection from `Authenticating` to `Streaming` and hands it to
/// a pump task.
async fn open_relay(
    state: &AppState,
    mut connection: RelayConnection,
    headers: &HeaderMap,
) -> Result<Response, Rejection> {
    let result = connect(state, &mut connection, headers).await;
    let (upstream, shutdown) = match result {
        Ok(opened) => opened,
        Err(rejection) => {
            connection.advance(RelayPhase::ClosedError);
            return Err(rejection);
        },
    };

    connection.advance(RelayPhase::Streaming);
    info!("relay streaming");

    let (tx, rx) = mpsc::channel::<DownstreamItem>(DOWNSTREAM_CAPACITY);
    let pump = Pump {
        connection,
        upstream,
        downstream: tx,
        shutdown,
        idle_timeout: state.settings.idle_timeout,
        metrics: state.metrics.clone(),
    };
    tokio::spawn(pump.run().in_current_span());

    Ok(event_stream_response(Body::from_stream(stream::unfold(
        rx,
        |mut rx| async move { rx.recv().await.map(|item| (item, rx)) },
    ))))
}

/// Authenticates and opens the upstream stream.
async fn connect(
    state: &AppState,
    connection: &mut RelayConnection,
    headers: &HeaderMap,
) -> Result<(UpstreamBody, ShutdownSignal), Rejection> {
    let Some(credential) = state.sessions.resolve(headers) else {
        state.metrics.session_invalidated("missing_credential");
        return Err(Rejection::clearing(
            RelayError::Unauthenticated,
            state.sessions.invalidate(headers),
        ));
    };

    authorize(state, &credential, headers).await?;

    connection.advance(RelayPhase::ConnectingUpstream);
    let mut shutdown = state.shutdown.subscribe();
    let reply = tokio::select! {
        biased;
        () = shutdown.wait() => {
            return Err(RelayError::ShuttingDown.into());
        },
        reply = state.events.open(connection.area(), &credential) => reply,
    };

    let upstream = match reply {
        Err(e) => return Err(RelayError::LocalFault(e.to_string()).into()),
        Ok(UpstreamReply::Rejected { status }) if status == StatusCode::UNAUTHORIZED => {
            state.metrics.session_invalidated("upstream_401");
            return Err(Rejection::clearing(
                RelayError::SessionRevoked {
                    status: status.as_u16(),
                },
                state.sessions.invalidate(headers),
            ));
        },
        Ok(UpstreamReply::Rejected { status }) => {
            return Err(RelayError::UpstreamUnavailable {
                status: status.as_u16(),
            }
            .into());
        },
        Ok(UpstreamReply::Empty) => return Err(RelayError::NoResponseBody.into()),
        Ok(UpstreamReply::Streaming(body)) => body,
    };
    Ok((upstream, shutdown))
}

/// Checks the configured stream permission, if any.
async fn authorize(
    state: &AppState,
    credential: &SessionCredential,
    headers: &HeaderMap,
) -> Result<(), Rejection> {
    let Some(requirement) = &state.settings.required else {
        return Ok(());
    };

    match state.identity.identity(credential).await {
        Ok(identity) => {
            let granted: PermissionSet = identity.permissions.into_iter().collect();
            if requirement.is_satisfied_by(&granted) {
                Ok(())
            } else {
                Err(RelayError::Forbidden.into())
            }
        },
        Err(IdentityError::Unauthenticated) => {
            state.metrics.session_invalidated("identity_401");
            Err(Rejection::clearing(
                RelayError::SessionRevoked {
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                },
                state.sessions.invalidate(headers),
            ))
        },
        Err(IdentityError::Status { status }) => {
            Err(RelayError::UpstreamUnavailable { status }.into())
        },
        Err(e @ (IdentityError::Transport(_) | IdentityError::Decode(_))) => {
            warn!(error = %e, "identity lookup failed");
            Err(RelayError::UpstreamUnavailable {
                status: StatusCode::BAD_GATEWAY.as_u16(),
            }
            .into())
        },
    }
}

fn event_stream_response(body: Body) -> Response {
    let mut response = body.into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}
