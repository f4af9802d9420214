//! Sign-in, sign-out and identity pass-through.
//!
//! These routes are the relay-side half of the session lifecycle: login
//! establishes the credential the relay later forwards, logout clears it,
//! and `me` serves the identity document the client permission cache
//! reads.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use cmdrelay_core::{Identity, IdentityError, SessionCredential};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::json_error;
use crate::session::{CookieDirective, SessionError};
use crate::state::AppState;

/// Errors of the auth routes.
#[derive(Debug, Error)]
pub enum AuthRouteError {
    /// No valid session.
    #[error("unauthorized")]
    Unauthorized,

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}")]
    Backend {
        /// Mirrored status.
        status: u16,
    },

    /// The backend's sign-in response carries no token.
    #[error("backend sign-in response has no token")]
    MissingToken,

    /// The backend could not be reached.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The session could not be stored.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl AuthRouteError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Backend { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            },
            Self::MissingToken | Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthRouteError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::Backend { status } => format!("Backend error: {status}"),
            Self::MissingToken => "Invalid backend response".to_string(),
            Self::Transport(_) => "Backend unavailable".to_string(),
            Self::Session(_) => "Failed to establish session".to_string(),
        };
        json_error(self.status_code(), &message)
    }
}

/// `POST /api/auth/login`.
///
/// Forwards the JSON body to the backend sign-in endpoint and stores the
/// returned token as the session credential.
pub async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AuthRouteError> {
    let response = state
        .http
        .post(&state.settings.login_url)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(error = %e, "sign-in request failed");
            AuthRouteError::Transport(e.to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        info!(status = status.as_u16(), "backend refused sign-in");
        return Err(AuthRouteError::Backend {
            status: status.as_u16(),
        });
    }

    let document: Value = response
        .json()
        .await
        .map_err(|_| AuthRouteError::MissingToken)?;
    let credential = ["token", "access_token"]
        .iter()
        .find_map(|key| document.get(key).and_then(Value::as_str))
        .and_then(SessionCredential::new)
        .ok_or(AuthRouteError::MissingToken)?;

    let directive = state.sessions.establish(credential)?;
    info!("session established");
    Ok(ok_with_cookie(directive))
}

/// `POST /api/auth/logout`. Idempotent.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let directive = state.sessions.invalidate(&headers);
    state.metrics.session_invalidated("logout");
    info!("session cleared");
    ok_with_cookie(directive)
}

/// `GET /api/auth/me`.
///
/// Returns the backend identity document for the caller's session. A
/// missing or rejected credential clears the session.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(credential) = state.sessions.resolve(&headers) else {
        return unauthorized(&state, &headers, "missing_credential");
    };

    match state.identity.identity(&credential).await {
        Ok(identity) => Json::<Identity>(identity).into_response(),
        Err(IdentityError::Unauthenticated) => unauthorized(&state, &headers, "identity_401"),
        Err(IdentityError::Status { status }) => AuthRouteError::Backend { status }.into_response(),
        Err(e @ (IdentityError::Transport(_) | IdentityError::Decode(_))) => {
            warn!(error = %e, "identity lookup failed");
            AuthRouteError::Transport(e.to_string()).into_response()
        },
    }
}

fn unauthorized(state: &AppState, headers: &HeaderMap, reason: &str) -> Response {
    let directive = state.sessions.invalidate(headers);
    state.metrics.session_invalidated(reason);
    let mut response = AuthRouteError::Unauthorized.into_response();
    directive.apply(response.headers_mut());
    response
}

fn ok_with_cookie(directive: CookieDirective) -> Response {
    let mut response = Json(json!({ "ok": true })).into_response();
    directive.apply(response.headers_mut());
    response
}
