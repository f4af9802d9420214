//! Error types for the relay endpoint.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::session::CookieDirective;

/// Failures of one relay request, before streaming starts.
///
/// Once the response head has been sent, failures can no longer be
/// reported with a status; the pump closes the body instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request carries no usable session credential.
    #[error("no session credential")]
    Unauthenticated,

    /// The backend rejected the session's credential.
    #[error("backend rejected the session (status {status})")]
    SessionRevoked {
        /// Upstream status, normally 401.
        status: u16,
    },

    /// The backend answered with a non-success status other than 401.
    #[error("backend returned status {status}")]
    UpstreamUnavailable {
        /// Upstream status, mirrored to the caller.
        status: u16,
    },

    /// The backend accepted the request but sent no body to stream.
    #[error("backend response has no body")]
    NoResponseBody,

    /// The relay could not build or send the upstream request.
    #[error("local relay failure: {0}")]
    LocalFault(String),

    /// The area does not match the identifier grammar.
    #[error("invalid area")]
    InvalidArea,

    /// The area is not in the configured allowlist.
    #[error("unknown area")]
    UnknownArea,

    /// The session lacks the permission required to open a stream.
    #[error("missing required permission")]
    Forbidden,

    /// The relay began shutting down before the stream opened.
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Returns the HTTP status code for this error.
    ///
    /// `UpstreamUnavailable` mirrors the backend status, falling back to 502
    /// if the backend sent something that is not a valid status code.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::SessionRevoked { .. } => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            },
            Self::NoResponseBody | Self::LocalFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidArea => StatusCode::BAD_REQUEST,
            Self::UnknownArea => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message placed in the `error` field of the JSON body.
    ///
    /// Never includes internal detail; `LocalFault` context is logged only.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated => "Unauthorized".to_string(),
            Self::SessionRevoked { status } | Self::UpstreamUnavailable { status } => {
                format!("Backend error: {status}")
            },
            Self::NoResponseBody => "No response body".to_string(),
            Self::LocalFault(_) => "Failed to connect to SSE".to_string(),
            Self::InvalidArea => "Invalid area".to_string(),
            Self::UnknownArea => "Unknown area".to_string(),
            Self::Forbidden => "Forbidden".to_string(),
            Self::ShuttingDown => "Service shutting down".to_string(),
        }
    }

    /// Returns `true` when the session credential must be cleared.
    #[must_use]
    pub const fn clears_session(&self) -> bool {
        matches!(self, Self::Unauthenticated | Self::SessionRevoked { .. })
    }

    /// Short label used for logs and the `outcome` metric label.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::SessionRevoked { .. } => "session_revoked",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::NoResponseBody => "no_response_body",
            Self::LocalFault(_) => "local_fault",
            Self::InvalidArea => "invalid_area",
            Self::UnknownArea => "unknown_area",
            Self::Forbidden => "forbidden",
            Self::ShuttingDown => "shutdown",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        json_error(self.status_code(), &self.public_message())
    }
}

/// A [`RelayError`] together with the cookie directive that clears the
/// session, when the error demands it.
#[derive(Debug)]
pub struct Rejection {
    /// The error.
    pub error: RelayError,
    /// `Set-Cookie` that expires the session cookie.
    pub clearance: Option<CookieDirective>,
}

impl Rejection {
    /// A rejection that leaves the session alone.
    #[must_use]
    pub const fn new(error: RelayError) -> Self {
        Self {
            error,
            clearance: None,
        }
    }

    /// A rejection that also expires the session cookie.
    #[must_use]
    pub const fn clearing(error: RelayError, clearance: CookieDirective) -> Self {
        Self {
            error,
            clearance: Some(clearance),
        }
    }
}

impl From<RelayError> for Rejection {
    fn from(error: RelayError) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        if let Some(clearance) = self.clearance {
            clearance.apply(response.headers_mut());
        }
        response
    }
}

/// `{"error": message}` with `status`.
pub fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
