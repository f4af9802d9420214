//! Route dispatcher.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `GET` | `/sse/commands/{area}` | [`relay::stream_commands`] |
//! | `POST` | `/api/auth/login` | [`auth::login`] |
//! | `POST` | `/api/auth/logout` | [`auth::logout`] |
//! | `GET` | `/api/auth/me` | [`auth::me`] |
//! | `GET` | `/healthz` | liveness |

pub mod auth;

use axum::Router;
use axum::routing::{get, post};

use crate::relay;
use crate::state::AppState;

/// Builds the relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sse/commands/{area}", get(relay::stream_commands))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
