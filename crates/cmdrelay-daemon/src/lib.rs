#![allow(clippy::doc_markdown)]

//! cmdrelay-daemon - authenticated real-time command relay
//!
//! The daemon sits between browsers and a backend event source. For each
//! `GET /sse/commands/{area}` it resolves the caller's session, opens one
//! upstream stream with the caller's bearer credential, and pipes bytes
//! downstream until either side goes away.
//!
//! # Runtime Requirements
//!
//! Handlers spawn one pump task per stream; the `cmdrelay-daemon` binary
//! runs a multi-threaded tokio runtime.
//!
//! # Modules
//!
//! - [`error`]: `RelayError` and its HTTP mapping
//! - [`identity`]: Backend identity lookups for a credential
//! - [`metrics`]: Prometheus metrics and the metrics listener
//! - [`relay`]: Connection phases, the relay handler and the pump
//! - [`routes`]: Router assembly and the auth pass-through routes
//! - [`session`]: `SessionStore` trait with cookie and in-memory stores
//! - [`state`]: Shared router state and shutdown broadcast
//! - [`upstream`]: Upstream event source client

pub mod error;
pub mod identity;
pub mod metrics;
pub mod relay;
pub mod routes;
pub mod session;
pub mod state;
pub mod upstream;

pub use error::RelayError;
pub use routes::router;
pub use state::{AppState, RelaySettings, ShutdownHandle};
