#![allow(clippy::doc_markdown)]

//! cmdrelay-core - shared building blocks for the command relay
//!
//! This crate holds the pieces of the relay that do not depend on an HTTP
//! server: the session credential type, topic ("area") validation, the
//! client-side permission cache with its authorization gate, the identity
//! endpoint client, and configuration parsing.
//!
//! # Modules
//!
//! - [`area`]: Validated area identifiers that scope a relay stream
//! - [`config`]: TOML configuration for the relay daemon
//! - [`credential`]: Opaque bearer credential backed by
//!   [`secrecy::SecretString`]
//! - [`permission`]: Permission sets, the single-flight
//!   [`PermissionCache`](permission::PermissionCache), the
//!   [`gate`](permission::gate) decision function and the identity client

pub mod area;
pub mod config;
pub mod credential;
pub mod permission;

pub use area::{Area, AreaError};
pub use credential::SessionCredential;
pub use permission::{
    GateDecision, HttpIdentityClient, Identity, IdentityClient, IdentityError, MatchMode,
    PermissionCache, PermissionSet, PermissionState, Requirement,
};
