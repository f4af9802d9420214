//! Permission commands.
//!
//! # Commands
//!
//! - `cmdrelay whoami [--json]` - load and print the session's permissions
//! - `cmdrelay can <perm>... [--any]` - evaluate a permission gate
//!
//! # Exit Codes
//!
//! `can` reports the gate decision through its exit code so it can be used
//! in scripts. A session the relay does not recognise is "signed in with no
//! permissions" and is denied, not an error.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use cmdrelay_core::{GateDecision, MatchMode, PermissionState, Requirement};
use serde_json::json;

use super::RelayTarget;

/// Exit codes for permission commands.
pub mod exit_codes {
    /// Allowed, or permissions loaded.
    pub const SUCCESS: u8 = 0;
    /// Denied, or the identity endpoint failed.
    pub const DENIED: u8 = 1;
    /// Permissions did not finish loading.
    pub const INDETERMINATE: u8 = 2;
}

/// Arguments for `cmdrelay can`.
#[derive(Debug, Args)]
pub struct CanArgs {
    /// Permissions to test, e.g. `stock:create`
    #[arg(required = true)]
    pub permissions: Vec<String>,

    /// Allow when any of the permissions is held (default: all)
    #[arg(long)]
    pub any: bool,
}

impl CanArgs {
    const fn mode(&self) -> MatchMode {
        if self.any { MatchMode::Any } else { MatchMode::All }
    }
}

/// Loads the permission set and prints it.
pub async fn whoami(target: &RelayTarget, json: bool, out: &mut impl Write) -> Result<u8> {
    let cache = target.permission_cache();
    let state = cache.refresh().await;

    if json {
        let document = match &state {
            PermissionState::Errored { message } => {
                json!({ "state": state.label(), "error": message })
            },
            _ => json!({ "state": state.label(), "permissions": state.permissions() }),
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&document)?)?;
    } else {
        match &state {
            PermissionState::Ready(set) if set.is_empty() => {
                writeln!(out, "signed in with no permissions (or not signed in)")?;
            },
            PermissionState::Ready(set) => {
                for permission in set.iter() {
                    writeln!(out, "{permission}")?;
                }
            },
            PermissionState::Errored { message } => {
                writeln!(out, "error: {message}")?;
            },
            other => writeln!(out, "{}", other.label())?,
        }
    }

    Ok(match state {
        PermissionState::Ready(_) => exit_codes::SUCCESS,
        PermissionState::Errored { .. } => exit_codes::DENIED,
        PermissionState::Uninitialized | PermissionState::Loading => exit_codes::INDETERMINATE,
    })
}

/// Evaluates the gate described by `args` and prints the decision.
pub async fn can(target: &RelayTarget, args: &CanArgs, out: &mut impl Write) -> Result<u8> {
    let Some(requirement) = Requirement::from_names(args.permissions.clone(), args.mode()) else {
        writeln!(out, "{}", GateDecision::Denied.as_str())?;
        return Ok(exit_codes::DENIED);
    };

    let cache = target.permission_cache();
    let state = cache.ensure_loaded().await;
    if let PermissionState::Errored { message } = &state {
        tracing::warn!(error = %message, "permissions unavailable; denying");
    }

    let decision = cache.check(&requirement);
    writeln!(out, "{}", decision.as_str())?;
    Ok(exit_code(decision))
}

const fn exit_code(decision: GateDecision) -> u8 {
    match decision {
        GateDecision::Allowed => exit_codes::SUCCESS,
        GateDecision::Denied => exit_codes::DENIED,
        GateDecision::Indeterminate => exit_codes::INDETERMINATE,
    }
}
