//! Authorization gate.
//!
//! A gate decides whether a guarded piece of UI (or a guarded relay route)
//! is shown. It is a pure function of a [`Requirement`] and the current
//! [`PermissionState`]; the cache is the only input.
//!
//! # Security Notes
//!
//! The gate is fail-closed. While permissions are loading the decision is
//! [`GateDecision::Indeterminate`], which is never visible. A failed load
//! denies. An empty requirement list denies.

use serde::{Deserialize, Serialize};

use super::cache::PermissionState;
use super::set::PermissionSet;

/// How a list of permission names is combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every name must be granted.
    #[default]
    All,
    /// At least one name must be granted.
    Any,
}

/// What a guarded element requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// One permission.
    Single(String),
    /// Every listed permission.
    All(Vec<String>),
    /// At least one listed permission.
    Any(Vec<String>),
}

impl Requirement {
    /// Requires a single permission.
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self::Single(name.into())
    }

    /// Requires every one of `names`.
    #[must_use]
    pub fn all<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::All(names.into_iter().map(Into::into).collect())
    }

    /// Requires at least one of `names`.
    #[must_use]
    pub fn any<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Any(names.into_iter().map(Into::into).collect())
    }

    /// Builds a requirement from a list and a match mode.
    ///
    /// Returns `None` for an empty list. A one-element list becomes
    /// [`Requirement::Single`] regardless of mode.
    #[must_use]
    pub fn from_names(names: Vec<String>, mode: MatchMode) -> Option<Self> {
        match (names.len(), mode) {
            (0, _) => None,
            (1, _) => names.into_iter().next().map(Self::Single),
            (_, MatchMode::All) => Some(Self::All(names)),
            (_, MatchMode::Any) => Some(Self::Any(names)),
        }
    }

    /// Evaluates the requirement against a concrete set.
    #[must_use]
    pub fn is_satisfied_by(&self, set: &PermissionSet) -> bool {
        match self {
            Self::Single(name) => set.contains(name),
            Self::All(names) => set.contains_all(names),
            Self::Any(names) => set.contains_any(names),
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The requirement is met; render the children.
    Allowed,
    /// The requirement is not met; render the fallback.
    Denied,
    /// Permissions are still loading; render nothing (or a placeholder).
    Indeterminate,
}

impl GateDecision {
    /// Returns `true` only for [`GateDecision::Allowed`].
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns `true` when the guarded content may be shown.
    #[must_use]
    pub const fn is_visible(self) -> bool {
        self.is_allowed()
    }

    /// Returns `true` while the decision cannot yet be made.
    #[must_use]
    pub const fn is_indeterminate(self) -> bool {
        matches!(self, Self::Indeterminate)
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Indeterminate => "indeterminate",
        }
    }
}

/// Evaluates `requirement` against `state`.
#[must_use]
pub fn evaluate(requirement: &Requirement, state: &PermissionState) -> GateDecision {
    match state {
        PermissionState::Uninitialized | PermissionState::Loading => GateDecision::Indeterminate,
        PermissionState::Errored { .. } => GateDecision::Denied,
        PermissionState::Ready(set) => {
            if requirement.is_satisfied_by(set) {
                GateDecision::Allowed
            } else {
                GateDecision::Denied
            }
        },
    }
}
