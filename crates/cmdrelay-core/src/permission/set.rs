//! Permission sets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The permission strings granted to one session.
///
/// Membership queries over a list of names are fail-closed: an empty list
/// never grants anything, for either the "any" or the "all" form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Returns `true` if `name` is granted.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Returns `true` if at least one of `names` is granted.
    pub fn contains_any<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().any(|name| self.contains(name.as_ref()))
    }

    /// Returns `true` if every one of `names` is granted.
    ///
    /// Returns `false` for an empty list: nothing was asked for, so nothing
    /// is provably granted.
    pub fn contains_all<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen_any = false;
        for name in names {
            seen_any = true;
            if !self.contains(name.as_ref()) {
                return false;
            }
        }
        seen_any
    }

    /// Number of granted permissions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when nothing is granted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the granted permissions in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
