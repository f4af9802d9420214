//! Area identifiers.
//!
//! An area is the topic that scopes one relay stream, typically a kitchen
//! station name such as `grill` or `bar`. Areas are interpolated into the
//! upstream URL, so they are validated before any session or network work.
//!
//! # Grammar
//!
//! - 1 to [`MAX_AREA_LEN`] bytes
//! - ASCII alphanumerics, `-` and `_` only

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length of an area identifier in bytes.
pub const MAX_AREA_LEN: usize = 64;

/// Errors produced when parsing an area identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AreaError {
    /// The identifier is empty.
    #[error("area must not be empty")]
    Empty,

    /// The identifier exceeds [`MAX_AREA_LEN`].
    #[error("area too long: {len} bytes exceeds maximum {max}")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// The identifier contains a character outside the grammar.
    #[error("invalid character {ch:?} at position {position}")]
    InvalidCharacter {
        /// The offending character.
        ch: char,
        /// Character index of the offending character.
        position: usize,
    },
}

/// A validated area identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Area(String);

impl Area {
    /// Parses and validates an area identifier.
    ///
    /// # Errors
    ///
    /// Returns an [`AreaError`] when the input does not match the grammar.
    pub fn parse(raw: &str) -> Result<Self, AreaError> {
        if raw.is_empty() {
            return Err(AreaError::Empty);
        }
        if raw.len() > MAX_AREA_LEN {
            return Err(AreaError::TooLong {
                len: raw.len(),
                max: MAX_AREA_LEN,
            });
        }
        if let Some((position, ch)) = raw
            .chars()
            .enumerate()
            .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
        {
            return Err(AreaError::InvalidCharacter { ch, position });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Area {
    type Err = AreaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Area {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
