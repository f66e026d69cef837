//! Session identifiers.
//!
//! A session is not a stored entity. It is the distinct set of
//! `session_id` values present in the store: created implicitly by the
//! first record that references it, removed by deleting all its records.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a session identifier in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

#[allow(clippy::expect_used)]
static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static session id pattern"));

/// Validated grouping key for memory records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Parses and validates a session identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the id is empty, longer than
    /// [`MAX_SESSION_ID_LEN`], or contains characters other than ASCII
    /// letters, digits, `-` and `_`.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "session id must be 1..={MAX_SESSION_ID_LEN} characters, got {}",
                raw.len()
            )));
        }
        if !SESSION_ID_PATTERN.is_match(&raw) {
            return Err(Error::InvalidInput(format!(
                "session id '{raw}' may only contain letters, digits, '-' and '_'"
            )));
        }
        Ok(Self(raw))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
