//! A single `key=value` address element.

use crate::error::{AddressError, Result};
use std::fmt;
use std::str::FromStr;

/// Value that matches any child name under a key.
pub const WILDCARD_VALUE: &str = "*";

/// One step in a [`PathAddress`](crate::PathAddress).
///
/// `Eq` and `Hash` are structural: `handler=*` and `handler=console` are
/// different elements. Use [`PathElement::matches`] for wildcard-aware
/// comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    key: String,
    value: String,
}

impl PathElement {
    /// Create an element, rejecting empty or reserved text.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        validate_part(&key, &value, &key)?;
        validate_part(&key, &value, &value)?;
        Ok(Self { key, value })
    }

    /// Create a wildcard element for `key`.
    pub fn wildcard(key: impl Into<String>) -> Result<Self> {
        Self::new(key, WILDCARD_VALUE)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD_VALUE
    }

    /// Same key, and either side is a wildcard or the values are equal.
    pub fn matches(&self, other: &PathElement) -> bool {
        self.key == other.key
            && (self.is_wildcard() || other.is_wildcard() || self.value == other.value)
    }
}

fn validate_part(key: &str, value: &str, part: &str) -> Result<()> {
    let reason = if part.is_empty() {
        "key and value must not be empty"
    } else if part.contains('/') || part.contains('=') {
        "'/' and '=' are reserved"
    } else {
        return Ok(());
    };
    Err(AddressError::InvalidElement {
        element: format!("{key}={value}"),
        reason,
    })
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for PathElement {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s.split_once('=').ok_or_else(|| AddressError::Malformed {
            input: s.to_string(),
            reason: "expected key=value".to_string(),
        })?;
        Self::new(key, value)
    }
}
