//! Label selectors used to match exporters.
//!
//! A selector is a comma-separated list of `key=value` equality terms that
//! are combined with logical AND:
//!
//! ```text
//! board=rpi4,location=lab-2
//! ```
//!
//! There is no OR and no negation.  Terms such as `key!=value` are rejected
//! rather than silently treated as equality.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a selector string is malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("selector term {index} is empty")]
    EmptyTerm { index: usize },
    #[error("selector term `{term}` is not of the form key=value")]
    MissingEquals { term: String },
    #[error("selector term `{term}` has an empty key")]
    EmptyKey { term: String },
    #[error("selector term `{term}` uses an unsupported operator; only key=value is allowed")]
    UnsupportedOperator { term: String },
    #[error("selector key `{key}` appears more than once")]
    DuplicateKey { key: String },
}

/// A parsed, validated label selector.
///
/// Terms keep the order they were written in so that [`Selector::to_string`]
/// reproduces the caller's selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    terms: Vec<(String, String)>,
}

impl Selector {
    /// Parses a selector string.
    ///
    /// # Errors
    ///
    /// Returns a [`SelectorError`] describing the first malformed term.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        for (index, raw) in input.split(',').enumerate() {
            let term = raw.trim();
            if term.is_empty() {
                return Err(SelectorError::EmptyTerm { index });
            }
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| SelectorError::MissingEquals {
                    term: term.to_string(),
                })?;
            let key = key.trim();
            let value = value.trim();
            if key.ends_with('!') || value.starts_with('=') {
                return Err(SelectorError::UnsupportedOperator {
                    term: term.to_string(),
                });
            }
            if key.is_empty() {
                return Err(SelectorError::EmptyKey {
                    term: term.to_string(),
                });
            }
            if !seen.insert(key.to_string()) {
                return Err(SelectorError::DuplicateKey {
                    key: key.to_string(),
                });
            }
            terms.push((key.to_string(), value.to_string()));
        }
        Ok(Self { terms })
    }

    /// Returns the `(key, value)` terms in written order.
    pub fn terms(&self) -> &[(String, String)] {
        &self.terms
    }

    /// Returns true when every term is present in `labels` with an equal value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
