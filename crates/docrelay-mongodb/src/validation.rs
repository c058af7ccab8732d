//! Name checks applied before a command reaches the store

use docrelay_common::{DocRelayError, Result};
use std::fmt;

/// Longest collection name accepted, in bytes
const COLLECTION_NAME_LIMIT: usize = 120;

/// Longest dotted field path accepted, in bytes
const FIELD_PATH_LIMIT: usize = 1024;

fn rejected(kind: &str, name: &str, problem: &str) -> DocRelayError {
    DocRelayError::Validation(format!("{} '{}' {}", kind, name.escape_debug(), problem))
}

/// Name of an ordinary user collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionName(String);

impl CollectionName {
    /// # Errors
    /// Validation error for empty or oversized names, NUL bytes, `$`, and
    /// the reserved `system.` namespace
    pub fn new(name: &str) -> Result<Self> {
        let problem = if name.is_empty() {
            Some("is empty")
        } else if name.len() > COLLECTION_NAME_LIMIT {
            Some("is longer than 120 bytes")
        } else if name.contains('\0') {
            Some("contains a NUL byte")
        } else if name.contains('$') {
            Some("contains '$'")
        } else if name.starts_with("system.") {
            Some("is in the reserved system namespace")
        } else {
            None
        };

        match problem {
            Some(problem) => Err(rejected("Collection", name, problem)),
            None => Ok(Self(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dotted path to a document field, e.g. `stats.visits`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(String);

impl FieldPath {
    /// # Errors
    /// Validation error for empty or oversized paths, NUL bytes, empty
    /// segments, and segments starting with `$`
    pub fn new(path: &str) -> Result<Self> {
        let problem = if path.is_empty() {
            Some("is empty")
        } else if path.len() > FIELD_PATH_LIMIT {
            Some("is longer than 1024 bytes")
        } else if path.contains('\0') {
            Some("contains a NUL byte")
        } else if path.split('.').any(str::is_empty) {
            Some("has an empty segment")
        } else if path.split('.').any(|segment| segment.starts_with('$')) {
            Some("names an operator instead of a field")
        } else {
            None
        };

        match problem {
            Some(problem) => Err(rejected("Field", path, problem)),
            None => Ok(Self(path.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
