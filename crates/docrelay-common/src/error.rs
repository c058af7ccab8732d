//! Error types for docrelay

use thiserror::Error;

/// Result type alias for docrelay operations
pub type Result<T> = std::result::Result<T, DocRelayError>;

/// Unified error type for all docrelay operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocRelayError {
    /// A connection attempt failed (bad config, auth rejection, DNS, network).
    /// Retried by the supervisor, never returned from a command.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command ran before the supervisor published a live handle
    #[error("Store not ready: {0}")]
    NotReady(String),

    /// The caller supplied malformed or missing arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store rejected a well-formed request; message is the driver's own
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DocRelayError {
    /// Returns true if this error came from a connection attempt
    pub fn is_connection(&self) -> bool {
        matches!(self, DocRelayError::Connection(_))
    }

    /// Returns true if the command failed only because no handle was published
    pub fn is_not_ready(&self) -> bool {
        matches!(self, DocRelayError::NotReady(_))
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled).
// Driver errors raised by a request map to Store; connect paths map_err to
// Connection explicitly.
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocRelayError {
    fn from(err: mongodb::error::Error) -> Self {
        DocRelayError::Store(err.to_string())
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocRelayError {
    fn from(err: bson::ser::Error) -> Self {
        DocRelayError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocRelayError {
    fn from(err: bson::de::Error) -> Self {
        DocRelayError::Serialization(format!("BSON deserialization error: {}", err))
    }
}
