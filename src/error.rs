//! Error types for shardwarden

use std::fmt;

use crate::sharding::ShardId;

/// Result type alias for shardwarden operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shardwarden
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Shard id outside the configured topology
    ShardNotFound(ShardId),
    /// Shard could not be reached
    ShardUnavailable { shard_id: ShardId, reason: String },
    /// Connection was closed before the operation ran
    ConnectionClosed(ShardId),
    /// Router was closed; no further queries are accepted
    RouterClosed,
    /// Query execution failed on a shard
    Query { shard_id: ShardId, message: String },
    /// Target rows do not match the source after a copy
    VerificationMismatch { table: String, detail: String },
    /// Migration was cancelled by the caller or by its context
    Cancelled,
    /// Timeout
    Timeout,
    /// Illegal migration state transition
    InvalidTransition { from: String, to: String },
    /// Internal error
    Internal(String),
}

impl Error {
    /// True for failures caused by an unreachable or closed shard.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::ShardUnavailable { .. } | Error::ConnectionClosed(_) | Error::RouterClosed
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ShardNotFound(shard_id) => write!(f, "Shard not found: {}", shard_id),
            Error::ShardUnavailable { shard_id, reason } => {
                write!(f, "Shard {} unavailable: {}", shard_id, reason)
            }
            Error::ConnectionClosed(shard_id) => {
                write!(f, "Connection to shard {} is closed", shard_id)
            }
            Error::RouterClosed => write!(f, "Shard router is closed"),
            Error::Query { shard_id, message } => {
                write!(f, "Query error on shard {}: {}", shard_id, message)
            }
            Error::VerificationMismatch { table, detail } => {
                write!(f, "Verification failed for table {}: {}", table, detail)
            }
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::InvalidTransition { from, to } => {
                write!(f, "Invalid migration transition: {} -> {}", from, to)
            }
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
