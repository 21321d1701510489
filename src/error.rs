//! Error types for rangedl
//!
//! This module provides the error taxonomy for the library:
//! - Programmer errors raised by the entity store ([`TransactionError`], [`StaleEntityError`])
//! - Schema declaration errors ([`SchemaError`])
//! - Download control errors ([`DownloadError`])
//! - Persistence errors ([`DatabaseError`])
//!
//! Hoster-boundary failures live in [`crate::downloader::HosterError`]; they are
//! translated into File state by the engine and never reach callers directly.

use crate::types::EntityId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rangedl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rangedl
#[derive(Debug, Error)]
pub enum Error {
    /// Attribute mutated without an open transaction frame
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Entity was deleted (or never existed)
    #[error(transparent)]
    StaleEntity(#[from] StaleEntityError),

    /// Entity type declaration is inconsistent
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Attribute name not declared on the entity type
    #[error("unknown attribute {entity_type}.{attribute}")]
    UnknownAttribute {
        /// Entity type name
        entity_type: String,
        /// Attribute that was requested
        attribute: String,
    },

    /// A setter hook rejected the value
    #[error("invalid value for {attribute}: {reason}")]
    InvalidValue {
        /// Attribute that was being set
        attribute: String,
        /// Why the value was rejected
        reason: String,
    },

    /// External mutation of a read-only attribute
    #[error("attribute {entity_type}.{attribute} is read-only")]
    ReadOnly {
        /// Entity type name
        entity_type: String,
        /// Attribute that was being set
        attribute: String,
    },

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "temp_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download control error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File collision at the completion directory
    #[error("file collision at {path}: {reason}")]
    FileCollision {
        /// The path where the collision occurred
        path: PathBuf,
        /// The reason for the collision
        reason: String,
    },

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Mutation attempted outside of any transaction frame.
///
/// This is a programmer error guard, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Attribute set / entity created or deleted with no open frame
    #[error("{entity_type}.{attribute} changed without transaction")]
    NoTransaction {
        /// Entity type name
        entity_type: String,
        /// Attribute (or `<create>` / `<delete>`)
        attribute: String,
    },

    /// Commit or abort with an empty frame stack
    #[error("cannot {operation}: no open transaction")]
    NoOpenFrame {
        /// The operation that was attempted ("commit" or "abort")
        operation: &'static str,
    },

    /// Explicit id already belongs to a live entity
    #[error("entity id {id} is already in use")]
    DuplicateId {
        /// The requested id
        id: EntityId,
    },
}

/// Access to an entity that has been deleted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("entity {id} is deleted or unknown")]
pub struct StaleEntityError {
    /// The stale entity id
    pub id: EntityId,
}

/// Inconsistent entity type declarations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Two types registered under the same name
    #[error("entity type {0} registered twice")]
    DuplicateType(String),

    /// Attribute declared twice on one type
    #[error("attribute {entity_type}.{attribute} declared twice")]
    DuplicateAttribute {
        /// Entity type name
        entity_type: String,
        /// Duplicated attribute
        attribute: String,
    },

    /// Foreign key points at an unregistered type
    #[error("foreign key {entity_type}.{attribute} targets unknown type {target}")]
    UnknownTarget {
        /// Entity type declaring the key
        entity_type: String,
        /// Foreign key attribute
        attribute: String,
        /// Missing target type
        target: String,
    },

    /// `change_affects` names an attribute that does not exist
    #[error("{entity_type}.{attribute} affects unknown attribute {affected}")]
    UnknownAffected {
        /// Entity type declaring the dependency
        entity_type: String,
        /// Attribute declaring the dependency
        attribute: String,
        /// Unresolvable affected attribute
        affected: String,
    },

    /// A type was looked up that was never registered
    #[error("unknown entity type {0}")]
    UnknownType(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Download control errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// File or package not found in the store
    #[error("{kind} {id} not found")]
    NotFound {
        /// "file" or "package"
        kind: &'static str,
        /// The id that was not found
        id: EntityId,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} file {id} in state {current_state}")]
    InvalidState {
        /// The file id
        id: EntityId,
        /// The operation that was attempted (e.g., "start", "enable")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// No usable account for the file's host
    #[error("no usable account for file {id}")]
    NoAccount {
        /// The file id
        id: EntityId,
    },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_error_names_the_attribute() {
        let err: Error = TransactionError::NoTransaction {
            entity_type: "file".into(),
            attribute: "state".into(),
        }
        .into();
        assert_eq!(err.to_string(), "file.state changed without transaction");
    }

    #[test]
    fn stale_entity_error_is_transparent() {
        let err: Error = StaleEntityError { id: EntityId(7) }.into();
        assert_eq!(err.to_string(), "entity 7 is deleted or unknown");
        assert!(matches!(err, Error::StaleEntity(StaleEntityError { id }) if id == 7));
    }

    #[test]
    fn download_error_messages_include_context() {
        let err = DownloadError::InvalidState {
            id: EntityId(3),
            operation: "start".into(),
            current_state: "download_complete".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot start file 3 in state download_complete"
        );
        let err = DownloadError::NotFound {
            kind: "package",
            id: EntityId(9),
        };
        assert_eq!(err.to_string(), "package 9 not found");
    }
}
