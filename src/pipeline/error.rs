//! Error taxonomy for the ingestion pipeline
//!
//! Errors raised inside a flush tick are contained to that tick: a failed
//! chunk is logged and counted, never propagated to sibling chunks.

use thiserror::Error;

/// An indicator failed its kind-specific validity predicate.
///
/// Raised synchronously at the ingestion boundary; the value is never buffered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown indicator kind '{0}'")]
    UnknownKind(String),

    #[error("invalid {kind} value '{value}'")]
    InvalidValue { kind: &'static str, value: String },
}

/// A (kind, value) pair could not be mapped onto a registered table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("kind '{0}' sanitizes to an empty identifier")]
    EmptyKind(String),

    #[error("cannot route an empty value")]
    EmptyValue,

    #[error("kind '{0}' is not registered")]
    UnknownKind(String),

    #[error("kind '{0}' collides with a reserved indicator table family")]
    ReservedKind(String),
}

/// Table creation, insert or lookup failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store handle is not connected")]
    Disconnected,

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("table {table} does not hold {expected} records")]
    FamilyMismatch { table: String, expected: &'static str },

    #[error("invalid match value: {0}")]
    Invalid(#[from] ValidationError),
}

/// The store could not be reached.
///
/// Fatal at startup; during steady state it is logged and the next tick retries.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("gave up connecting to {dsn} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        dsn: String,
        attempts: u32,
        last_error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = ValidationError::InvalidValue {
            kind: "md5",
            value: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "invalid md5 value 'abc'");
    }

    #[test]
    fn test_store_error_wraps_routing() {
        let err: StoreError = RoutingError::EmptyValue.into();
        assert!(err.to_string().contains("cannot route an empty value"));
    }

    #[test]
    fn test_connection_error_reports_attempts() {
        let err = ConnectionError::RetriesExhausted {
            dsn: "/nope/db.sqlite".to_string(),
            attempts: 3,
            last_error: "unable to open database file".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("/nope/db.sqlite"));
    }
}
