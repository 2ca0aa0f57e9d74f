//! Error types for the artifact cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the artifact cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Contract Errors
    // =========================================================================
    /// Malformed guid or hash
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Part tag outside the configured tag set
    #[error("Invalid part tag '{0}'")]
    InvalidPartTag(char),

    /// Contract operation not provided by this backend
    #[error("Operation '{operation}' is not implemented by backend {backend}")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    /// Backend setup failed
    #[error("Cache initialization failed: {0}")]
    InitError(String),

    /// Read of an absent key or part
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Second write sink requested for the same part
    #[error("Part '{0}' was already written in this transaction")]
    DuplicatePart(char),

    /// A write sink was not closed with its full payload
    #[error("Incomplete write for part '{part}': {reason}")]
    IncompleteWrite { part: char, reason: String },

    /// More bytes written than announced
    #[error("Part '{part}' expected {expected} bytes, got at least {actual}")]
    SizeMismatch {
        part: char,
        expected: u64,
        actual: u64,
    },

    /// Entry cannot fit even after evicting everything evictable
    #[error("Entry of {size} bytes does not fit in cache of {capacity} bytes")]
    EntryTooLarge { size: u64, capacity: u64 },

    /// Operation on a committed or abandoned transaction
    #[error("Transaction {0} is closed")]
    TransactionClosed(uuid::Uuid),

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    /// Coordinator process is gone
    #[error("Cluster coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// Malformed frame on the coordination channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a `NotImplemented` error
    pub fn not_implemented(backend: &'static str, operation: &'static str) -> Self {
        Error::NotImplemented { backend, operation }
    }

    /// Stable name of the variant, used on the coordination channel
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidKey(_) => "invalid_key",
            Error::InvalidPartTag(_) => "invalid_part_tag",
            Error::NotImplemented { .. } => "not_implemented",
            Error::InitError(_) => "init_error",
            Error::NotFound(_) => "not_found",
            Error::DuplicatePart(_) => "duplicate_part",
            Error::IncompleteWrite { .. } => "incomplete_write",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::EntryTooLarge { .. } => "entry_too_large",
            Error::TransactionClosed(_) => "transaction_closed",
            Error::CoordinatorUnavailable(_) => "coordinator_unavailable",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EntryTooLarge {
            size: 2000,
            capacity: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Entry of 2000 bytes does not fit in cache of 1000 bytes"
        );

        let err = Error::not_implemented("cache_base", "shutdown");
        assert!(err.to_string().contains("shutdown"));
        assert!(err.to_string().contains("cache_base"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::DuplicatePart('a').kind(), "duplicate_part");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
        let io = Error::from(std::io::Error::other("boom"));
        assert_eq!(io.kind(), "io");
    }
}
