//! Error types for certificate storage and locking.
//!
//! [`CertStorageError`] separates the conditions callers are expected to
//! branch on (a missing key, a lock that could not be taken in time) from
//! corrupted data and from failures of the key-value store itself.

use std::time::Duration;

use certkv_store::StoreError;
use thiserror::Error;

/// Result type alias for certificate storage operations.
pub type CertResult<T> = std::result::Result<T, CertStorageError>;

/// Errors returned by [`CertStorage`](crate::CertStorage), the codec and the
/// distributed lock.
///
/// Decode and crypto failures are never folded into
/// [`NotExist`](Self::NotExist): an unreadable record is reported as such.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertStorageError {
    /// The requested key does not exist.
    #[error("key does not exist: {key}")]
    NotExist {
        /// Logical key that was requested.
        key: String,
    },

    /// An encrypted record failed authentication, or is too short to carry
    /// a nonce and tag.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Description of the failure.
        message: String,
    },

    /// A record does not start with the expected format prefix.
    #[error("invalid data format: {message}")]
    Format {
        /// Description of the mismatch.
        message: String,
    },

    /// A record carries the expected prefix but its body is not a valid
    /// storage record.
    #[error("failed to decode record: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized for writing.
    #[error("failed to encode record: {message}")]
    Encode {
        /// Description of the encode failure.
        message: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The key-value store could not complete the request.
    #[error("store error: {0}")]
    Transport(#[from] StoreError),

    /// The key changed concurrently with a conditional operation.
    #[error("concurrent modification of {key}")]
    Conflict {
        /// Logical key that changed.
        key: String,
    },

    /// A blocking lock acquisition exceeded the configured wait timeout.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout {
        /// Logical key of the lock.
        key: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A non-blocking lock acquisition found the lock held.
    #[error("lock {key} is held by another session")]
    LockContention {
        /// Logical key of the lock.
        key: String,
    },

    /// The lock is not held by this instance.
    #[error("lock {key} is not held")]
    LockNotHeld {
        /// Logical key of the lock.
        key: String,
    },

    /// The session backing a held lock expired or was invalidated.
    #[error("lock {key} was lost")]
    LockLost {
        /// Logical key of the lock.
        key: String,
    },

    /// A blocking lock acquisition was cancelled by the caller.
    #[error("lock acquisition for {key} was cancelled")]
    Cancelled {
        /// Logical key of the lock.
        key: String,
    },

    /// Encrypting a record failed.
    #[error("encryption failed: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CertStorageError {
    /// Creates a new `NotExist` error for the given logical key.
    #[must_use]
    pub fn not_exist(key: impl Into<String>) -> Self {
        Self::NotExist { key: key.into() }
    }

    /// Returns `true` if the key was absent.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist { .. })
    }

    /// Returns `true` if the failure came from the store and retrying may
    /// succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The AES key is not 32 bytes long.
    #[error("encryption key must be 32 bytes, got {actual}")]
    InvalidKeyLength {
        /// Length of the rejected key.
        actual: usize,
    },

    /// A required field was empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the field.
        field: &'static str,
    },

    /// A value was below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the field.
        field: &'static str,
        /// Minimum accepted value.
        min: String,
        /// Rejected value.
        value: String,
    },

    /// A field could not be decoded.
    #[error("{field} is not valid {encoding}")]
    InvalidEncoding {
        /// Name of the field.
        field: &'static str,
        /// Expected encoding.
        encoding: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_exist_is_distinguishable() {
        assert!(CertStorageError::not_exist("a/b").is_not_exist());
        assert!(!CertStorageError::Format { message: "bad prefix".into() }.is_not_exist());
        assert!(!CertStorageError::from(StoreError::not_found("a/b")).is_not_exist());
    }

    #[test]
    fn transport_errors_keep_transience() {
        assert!(CertStorageError::from(StoreError::connection("refused")).is_transient());
        assert!(!CertStorageError::from(StoreError::conflict()).is_transient());
        assert!(!CertStorageError::LockContention { key: "k".into() }.is_transient());
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::InvalidKeyLength { actual: 16 }.to_string(),
            "encryption key must be 32 bytes, got 16"
        );
        assert_eq!(ConfigError::Empty { field: "prefix" }.to_string(), "prefix must not be empty");
    }
}
