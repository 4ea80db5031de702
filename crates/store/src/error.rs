//! Store error types and result alias.
//!
//! This module defines the errors a [`KvStore`](crate::KvStore) implementation
//! may return. Every implementation maps its internal failures to these
//! variants so that callers can branch on them without knowing which store
//! is underneath.
//!
//! # Error Types
//!
//! - [`StoreError::NotFound`] - Key does not exist
//! - [`StoreError::Conflict`] - Concurrent modification detected
//! - [`StoreError::Connection`] - Network or connection-related failures
//! - [`StoreError::Serialization`] - Data encoding/decoding failures
//! - [`StoreError::Internal`] - Store-specific internal errors
//! - [`StoreError::Timeout`] - Operation exceeded time limit
//! - [`StoreError::SizeLimitExceeded`] - Key or value larger than allowed
//! - [`StoreError::SessionNotFound`] - Session is unknown or was invalidated
//! - [`StoreError::InvalidLimit`] - A size limit was configured below its minimum
//!
//! Note that conditional writes (`cas_put`, `delete_cas`) report a failed
//! precondition as `Ok(false)`, not as an error. An `Err` from a store always
//! means the store itself could not answer.
//!
//! # Example
//!
//! ```
//! use certkv_store::{StoreError, StoreResult};
//!
//! fn lookup(key: &str) -> StoreResult<Vec<u8>> {
//!     Err(StoreError::not_found(key))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during key-value store operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// Concurrent modification detected.
    #[error("Conflict")]
    Conflict,

    /// Connection or network error.
    ///
    /// The store could not be reached, or it answered with an unexpected
    /// status.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal store error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    #[error("Operation timeout")]
    Timeout,

    /// A key or value exceeded the configured size limit.
    #[error("{kind} size {actual} exceeds limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Which limit was violated (`"key"` or `"value"`).
        kind: &'static str,
        /// The offending size in bytes.
        actual: usize,
        /// The configured maximum in bytes.
        limit: usize,
    },

    /// The session does not exist, or was destroyed or expired.
    #[error("Session not found: {session}")]
    SessionNotFound {
        /// The session identifier.
        session: String,
    },

    /// A size limit was configured below its minimum of one byte.
    #[error("{field} must be at least 1 byte")]
    InvalidLimit {
        /// The limit that was rejected.
        field: &'static str,
    },
}

impl StoreError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: &'static str, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind, actual, limit }
    }

    /// Creates a new `SessionNotFound` error.
    #[must_use]
    pub fn session_not_found(session: impl Into<String>) -> Self {
        Self::SessionNotFound { session: session.into() }
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Only connection failures and timeouts are transient. Stores perform no
    /// retries themselves; this is a hint for the client layer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}
