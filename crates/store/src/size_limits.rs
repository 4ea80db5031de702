//! Key and value size validation for stores.
//!
//! Stores accept a [`SizeLimits`] at construction time and call
//! [`validate_sizes`] on every write path, so oversized payloads are rejected
//! before they reach the underlying store.
//!
//! # Defaults
//!
//! | Limit | Default |
//! |-------|---------|
//! | `max_key_size` | 512 bytes |
//! | `max_value_size` | 524 288 bytes (512 KiB) |
//!
//! The value default matches the per-entry cap of Consul's KV store.

use crate::StoreError;

/// Default maximum key size in bytes (512 B).
pub const DEFAULT_MAX_KEY_SIZE: usize = 512;

/// Default maximum value size in bytes (512 KiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 512 * 1024;

/// Configurable size limits for keys and values.
///
/// # Example
///
/// ```
/// use certkv_store::SizeLimits;
///
/// let limits = SizeLimits::new(256, 1024 * 1024).unwrap();
/// assert_eq!(limits.max_key_size(), 256);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    max_key_size: usize,
    max_value_size: usize,
}

impl SizeLimits {
    /// Creates size limits with the given bounds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidLimit`] if either limit is zero.
    pub fn new(max_key_size: usize, max_value_size: usize) -> Result<Self, StoreError> {
        if max_key_size == 0 {
            return Err(StoreError::InvalidLimit { field: "max_key_size" });
        }
        if max_value_size == 0 {
            return Err(StoreError::InvalidLimit { field: "max_value_size" });
        }
        Ok(Self { max_key_size, max_value_size })
    }

    /// Returns the maximum allowed key size in bytes.
    #[must_use]
    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    /// Returns the maximum allowed value size in bytes.
    #[must_use]
    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self { max_key_size: DEFAULT_MAX_KEY_SIZE, max_value_size: DEFAULT_MAX_VALUE_SIZE }
    }
}

/// Validates key and value sizes against the given limits.
pub fn validate_sizes(key: &[u8], value: &[u8], limits: &SizeLimits) -> Result<(), StoreError> {
    validate_key_size(key, limits)?;
    if value.len() > limits.max_value_size {
        return Err(StoreError::size_limit_exceeded("value", value.len(), limits.max_value_size));
    }
    Ok(())
}

/// Validates key size only, for paths that carry no value.
pub fn validate_key_size(key: &[u8], limits: &SizeLimits) -> Result<(), StoreError> {
    if key.len() > limits.max_key_size {
        return Err(StoreError::size_limit_exceeded("key", key.len(), limits.max_key_size));
    }
    Ok(())
}
