//! Key-value store trait definition.
//!
//! This module defines the [`KvStore`] trait, the set of primitives certkv
//! needs from a distributed key-value store: single-key reads and writes,
//! conditional writes, flat prefix listing, TTL'd sessions, and long-poll
//! reads.
//!
//! # Design Philosophy
//!
//! - **Keys are slash-delimited strings, values are bytes**: no assumption about the value format
//! - **Flat key space**: hierarchy is a convention of the caller, listing is by raw prefix
//! - **Conditions are answers, not errors**: a failed precondition is `Ok(false)`
//! - **Object safe**: stores are shared as `Arc<dyn KvStore>`
//!
//! Connection setup, retries and TLS to the store live in the implementation,
//! never in callers.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::StoreResult,
    types::{CasCondition, KvEntry, SessionId, SessionInfo, SessionOptions},
};

/// Abstract key-value store with session support.
///
/// Implementations must be thread-safe (`Send + Sync`) and linearizable per
/// key: a read that starts after a write was acknowledged observes it.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](KvStore::get) | Read a single entry |
/// | [`put`](KvStore::put) | Unconditional write |
/// | [`cas_put`](KvStore::cas_put) | Conditional write, including lock acquire/release |
/// | [`delete`](KvStore::delete) | Remove a key |
/// | [`delete_cas`](KvStore::delete_cas) | Remove a key if unmodified |
/// | [`delete_tree`](KvStore::delete_tree) | Remove every key under a prefix |
/// | [`list_keys`](KvStore::list_keys) | Flat prefix listing |
/// | [`create_session`](KvStore::create_session) | Open a TTL'd session |
/// | [`renew_session`](KvStore::renew_session) | Reset a session's TTL |
/// | [`destroy_session`](KvStore::destroy_session) | Invalidate a session |
/// | [`blocking_get`](KvStore::blocking_get) | Long-poll a key for changes |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use certkv_store::{KvStore, MemoryKv};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryKv::new();
///
/// store.put("caddytls/key", b"value".to_vec()).await.unwrap();
/// let entry = store.get("caddytls/key").await.unwrap().unwrap();
/// assert_eq!(entry.value, Bytes::from("value"));
/// # });
/// ```
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Retrieves the entry stored at `key`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(entry))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on store errors
    #[must_use = "store operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>>;

    /// Stores a value, overwriting any existing value.
    ///
    /// A session hold on the key, if any, is kept.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Conditionally stores a value.
    ///
    /// Returns `Ok(true)` if the write was applied and `Ok(false)` if the
    /// [`CasCondition`] did not hold. `Acquire` against a missing or expired
    /// session fails with [`SessionNotFound`](crate::StoreError::SessionNotFound).
    #[must_use = "conditional writes report their outcome and it must be inspected"]
    async fn cas_put(&self, key: &str, value: Vec<u8>, condition: CasCondition)
    -> StoreResult<bool>;

    /// Deletes a key.
    ///
    /// If the key doesn't exist, this is a no-op.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Deletes a key only if its modify index equals `modify_index`.
    ///
    /// Returns `Ok(false)` if the key was modified or removed in the meantime.
    #[must_use = "conditional writes report their outcome and it must be inspected"]
    async fn delete_cas(&self, key: &str, modify_index: u64) -> StoreResult<bool>;

    /// Deletes every key starting with `prefix`.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn delete_tree(&self, prefix: &str) -> StoreResult<()>;

    /// Lists all keys starting with `prefix`, in key order.
    ///
    /// Matching is a raw string prefix match; no separator is implied.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Opens a session with a bounded time-to-live.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn create_session(&self, options: SessionOptions) -> StoreResult<SessionId>;

    /// Resets the session's TTL.
    ///
    /// # Errors
    ///
    /// [`SessionNotFound`](crate::StoreError::SessionNotFound) if the session
    /// was destroyed or has expired.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn renew_session(&self, session: &SessionId) -> StoreResult<()>;

    /// Invalidates the session, applying its behavior to every held key.
    ///
    /// Destroying an unknown session is a no-op.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn destroy_session(&self, session: &SessionId) -> StoreResult<()>;

    /// Returns details of a live session, or `None` if it is gone.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn session_info(&self, session: &SessionId) -> StoreResult<Option<SessionInfo>>;

    /// Reads `key`, waiting up to `wait` for it to change past `last_index`.
    ///
    /// Returns the current entry together with the index to pass as
    /// `last_index` on the next call. With `last_index == 0` it returns
    /// immediately.
    #[must_use = "store operations may fail and errors must be handled"]
    async fn blocking_get(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> StoreResult<(Option<KvEntry>, u64)>;

    /// Checks that the store is reachable and serving requests.
    #[must_use = "health check results indicate store availability and must be inspected"]
    async fn health_check(&self) -> StoreResult<()>;
}
