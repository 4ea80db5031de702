//! Shared test utilities for key-value store testing.
//!
//! This module provides helpers for creating populated stores, stores that
//! are unreachable or never answer, and assertion macros for [`StoreResult`] values.
//! It is feature-gated behind `testutil` to prevent leaking into production
//! builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! certkv-store = { workspace = true, features = ["testutil"] }
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    KvStore,
    error::{StoreError, StoreResult},
    memory::MemoryKv,
    types::{CasCondition, KvEntry, SessionId, SessionInfo, SessionOptions},
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix/000042"`. The zero-padding keeps
/// lexicographic order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> String {
    format!("{prefix}/{idx:06}")
}

/// Create a [`MemoryKv`] pre-populated with `count` keys under `prefix`.
///
/// # Panics
///
/// Panics if any `put` fails (should not happen with `MemoryKv`).
pub async fn populated_store(prefix: &str, count: usize) -> MemoryKv {
    let store = MemoryKv::new();
    for i in 0..count {
        store.put(&make_key(prefix, i), format!("value-{i}").into_bytes()).await.expect("populate put failed");
    }
    store
}

/// A store whose every operation fails with a connection error.
///
/// Stands in for an unreachable cluster when testing how callers surface
/// transport failures.
#[derive(Debug, Clone)]
pub struct UnreachableKv {
    message: String,
}

impl UnreachableKv {
    /// Creates a store that fails with the given connection message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    fn fail<T>(&self) -> StoreResult<T> {
        Err(StoreError::connection(self.message.clone()))
    }
}

impl Default for UnreachableKv {
    fn default() -> Self {
        Self::new("connection refused")
    }
}

#[async_trait]
impl KvStore for UnreachableKv {
    async fn get(&self, _key: &str) -> StoreResult<Option<KvEntry>> {
        self.fail()
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> StoreResult<()> {
        self.fail()
    }

    async fn cas_put(&self, _key: &str, _value: Vec<u8>, _condition: CasCondition) -> StoreResult<bool> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        self.fail()
    }

    async fn delete_cas(&self, _key: &str, _modify_index: u64) -> StoreResult<bool> {
        self.fail()
    }

    async fn delete_tree(&self, _prefix: &str) -> StoreResult<()> {
        self.fail()
    }

    async fn list_keys(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        self.fail()
    }

    async fn create_session(&self, _options: SessionOptions) -> StoreResult<SessionId> {
        self.fail()
    }

    async fn renew_session(&self, _session: &SessionId) -> StoreResult<()> {
        self.fail()
    }

    async fn destroy_session(&self, _session: &SessionId) -> StoreResult<()> {
        self.fail()
    }

    async fn session_info(&self, _session: &SessionId) -> StoreResult<Option<SessionInfo>> {
        self.fail()
    }

    async fn blocking_get(
        &self,
        _key: &str,
        _last_index: u64,
        _wait: Duration,
    ) -> StoreResult<(Option<KvEntry>, u64)> {
        self.fail()
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.fail()
    }
}

/// A store operation that [`StallingKv`] can hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// Reads: `get`, `list_keys`, `blocking_get`.
    Read,
    /// Writes: `put`, `cas_put`, `delete`, `delete_cas`, `delete_tree`.
    Write,
    /// Session calls: `create_session`, `renew_session`, `destroy_session`, `session_info`.
    Session,
}

/// Wraps a [`MemoryKv`] and leaves chosen kinds of operation pending forever.
///
/// Stands in for a cluster that accepts requests but never answers, for
/// testing that callers still honor cancellation and deadlines.
#[derive(Debug)]
pub struct StallingKv {
    inner: MemoryKv,
    stalled: parking_lot::Mutex<Vec<StoreOp>>,
}

impl StallingKv {
    /// Wraps `inner` with nothing stalled yet.
    pub fn new(inner: MemoryKv) -> Self {
        Self { inner, stalled: parking_lot::Mutex::new(Vec::new()) }
    }

    /// Leaves every later call of kind `op` pending.
    pub fn stall(&self, op: StoreOp) {
        let mut stalled = self.stalled.lock();
        if !stalled.contains(&op) {
            stalled.push(op);
        }
    }

    /// Lets later calls of kind `op` through again.
    pub fn resume(&self, op: StoreOp) {
        self.stalled.lock().retain(|stalled| *stalled != op);
    }

    /// The wrapped store.
    pub fn inner(&self) -> &MemoryKv {
        &self.inner
    }

    async fn gate(&self, op: StoreOp) {
        let stalled = self.stalled.lock().contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl KvStore for StallingKv {
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        self.gate(StoreOp::Read).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.gate(StoreOp::Write).await;
        self.inner.put(key, value).await
    }

    async fn cas_put(&self, key: &str, value: Vec<u8>, condition: CasCondition) -> StoreResult<bool> {
        self.gate(StoreOp::Write).await;
        self.inner.cas_put(key, value, condition).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.gate(StoreOp::Write).await;
        self.inner.delete(key).await
    }

    async fn delete_cas(&self, key: &str, modify_index: u64) -> StoreResult<bool> {
        self.gate(StoreOp::Write).await;
        self.inner.delete_cas(key, modify_index).await
    }

    async fn delete_tree(&self, prefix: &str) -> StoreResult<()> {
        self.gate(StoreOp::Write).await;
        self.inner.delete_tree(prefix).await
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.gate(StoreOp::Read).await;
        self.inner.list_keys(prefix).await
    }

    async fn create_session(&self, options: SessionOptions) -> StoreResult<SessionId> {
        self.gate(StoreOp::Session).await;
        self.inner.create_session(options).await
    }

    async fn renew_session(&self, session: &SessionId) -> StoreResult<()> {
        self.gate(StoreOp::Session).await;
        self.inner.renew_session(session).await
    }

    async fn destroy_session(&self, session: &SessionId) -> StoreResult<()> {
        self.gate(StoreOp::Session).await;
        self.inner.destroy_session(session).await
    }

    async fn session_info(&self, session: &SessionId) -> StoreResult<Option<SessionInfo>> {
        self.gate(StoreOp::Session).await;
        self.inner.session_info(session).await
    }

    async fn blocking_get(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> StoreResult<(Option<KvEntry>, u64)> {
        self.gate(StoreOp::Read).await;
        self.inner.blocking_get(key, last_index, wait).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }
}

/// Assert that a [`StoreResult`] is a [`StoreError::SessionNotFound`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use certkv_store::{StoreError, StoreResult, assert_session_not_found};
///
/// let result: StoreResult<()> = Err(StoreError::session_not_found("s1"));
/// assert_session_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_session_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StoreError::SessionNotFound { .. })),
            "expected StoreError::SessionNotFound, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StoreResult`] is a transient failure.
#[macro_export]
macro_rules! assert_transient {
    ($result:expr) => {
        match &$result {
            Err(e) if e.is_transient() => {},
            other => panic!("expected a transient StoreError, got: {other:?}"),
        }
    };
}

/// Assert that a [`StoreResult`] is `Ok` and return the inner value.
#[macro_export]
macro_rules! assert_store_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StoreError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StoreError: {e:?}", $msg),
        }
    };
}
