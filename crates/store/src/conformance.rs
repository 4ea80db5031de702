//! Conformance test suite for [`KvStore`] implementations.
//!
//! Each function validates one aspect of the trait contract that certkv
//! relies on. A store adapter for a real Consul cluster, or any other
//! session-capable store, can run the same suite against a fresh instance.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with
//! a fresh store instance:
//!
//! ```no_run
//! use certkv_store::{MemoryKv, conformance};
//!
//! #[tokio::test]
//! async fn crud_get_returns_none_for_missing_key() {
//!     conformance::crud_get_returns_none_for_missing_key(&MemoryKv::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | get/put/delete semantics and indexes |
//! | Listing | raw prefix listing and `delete_tree` |
//! | CAS | `cas_put` / `delete_cas` preconditions |
//! | Session | create, renew, destroy, TTL expiry |
//! | Acquire | session-bound writes, release, lock-delay |
//! | Long-poll | `blocking_get` wake-up and timeout |
//! | Concurrent | exactly one winner under contention |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    backend::KvStore,
    error::StoreError,
    types::{CasCondition, SessionBehavior, SessionOptions},
};

fn long_session() -> SessionOptions {
    SessionOptions::new(Duration::from_secs(30)).with_name("conformance")
}

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<S: KvStore + ?Sized>(store: &S) {
    let result = store.get("crud/missing").await;
    assert!(result.is_ok(), "get should not error on missing key: {result:?}");
    assert_eq!(result.expect("checked above"), None);
}

/// `put` then `get` returns the value with matching create and modify indexes.
pub async fn crud_put_then_get_returns_value<S: KvStore + ?Sized>(store: &S) {
    store.put("crud/k1", b"v1".to_vec()).await.expect("put");
    let entry = store.get("crud/k1").await.expect("get").expect("entry should exist");
    assert_eq!(entry.key, "crud/k1");
    assert_eq!(entry.value, Bytes::from("v1"));
    assert_eq!(entry.create_index, entry.modify_index, "fresh key: create == modify");
    assert!(entry.session.is_none());
}

/// Overwriting advances the modify index and keeps the create index.
pub async fn crud_overwrite_advances_modify_index<S: KvStore + ?Sized>(store: &S) {
    store.put("crud/k2", b"original".to_vec()).await.expect("put");
    let first = store.get("crud/k2").await.expect("get").expect("entry");
    store.put("crud/k2", b"updated".to_vec()).await.expect("overwrite");
    let second = store.get("crud/k2").await.expect("get").expect("entry");

    assert_eq!(second.value, Bytes::from("updated"));
    assert!(second.modify_index > first.modify_index);
    assert_eq!(second.create_index, first.create_index);
}

/// `delete` removes a key, and deleting again is a no-op.
pub async fn crud_delete_is_idempotent<S: KvStore + ?Sized>(store: &S) {
    store.put("crud/k3", b"v".to_vec()).await.expect("put");
    store.delete("crud/k3").await.expect("first delete");
    store.delete("crud/k3").await.expect("second delete should be a no-op");
    assert_eq!(store.get("crud/k3").await.expect("get"), None);
}

/// Empty values are stored and returned as empty, not as missing.
pub async fn crud_empty_value<S: KvStore + ?Sized>(store: &S) {
    store.put("crud/empty", Vec::new()).await.expect("put empty");
    let entry = store.get("crud/empty").await.expect("get").expect("entry");
    assert_eq!(entry.value, Bytes::new());
}

// ============================================================================
// Listing
// ============================================================================

/// `list_keys` is a sorted raw prefix match with no separator implied.
pub async fn list_is_sorted_raw_prefix<S: KvStore + ?Sized>(store: &S) {
    for key in ["ls/b", "ls/a/x", "ls/ab", "lt/a"] {
        store.put(key, b"v".to_vec()).await.expect("put");
    }
    let keys = store.list_keys("ls/a").await.expect("list");
    assert_eq!(keys, vec!["ls/a/x", "ls/ab"]);
}

/// `list_keys` on an unused prefix returns an empty list, not an error.
pub async fn list_empty_prefix_returns_empty<S: KvStore + ?Sized>(store: &S) {
    let keys = store.list_keys("nothing-here/").await.expect("list");
    assert!(keys.is_empty());
}

/// `delete_tree` removes every key under the prefix and nothing else.
pub async fn list_delete_tree_removes_prefix<S: KvStore + ?Sized>(store: &S) {
    for key in ["dt/a", "dt/b/c", "du/a"] {
        store.put(key, b"v".to_vec()).await.expect("put");
    }
    store.delete_tree("dt/").await.expect("delete_tree");
    assert!(store.list_keys("dt/").await.expect("list").is_empty());
    assert!(store.get("du/a").await.expect("get").is_some());
}

// ============================================================================
// CAS
// ============================================================================

/// `Absent` succeeds once and then reports `false`.
pub async fn cas_absent_succeeds_once<S: KvStore + ?Sized>(store: &S) {
    assert!(store.cas_put("cas/a", b"1".to_vec(), CasCondition::Absent).await.expect("cas"));
    assert!(!store.cas_put("cas/a", b"2".to_vec(), CasCondition::Absent).await.expect("cas"));
    let entry = store.get("cas/a").await.expect("get").expect("entry");
    assert_eq!(entry.value, Bytes::from("1"), "failed CAS must not write");
}

/// `ModifyIndex` succeeds only against the current index.
pub async fn cas_modify_index_rejects_stale<S: KvStore + ?Sized>(store: &S) {
    store.put("cas/m", b"1".to_vec()).await.expect("put");
    let stale = store.get("cas/m").await.expect("get").expect("entry").modify_index;
    store.put("cas/m", b"2".to_vec()).await.expect("put");

    assert!(!store.cas_put("cas/m", b"x".to_vec(), CasCondition::ModifyIndex(stale)).await.expect("cas"));
    let current = store.get("cas/m").await.expect("get").expect("entry").modify_index;
    assert!(store.cas_put("cas/m", b"3".to_vec(), CasCondition::ModifyIndex(current)).await.expect("cas"));
}

/// `delete_cas` refuses a stale index and accepts the current one.
pub async fn cas_delete_checks_index<S: KvStore + ?Sized>(store: &S) {
    store.put("cas/d", b"1".to_vec()).await.expect("put");
    let stale = store.get("cas/d").await.expect("get").expect("entry").modify_index;
    store.put("cas/d", b"2".to_vec()).await.expect("put");

    assert!(!store.delete_cas("cas/d", stale).await.expect("delete_cas"));
    let current = store.get("cas/d").await.expect("get").expect("entry").modify_index;
    assert!(store.delete_cas("cas/d", current).await.expect("delete_cas"));
    assert_eq!(store.get("cas/d").await.expect("get"), None);
}

// ============================================================================
// Session
// ============================================================================

/// A created session is visible through `session_info` until destroyed.
pub async fn session_create_and_destroy<S: KvStore + ?Sized>(store: &S) {
    let id = store.create_session(long_session()).await.expect("create_session");
    let info = store.session_info(&id).await.expect("session_info").expect("live session");
    assert_eq!(info.name, "conformance");
    assert_eq!(info.ttl, Duration::from_secs(30));

    store.destroy_session(&id).await.expect("destroy_session");
    assert!(store.session_info(&id).await.expect("session_info").is_none());
}

/// Renewing a destroyed session reports `SessionNotFound`.
pub async fn session_renew_after_destroy_fails<S: KvStore + ?Sized>(store: &S) {
    let id = store.create_session(long_session()).await.expect("create_session");
    store.renew_session(&id).await.expect("renew live session");
    store.destroy_session(&id).await.expect("destroy_session");

    let result = store.renew_session(&id).await;
    assert!(
        matches!(result, Err(StoreError::SessionNotFound { .. })),
        "expected SessionNotFound, got: {result:?}"
    );
}

/// A session that is not renewed expires and releases its keys.
pub async fn session_expires_and_releases<S: KvStore + ?Sized>(store: &S) {
    let opts = SessionOptions::new(Duration::from_millis(200)).with_lock_delay(Duration::ZERO);
    let id = store.create_session(opts).await.expect("create_session");
    assert!(store.cas_put("sess/x", vec![], CasCondition::Acquire(id.clone())).await.expect("acquire"));

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(store.session_info(&id).await.expect("session_info").is_none(), "session should expire");
    let entry = store.get("sess/x").await.expect("get").expect("released key keeps its value");
    assert!(!entry.is_held());
}

// ============================================================================
// Acquire
// ============================================================================

/// Only one session may hold a key; the holder may re-acquire.
pub async fn acquire_is_exclusive<S: KvStore + ?Sized>(store: &S) {
    let a = store.create_session(long_session()).await.expect("session a");
    let b = store.create_session(long_session()).await.expect("session b");

    assert!(store.cas_put("acq/k", b"a".to_vec(), CasCondition::Acquire(a.clone())).await.expect("acquire a"));
    assert!(!store.cas_put("acq/k", b"b".to_vec(), CasCondition::Acquire(b.clone())).await.expect("acquire b"));
    assert!(store.cas_put("acq/k", b"a2".to_vec(), CasCondition::Acquire(a.clone())).await.expect("re-acquire a"));

    let entry = store.get("acq/k").await.expect("get").expect("entry");
    assert!(entry.is_held_by(&a));
    assert_eq!(entry.value, Bytes::from("a2"));

    store.destroy_session(&a).await.expect("destroy a");
    store.destroy_session(&b).await.expect("destroy b");
}

/// Release by the holder frees the key for others immediately.
pub async fn acquire_release_frees_key<S: KvStore + ?Sized>(store: &S) {
    let a = store.create_session(long_session()).await.expect("session a");
    let b = store.create_session(long_session()).await.expect("session b");

    assert!(store.cas_put("rel/k", vec![], CasCondition::Acquire(a.clone())).await.expect("acquire"));
    assert!(!store.cas_put("rel/k", vec![], CasCondition::Release(b.clone())).await.expect("foreign release"));
    assert!(store.cas_put("rel/k", vec![], CasCondition::Release(a.clone())).await.expect("release"));
    assert!(store.cas_put("rel/k", vec![], CasCondition::Acquire(b.clone())).await.expect("acquire b"));

    store.destroy_session(&a).await.expect("destroy a");
    store.destroy_session(&b).await.expect("destroy b");
}

/// Keys released by session invalidation are embargoed for the lock-delay.
pub async fn acquire_honors_lock_delay<S: KvStore + ?Sized>(store: &S) {
    let opts = SessionOptions::new(Duration::from_secs(30)).with_lock_delay(Duration::from_millis(300));
    let a = store.create_session(opts).await.expect("session a");
    let b = store.create_session(long_session()).await.expect("session b");

    assert!(store.cas_put("delay/k", vec![], CasCondition::Acquire(a.clone())).await.expect("acquire"));
    store.destroy_session(&a).await.expect("invalidate a");

    assert!(
        !store.cas_put("delay/k", vec![], CasCondition::Acquire(b.clone())).await.expect("acquire"),
        "acquire during lock-delay must fail"
    );
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(store.cas_put("delay/k", vec![], CasCondition::Acquire(b.clone())).await.expect("acquire"));

    store.destroy_session(&b).await.expect("destroy b");
}

/// Delete-behavior sessions remove their keys on invalidation.
pub async fn acquire_delete_behavior_removes_key<S: KvStore + ?Sized>(store: &S) {
    let opts = long_session().with_behavior(SessionBehavior::Delete);
    let id = store.create_session(opts).await.expect("session");

    assert!(store.cas_put("del/k", b"v".to_vec(), CasCondition::Acquire(id.clone())).await.expect("acquire"));
    store.destroy_session(&id).await.expect("destroy");
    assert_eq!(store.get("del/k").await.expect("get"), None);
}

// ============================================================================
// Long-poll
// ============================================================================

/// `blocking_get` returns once the key changes past the given index.
pub async fn long_poll_wakes_on_write<S: KvStore + ?Sized + 'static>(store: Arc<S>) {
    store.put("poll/k", b"v1".to_vec()).await.expect("put");
    let (_, index) = store.blocking_get("poll/k", 0, Duration::ZERO).await.expect("initial read");

    let writer = Arc::clone(&store);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.put("poll/k", b"v2".to_vec()).await.expect("put");
    });

    let (entry, next) =
        store.blocking_get("poll/k", index, Duration::from_secs(10)).await.expect("blocking_get");
    handle.await.expect("task join");

    assert!(next > index);
    assert_eq!(entry.map(|e| e.value), Some(Bytes::from("v2")));
}

/// `blocking_get` returns unchanged data when the wait elapses.
pub async fn long_poll_times_out<S: KvStore + ?Sized>(store: &S) {
    store.put("poll/idle", b"v".to_vec()).await.expect("put");
    let (_, index) = store.blocking_get("poll/idle", 0, Duration::ZERO).await.expect("read");

    let (entry, next) =
        store.blocking_get("poll/idle", index, Duration::from_millis(100)).await.expect("wait");
    assert_eq!(next, index);
    assert!(entry.is_some());
}

// ============================================================================
// Concurrent
// ============================================================================

/// Concurrent acquires by distinct sessions produce exactly one holder.
pub async fn concurrent_acquire_exactly_one_winner<S: KvStore + ?Sized + 'static>(store: Arc<S>) {
    let mut handles = Vec::new();
    for i in 0u32..10 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let id = store
                .create_session(long_session().with_name(format!("contender-{i}")))
                .await
                .expect("create_session");
            store.cas_put("conc/lock", vec![], CasCondition::Acquire(id)).await.expect("acquire")
        }));
    }

    let mut winners = 0u32;
    for handle in handles {
        if handle.await.expect("task join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one session should win the key");
}

/// Health check succeeds on a healthy store.
pub async fn health_check_succeeds<S: KvStore + ?Sized>(store: &S) {
    store.health_check().await.expect("health_check");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Run the full conformance suite against the given store.
///
/// Every check uses its own key namespace, so one instance serves the whole
/// run.
pub async fn run_all<S: KvStore + ?Sized + 'static>(store: Arc<S>) {
    crud_get_returns_none_for_missing_key(store.as_ref()).await;
    crud_put_then_get_returns_value(store.as_ref()).await;
    crud_overwrite_advances_modify_index(store.as_ref()).await;
    crud_delete_is_idempotent(store.as_ref()).await;
    crud_empty_value(store.as_ref()).await;

    list_is_sorted_raw_prefix(store.as_ref()).await;
    list_empty_prefix_returns_empty(store.as_ref()).await;
    list_delete_tree_removes_prefix(store.as_ref()).await;

    cas_absent_succeeds_once(store.as_ref()).await;
    cas_modify_index_rejects_stale(store.as_ref()).await;
    cas_delete_checks_index(store.as_ref()).await;

    session_create_and_destroy(store.as_ref()).await;
    session_renew_after_destroy_fails(store.as_ref()).await;
    session_expires_and_releases(store.as_ref()).await;

    acquire_is_exclusive(store.as_ref()).await;
    acquire_release_frees_key(store.as_ref()).await;
    acquire_honors_lock_delay(store.as_ref()).await;
    acquire_delete_behavior_removes_key(store.as_ref()).await;

    long_poll_wakes_on_write(Arc::clone(&store)).await;
    long_poll_times_out(store.as_ref()).await;

    concurrent_acquire_exactly_one_winner(Arc::clone(&store)).await;
    health_check_succeeds(store.as_ref()).await;
}
