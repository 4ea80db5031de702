#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Lock behavior across storage instances sharing one store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use certkv::{CertStorage, CertStorageConfig, CertStorageError, LockRenewal};
use certkv_store::{
    KvStore, MemoryKv,
    testutil::{StallingKv, StoreOp},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SITE: &str = "acme/example.com/sites/example.com";

fn fast_config() -> CertStorageConfig {
    CertStorageConfig::builder()
        .lock_ttl(Duration::from_secs(1))
        .lock_delay(Duration::ZERO)
        .lock_retry_interval(Duration::from_millis(20))
        .lock_wait_poll(Duration::from_millis(200))
        .build()
        .unwrap()
}

/// Two instances over the same store, as two servers in a cluster.
fn cluster(config: &CertStorageConfig) -> (Arc<MemoryKv>, Arc<CertStorage>, Arc<CertStorage>) {
    let store = Arc::new(MemoryKv::new());
    let a = CertStorage::new(Arc::clone(&store) as Arc<dyn KvStore>, config.clone());
    let b = CertStorage::new(Arc::clone(&store) as Arc<dyn KvStore>, config.clone());
    (store, Arc::new(a), Arc::new(b))
}

#[tokio::test]
async fn lock_then_unlock() {
    let (_, a, _) = cluster(&fast_config());

    a.lock(SITE).await.unwrap();
    assert!(a.is_locked(SITE));
    a.unlock(SITE).await.unwrap();
    assert!(!a.is_locked(SITE));
}

#[tokio::test]
async fn second_instance_waits_for_release() {
    let (_, a, b) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    let acquired = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let b = Arc::clone(&b);
        let acquired = Arc::clone(&acquired);
        tokio::spawn(async move {
            b.lock(SITE).await.unwrap();
            acquired.fetch_add(1, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(acquired.load(Ordering::SeqCst), 0, "second instance must block while the lock is held");

    a.unlock(SITE).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), waiter).await.expect("waiter should acquire").unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), 1);
    b.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn critical_sections_do_not_overlap() {
    let (_, a, b) = cluster(&fast_config());
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = [a, b]
        .into_iter()
        .map(|storage| {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            tokio::spawn(async move {
                for _ in 0..5 {
                    storage.lock(SITE).await.unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    storage.unlock(SITE).await.unwrap();
                }
            })
        })
        .collect();

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task).await.expect("workers finish").unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn callers_sharing_an_instance_take_turns() {
    let (_, storage, _) = cluster(&fast_config());
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            tokio::spawn(async move {
                for _ in 0..3 {
                    storage.lock(SITE).await.unwrap();
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    storage.unlock(SITE).await.expect("each caller releases its own lock");
                }
            })
        })
        .collect();

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task).await.expect("workers finish").unwrap();
    }
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(!storage.is_locked(SITE));
}

#[tokio::test]
async fn data_key_named_like_a_lock_survives_locking() {
    let (_, a, _) = cluster(&fast_config());
    let data = format!("{SITE}.lock");
    a.store(&data, b"payload").await.unwrap();

    a.lock(SITE).await.unwrap();
    assert_eq!(a.load(&data).await.unwrap(), b"payload");
    a.unlock(SITE).await.unwrap();

    assert_eq!(a.load(&data).await.unwrap(), b"payload");
    assert_eq!(a.list("acme/example.com/sites", true).await.unwrap(), vec![data]);
}

#[tokio::test]
async fn crashed_holder_frees_lock_after_ttl_and_delay() {
    let config = CertStorageConfig::builder()
        .lock_ttl(Duration::from_secs(1))
        .lock_delay(Duration::from_millis(500))
        .lock_retry_interval(Duration::from_millis(20))
        .lock_wait_poll(Duration::from_millis(200))
        .lock_renewal(LockRenewal::Manual)
        .build()
        .unwrap();
    let (_, a, b) = cluster(&config);

    // Instance a takes the lock and never renews it, as if it crashed.
    a.lock(SITE).await.unwrap();
    let started = Instant::now();

    tokio::time::timeout(Duration::from_secs(5), b.lock(SITE))
        .await
        .expect("lock must free itself after TTL and lock-delay")
        .unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(1400), "acquired too early: {waited:?}");
    b.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_waiting() {
    let (_, a, b) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let b = Arc::clone(&b);
        let cancel = cancel.clone();
        tokio::spawn(async move { b.lock_with_cancellation(SITE, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("cancelled waiter should return promptly")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CertStorageError::Cancelled { .. }), "got: {err:?}");
    assert!(!b.is_locked(SITE));
    a.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn cancellation_interrupts_unanswered_acquire() {
    let stalling = Arc::new(StallingKv::new(MemoryKv::new()));
    let storage = Arc::new(CertStorage::new(Arc::clone(&stalling) as Arc<dyn KvStore>, fast_config()));
    // Sessions open, but the acquire write never gets an answer.
    stalling.stall(StoreOp::Write);

    let cancel = CancellationToken::new();
    let waiter = {
        let storage = Arc::clone(&storage);
        let cancel = cancel.clone();
        tokio::spawn(async move { storage.lock_with_cancellation(SITE, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("cancelled caller should return while the store stalls")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CertStorageError::Cancelled { .. }), "got: {err:?}");
    assert!(!storage.is_locked(SITE));
}

#[tokio::test]
async fn wait_timeout_is_reported() {
    let config = CertStorageConfig::builder()
        .lock_ttl(Duration::from_secs(1))
        .lock_wait_timeout(Duration::from_millis(300))
        .lock_wait_poll(Duration::from_millis(100))
        .build()
        .unwrap();
    let (_, a, b) = cluster(&config);
    a.lock(SITE).await.unwrap();

    let err = b.lock(SITE).await.unwrap_err();
    match err {
        CertStorageError::LockTimeout { key, waited } => {
            assert_eq!(key, SITE);
            assert!(waited >= Duration::from_millis(300), "{waited:?}");
        },
        other => panic!("expected LockTimeout, got: {other:?}"),
    }
    a.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn try_lock_reports_contention() {
    let (_, a, b) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    let err = b.try_lock(SITE).await.unwrap_err();
    assert!(matches!(err, CertStorageError::LockContention { .. }), "got: {err:?}");

    a.unlock(SITE).await.unwrap();
    b.try_lock(SITE).await.unwrap();
    b.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn unlock_by_other_instance_is_rejected() {
    let (_, a, b) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    let err = b.unlock(SITE).await.unwrap_err();
    assert!(matches!(err, CertStorageError::LockNotHeld { .. }), "got: {err:?}");
    assert!(a.is_locked(SITE));
    a.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn unlock_destroys_session() {
    let (store, a, _) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    let entry = store.get(&format!("caddytls.locks/{SITE}")).await.unwrap().unwrap();
    let session = entry.session.expect("lock key is bound to a session");

    a.unlock(SITE).await.unwrap();

    assert!(store.session_info(&session).await.unwrap().is_none());
    assert!(store.get(&format!("caddytls.locks/{SITE}")).await.unwrap().is_none());
}

#[tokio::test]
async fn held_lock_survives_beyond_ttl() {
    let (_, a, b) = cluster(&fast_config());
    a.lock(SITE).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(a.is_locked(SITE));
    assert!(matches!(b.try_lock(SITE).await, Err(CertStorageError::LockContention { .. })));
    a.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn lost_lock_is_reacquired() {
    let config = CertStorageConfig::builder()
        .lock_ttl(Duration::from_secs(1))
        .lock_delay(Duration::ZERO)
        .lock_renewal(LockRenewal::Manual)
        .build()
        .unwrap();
    let (_, a, _) = cluster(&config);
    a.lock(SITE).await.unwrap();

    // Not renewed: the session expires, and the unlock reports it.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let err = a.unlock(SITE).await.unwrap_err();
    assert!(matches!(err, CertStorageError::LockLost { .. }), "got: {err:?}");

    a.lock(SITE).await.unwrap();
    a.unlock(SITE).await.unwrap();
}

#[tokio::test]
async fn locks_do_not_appear_in_listings() {
    let (_, a, _) = cluster(&fast_config());
    a.store(&format!("{SITE}/example.com.crt"), b"crt").await.unwrap();
    a.lock(SITE).await.unwrap();

    assert_eq!(a.list("acme/example.com/sites", false).await.unwrap(), vec![SITE]);
    assert_eq!(a.list("acme", true).await.unwrap(), vec![format!("{SITE}/example.com.crt")]);
    a.unlock(SITE).await.unwrap();
}
