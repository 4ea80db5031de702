//! In-memory key-value store with sessions.
//!
//! This module provides [`MemoryKv`], an in-memory implementation of
//! [`KvStore`] suitable for testing, development and single-process
//! deployments.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for prefix listing
//! - **Sessions**: TTL'd sessions with release/delete behavior and lock-delay
//! - **Long-poll reads**: Index changes are broadcast over a [`watch`] channel
//!
//! # Example
//!
//! ```
//! use certkv_store::{KvStore, MemoryKv};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryKv::new();
//!
//!     store.put("greeting", b"hello".to_vec()).await.unwrap();
//!     let entry = store.get("greeting").await.unwrap();
//!
//!     assert_eq!(entry.unwrap().value.as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Session expiry is checked on every access and by a sweeper that runs every
//!   [`DEFAULT_SWEEP_INTERVAL`], so idle long-poll waiters observe an expiry up to one interval
//!   late

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep, timeout_at},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    backend::KvStore,
    error::{StoreError, StoreResult},
    size_limits::{SizeLimits, validate_key_size, validate_sizes},
    types::{CasCondition, KvEntry, SessionBehavior, SessionId, SessionInfo, SessionOptions},
};

/// How often the background task invalidates expired sessions.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Holds the shutdown signal sender. When dropped, the watch channel
/// closes and the sweeper task exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        // Best-effort; the receiver may already be gone.
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Bytes,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    session: Option<SessionId>,
}

impl StoredEntry {
    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_owned(),
            value: self.value.clone(),
            create_index: self.create_index,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
            session: self.session.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionState {
    name: String,
    ttl: Duration,
    behavior: SessionBehavior,
    lock_delay: Duration,
    create_index: u64,
    expires_at: Instant,
}

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, StoredEntry>,
    sessions: HashMap<SessionId, SessionState>,
    /// Keys released by an invalidated session, mapped to the end of their embargo.
    lock_delays: HashMap<String, Instant>,
    /// Index at which a key was last deleted, so long-poll waiters wake on deletes.
    tombstones: HashMap<String, u64>,
    index: u64,
}

impl State {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn entry(&self, key: &str) -> Option<KvEntry> {
        self.entries.get(key).map(|e| e.to_entry(key))
    }

    fn key_index(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|e| e.modify_index)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }

    fn is_embargoed(&self, key: &str, now: Instant) -> bool {
        self.lock_delays.get(key).is_some_and(|until| *until > now)
    }

    fn has_expired_sessions(&self, now: Instant) -> bool {
        self.sessions.values().any(|s| s.expires_at <= now)
    }

    fn upsert(&mut self, key: &str, value: Bytes) -> &mut StoredEntry {
        let index = self.next_index();
        self.tombstones.remove(key);
        let entry = self.entries.entry(key.to_owned()).or_insert_with(|| StoredEntry {
            value: Bytes::new(),
            create_index: index,
            modify_index: index,
            lock_index: 0,
            session: None,
        });
        entry.value = value;
        entry.modify_index = index;
        entry
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        let index = self.next_index();
        self.tombstones.insert(key.to_owned(), index);
        true
    }

    /// Invalidates a session and applies its behavior to every held key.
    ///
    /// Returns `false` if the session did not exist.
    fn invalidate(&mut self, id: &SessionId, now: Instant) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };

        let held: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.session.as_ref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect();

        for key in held {
            let index = self.next_index();
            match session.behavior {
                SessionBehavior::Release => {
                    if let Some(entry) = self.entries.get_mut(&key) {
                        entry.session = None;
                        entry.modify_index = index;
                    }
                    if !session.lock_delay.is_zero() {
                        self.lock_delays.insert(key, now + session.lock_delay);
                    }
                },
                SessionBehavior::Delete => {
                    self.entries.remove(&key);
                    self.tombstones.insert(key, index);
                },
            }
        }

        self.lock_delays.retain(|_, until| *until > now);
        true
    }

    fn reap_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<(SessionId, Instant)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, s)| (id.clone(), s.expires_at))
            .collect();

        // Lock-delay runs from the moment of expiry, not from when it was noticed.
        for (id, expired_at) in &expired {
            debug!(session = %id, "session expired");
            self.invalidate(id, *expired_at);
        }
        !expired.is_empty()
    }
}

/// Invalidates expired sessions and wakes long-poll waiters if anything changed.
fn reap(state: &RwLock<State>, index_tx: &watch::Sender<u64>) {
    let now = Instant::now();
    if !state.read().has_expired_sessions(now) {
        return;
    }
    let mut guard = state.write();
    if guard.reap_expired(now) {
        index_tx.send_replace(guard.index);
    }
}

/// In-memory key-value store with sessions.
///
/// # Cloning
///
/// `MemoryKv` is cheaply cloneable via [`Arc`]. All clones share the same
/// data, so clones stand in for separate server instances talking to one
/// store.
///
/// # Shutdown
///
/// The background sweeper stops automatically when all clones are dropped.
/// You can also call [`shutdown`](Self::shutdown) to stop it explicitly;
/// expiry is still enforced lazily on every access afterwards.
#[derive(Clone)]
pub struct MemoryKv {
    state: Arc<RwLock<State>>,
    index_tx: Arc<watch::Sender<u64>>,
    limits: SizeLimits,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryKv")
            .field("entries", &state.entries.len())
            .field("sessions", &state.sessions.len())
            .field("index", &state.index)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl MemoryKv {
    /// Creates a new in-memory store with default size limits.
    ///
    /// This spawns the session sweeper, so it must be called within a Tokio
    /// runtime.
    pub fn new() -> Self {
        Self::with_settings(SizeLimits::default(), DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a store enforcing the given size limits.
    pub fn with_limits(limits: SizeLimits) -> Self {
        Self::with_settings(limits, DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a store whose sweeper runs at the given interval.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self::with_settings(SizeLimits::default(), interval)
    }

    fn with_settings(limits: SizeLimits, sweep_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (index_tx, _) = watch::channel(0);
        let store = Self {
            state: Arc::new(RwLock::new(State::default())),
            index_tx: Arc::new(index_tx),
            limits,
            shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }),
        };

        // The task must not hold a clone of the store itself, or the guard
        // would never drop.
        let state = Arc::clone(&store.state);
        let index_tx = Arc::clone(&store.index_tx);
        tokio::spawn(async move {
            sweep_expired_sessions(state, index_tx, shutdown_rx, sweep_interval).await;
        });

        store
    }

    /// Explicitly signals the background sweeper to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Returns the size limits enforced on writes.
    #[must_use]
    pub fn limits(&self) -> SizeLimits {
        self.limits
    }

    fn reap(&self) {
        reap(&self.state, &self.index_tx);
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_replace(index);
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_expired_sessions(
    state: Arc<RwLock<State>>,
    index_tx: Arc<watch::Sender<u64>>,
    mut shutdown_rx: watch::Receiver<()>,
    interval: Duration,
) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }
        reap(&state, &index_tx);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<KvEntry>> {
        fail_point!("memory-kv-get", |_| Err(StoreError::connection("injected get failure")));
        self.reap();
        Ok(self.state.read().entry(key))
    }

    #[tracing::instrument(skip(self, value), fields(value_len = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        fail_point!("memory-kv-put", |_| Err(StoreError::connection("injected put failure")));
        validate_sizes(key.as_bytes(), &value, &self.limits)?;

        let index = {
            let mut state = self.state.write();
            state.upsert(key, Bytes::from(value));
            state.index
        };
        self.publish(index);
        Ok(())
    }

    #[tracing::instrument(skip(self, value), fields(value_len = value.len()))]
    async fn cas_put(
        &self,
        key: &str,
        value: Vec<u8>,
        condition: CasCondition,
    ) -> StoreResult<bool> {
        validate_sizes(key.as_bytes(), &value, &self.limits)?;
        self.reap();

        let now = Instant::now();
        let mut state = self.state.write();
        let current = state.entries.get(key);
        let held_by_caller = match &condition {
            CasCondition::Acquire(s) | CasCondition::Release(s) => {
                current.is_some_and(|e| e.session.as_ref() == Some(s))
            },
            _ => false,
        };

        let allowed = match &condition {
            CasCondition::Absent | CasCondition::ModifyIndex(0) => current.is_none(),
            CasCondition::ModifyIndex(index) => current.is_some_and(|e| e.modify_index == *index),
            CasCondition::Acquire(session) => {
                if !state.sessions.contains_key(session) {
                    return Err(StoreError::session_not_found(session.as_str()));
                }
                let held_by_other = current.is_some_and(|e| e.session.is_some());
                held_by_caller || (!held_by_other && !state.is_embargoed(key, now))
            },
            CasCondition::Release(_) => held_by_caller,
        };

        if !allowed {
            debug!(key, ?condition, "conditional write rejected");
            return Ok(false);
        }

        let entry = state.upsert(key, Bytes::from(value));
        match condition {
            CasCondition::Acquire(session) => {
                if !held_by_caller {
                    entry.lock_index += 1;
                }
                entry.session = Some(session);
            },
            CasCondition::Release(_) => entry.session = None,
            CasCondition::Absent | CasCondition::ModifyIndex(_) => {},
        }

        let index = state.index;
        drop(state);
        self.publish(index);
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key_size(key.as_bytes(), &self.limits)?;

        let removed = {
            let mut state = self.state.write();
            state.remove(key).then_some(state.index)
        };
        if let Some(index) = removed {
            self.publish(index);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_cas(&self, key: &str, modify_index: u64) -> StoreResult<bool> {
        self.reap();

        let removed = {
            let mut state = self.state.write();
            let matches = state.entries.get(key).is_some_and(|e| e.modify_index == modify_index);
            (matches && state.remove(key)).then_some(state.index)
        };
        match removed {
            Some(index) => {
                self.publish(index);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete_tree(&self, prefix: &str) -> StoreResult<()> {
        let index = {
            let mut state = self.state.write();
            let keys: Vec<String> = state
                .entries
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            if keys.is_empty() {
                return Ok(());
            }
            for key in &keys {
                state.remove(key);
            }
            state.index
        };
        self.publish(index);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        fail_point!("memory-kv-list", |_| Err(StoreError::connection("injected list failure")));
        self.reap();

        let state = self.state.read();
        Ok(state
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    #[tracing::instrument(skip(self), fields(ttl_ms = options.ttl.as_millis() as u64))]
    async fn create_session(&self, options: SessionOptions) -> StoreResult<SessionId> {
        fail_point!("memory-kv-create-session", |_| {
            Err(StoreError::connection("injected session failure"))
        });
        if options.ttl.is_zero() {
            return Err(StoreError::internal("session ttl must be greater than zero"));
        }

        let id = SessionId::new(Uuid::new_v4().to_string());
        let mut state = self.state.write();
        let create_index = state.next_index();
        state.sessions.insert(
            id.clone(),
            SessionState {
                name: options.name,
                ttl: options.ttl,
                behavior: options.behavior,
                lock_delay: options.lock_delay,
                create_index,
                expires_at: Instant::now() + options.ttl,
            },
        );
        debug!(session = %id, "session created");
        Ok(id)
    }

    #[tracing::instrument(skip(self), fields(session = %session))]
    async fn renew_session(&self, session: &SessionId) -> StoreResult<()> {
        self.reap();

        let mut state = self.state.write();
        match state.sessions.get_mut(session) {
            Some(s) => {
                s.expires_at = Instant::now() + s.ttl;
                Ok(())
            },
            None => Err(StoreError::session_not_found(session.as_str())),
        }
    }

    #[tracing::instrument(skip(self), fields(session = %session))]
    async fn destroy_session(&self, session: &SessionId) -> StoreResult<()> {
        let invalidated = {
            let mut state = self.state.write();
            state.invalidate(session, Instant::now()).then_some(state.index)
        };
        if let Some(index) = invalidated {
            debug!("session destroyed");
            self.publish(index);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(session = %session))]
    async fn session_info(&self, session: &SessionId) -> StoreResult<Option<SessionInfo>> {
        self.reap();

        let state = self.state.read();
        Ok(state.sessions.get(session).map(|s| SessionInfo {
            id: session.clone(),
            name: s.name.clone(),
            ttl: s.ttl,
            behavior: s.behavior,
            lock_delay: s.lock_delay,
            create_index: s.create_index,
        }))
    }

    #[tracing::instrument(skip(self), fields(wait_ms = wait.as_millis() as u64))]
    async fn blocking_get(
        &self,
        key: &str,
        last_index: u64,
        wait: Duration,
    ) -> StoreResult<(Option<KvEntry>, u64)> {
        let deadline = Instant::now() + wait;
        let mut index_rx = self.index_tx.subscribe();

        loop {
            self.reap();
            let (entry, index) = {
                let state = self.state.read();
                (state.entry(key), state.key_index(key))
            };

            if last_index == 0 || index > last_index {
                return Ok((entry, index));
            }

            match timeout_at(deadline, index_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Timed out, or the store is gone: report what we have.
                Ok(Err(_)) | Err(_) => return Ok((entry, index.max(last_index))),
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn health_check(&self) -> StoreResult<()> {
        fail_point!("memory-kv-health", |_| Err(StoreError::connection("injected health failure")));
        // Acquiring the read lock shows we are not deadlocked.
        let _unused = self.state.read();
        Ok(())
    }
}
