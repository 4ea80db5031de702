//! Distributed mutual exclusion over store sessions.
//!
//! A lock is a single key in the store bound to a session with a TTL. The
//! store guarantees that at most one live session holds the key; if the
//! holder crashes its session expires, the key is released, and after the
//! session's lock-delay another instance may acquire it.
//!
//! # Acquisition
//!
//! 1. Open a session (`Release` behavior, configured TTL and lock-delay).
//! 2. Read the lock key. If another session holds it, long-poll the key
//!    until it changes, then go back to 2.
//! 3. `cas_put(Acquire)`. On success the lock is held. If the key turned out
//!    to be held, go back to 2; if it is free but the store refused (lock-delay
//!    embargo), sleep the retry interval with jitter and go back to 2.
//!
//! Every store call of the wait, session creation included, is bounded by
//! the caller's [`CancellationToken`] and by the optional wait timeout. The
//! waiting session is kept alive while waiting and destroyed on every path
//! that does not end with the lock held.
//!
//! # Holding
//!
//! With [`LockRenewal::Automatic`] a background task renews the session every
//! half TTL and marks the handle lost if the store reports the session gone.
//! With [`LockRenewal::Manual`] the caller renews through
//! [`LockHandle::renew`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use certkv_store::{CasCondition, KvStore, SessionBehavior, SessionId, SessionOptions, StoreError};
use rand::Rng;
use tokio::{select, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::{
        CertStorageConfig, DEFAULT_LOCK_DELAY, DEFAULT_LOCK_RETRY_INTERVAL, DEFAULT_LOCK_TTL,
        DEFAULT_LOCK_WAIT_POLL, LockRenewal,
    },
    error::{CertResult, CertStorageError},
};

/// Name given to lock sessions in the store.
pub const LOCK_SESSION_NAME: &str = "certkv-lock";

/// Tuning for [`DistributedLock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Session TTL.
    pub ttl: Duration,
    /// Embargo on the key after the holder's session is invalidated.
    pub lock_delay: Duration,
    /// Upper bound on a blocking acquire; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
    /// Base pause before retrying an acquire refused while the key is free.
    pub retry_interval: Duration,
    /// Upper bound of a single long-poll on a held key.
    pub wait_poll: Duration,
    /// How a held lock's session is kept alive.
    pub renewal: LockRenewal,
}

impl LockOptions {
    /// Extracts the lock settings from a storage configuration.
    #[must_use]
    pub fn from_config(config: &CertStorageConfig) -> Self {
        Self {
            ttl: config.lock_ttl(),
            lock_delay: config.lock_delay(),
            wait_timeout: config.lock_wait_timeout(),
            retry_interval: config.lock_retry_interval(),
            wait_poll: config.lock_wait_poll(),
            renewal: config.lock_renewal(),
        }
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions::new(self.ttl)
            .with_name(LOCK_SESSION_NAME)
            .with_behavior(SessionBehavior::Release)
            .with_lock_delay(self.lock_delay)
    }

    /// Interval at which a session must be renewed to stay alive.
    fn renew_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(1))
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            wait_timeout: None,
            retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            wait_poll: DEFAULT_LOCK_WAIT_POLL,
            renewal: LockRenewal::Automatic,
        }
    }
}

/// Owned store session.
///
/// Destroyed explicitly with [`destroy`](Self::destroy); if dropped without
/// that, a best-effort destroy is spawned on the current runtime and the TTL
/// covers the rest.
struct Session {
    store: Arc<dyn KvStore>,
    id: SessionId,
    renewed_at: Instant,
    destroyed: bool,
}

impl Session {
    async fn create(store: &Arc<dyn KvStore>, options: &LockOptions) -> CertResult<Self> {
        let id = store.create_session(options.session_options()).await?;
        Ok(Self { store: Arc::clone(store), id, renewed_at: Instant::now(), destroyed: false })
    }

    async fn renew(&mut self) -> Result<(), StoreError> {
        self.store.renew_session(&self.id).await?;
        self.renewed_at = Instant::now();
        Ok(())
    }

    async fn destroy(&mut self) -> CertResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.store.destroy_session(&self.id).await?;
        Ok(())
    }

    /// Marks the session as gone without contacting the store.
    fn forget(&mut self) {
        self.destroyed = true;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.destroy_session(&id).await {
                        warn!(session = %id, error = %e, "session destroy on drop failed; TTL will reclaim it");
                    }
                });
            },
            Err(_) => warn!(session = %id, "no runtime to destroy session on drop; TTL will reclaim it"),
        }
    }
}

/// Limits on one blocking acquire.
struct WaitBounds<'a> {
    cancel: &'a CancellationToken,
    started: Instant,
    deadline: Option<Instant>,
}

enum Attempt {
    Acquired,
    /// Held by another session; the index to long-poll from.
    Held(u64),
    /// Free but refused, e.g. during a lock-delay.
    Refused,
}

/// A named lock in the store.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use certkv::{DistributedLock, LockOptions};
/// use certkv_store::MemoryKv;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let lock = DistributedLock::new(Arc::new(MemoryKv::new()), "site", "caddytls.locks/site", LockOptions::default());
///
/// let handle = lock.acquire(&CancellationToken::new()).await?;
/// assert!(!handle.is_lost());
/// handle.release().await?;
/// # Ok::<(), certkv::CertStorageError>(())
/// # }).unwrap();
/// ```
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    name: String,
    key: String,
    options: LockOptions,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock named `name` (used in errors and logs) stored at the
    /// physical key `key`.
    pub fn new(
        store: Arc<dyn KvStore>,
        name: impl Into<String>,
        key: impl Into<String>,
        options: LockOptions,
    ) -> Self {
        Self { store, name: name.into(), key: key.into(), options }
    }

    /// Returns the physical lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquires the lock, waiting while another session holds it.
    ///
    /// # Errors
    ///
    /// - [`CertStorageError::Cancelled`] if `cancel` fires first
    /// - [`CertStorageError::LockTimeout`] if the configured wait timeout elapses
    /// - [`CertStorageError::Transport`] if the store fails; never reported as contention
    #[tracing::instrument(skip(self, cancel), fields(lock = %self.name))]
    pub async fn acquire(&self, cancel: &CancellationToken) -> CertResult<LockHandle> {
        if cancel.is_cancelled() {
            return Err(CertStorageError::Cancelled { key: self.name.clone() });
        }

        let started = Instant::now();
        let bounds = WaitBounds {
            cancel,
            started,
            deadline: self.options.wait_timeout.map(|timeout| started + timeout),
        };

        let mut session = self.bounded(&bounds, Session::create(&self.store, &self.options)).await?;
        // On failure the session guard destroys the session in the background,
        // so a stalled store cannot hold the caller here.
        self.wait_for(&mut session, &bounds).await?;
        Ok(self.hold(session))
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::LockContention`] if the lock is held or embargoed.
    #[tracing::instrument(skip(self), fields(lock = %self.name))]
    pub async fn try_acquire(&self) -> CertResult<LockHandle> {
        let mut session = Session::create(&self.store, &self.options).await?;
        let attempt = self.attempt(&session).await;
        match attempt {
            Ok(Attempt::Acquired) => Ok(self.hold(session)),
            Ok(Attempt::Held(_) | Attempt::Refused) => {
                session.destroy().await?;
                Err(CertStorageError::LockContention { key: self.name.clone() })
            },
            Err(e) => {
                if let Err(cleanup) = session.destroy().await {
                    warn!(error = %cleanup, "failed to destroy session after failed attempt");
                }
                Err(e)
            },
        }
    }

    async fn wait_for(&self, session: &mut Session, bounds: &WaitBounds<'_>) -> CertResult<()> {
        let poll = self.options.wait_poll.min(self.options.renew_interval());

        loop {
            self.bounded(bounds, self.keep_alive(session)).await?;

            match self.bounded(bounds, self.attempt(session)).await {
                Ok(Attempt::Acquired) => return Ok(()),
                Ok(Attempt::Held(index)) => {
                    debug!(index, "lock held elsewhere, waiting for release");
                    let changed = async { self.store.blocking_get(&self.key, index, poll).await.map_err(CertStorageError::from) };
                    self.bounded(bounds, changed).await?;
                },
                Ok(Attempt::Refused) => {
                    let pause = jittered(self.options.retry_interval).min(poll);
                    debug!(pause_ms = pause.as_millis() as u64, "lock free but refused, retrying");
                    self.bounded(bounds, async {
                        tokio::time::sleep(pause).await;
                        Ok::<_, CertStorageError>(())
                    })
                    .await?;
                },
                Err(CertStorageError::Transport(StoreError::SessionNotFound { .. })) => {
                    debug!("waiting session expired, opening a new one");
                    session.forget();
                    *session = self.bounded(bounds, Session::create(&self.store, &self.options)).await?;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs one store step of a blocking acquire, giving up as soon as the
    /// caller cancels or the wait deadline passes.
    async fn bounded<T>(
        &self,
        bounds: &WaitBounds<'_>,
        step: impl Future<Output = CertResult<T>>,
    ) -> CertResult<T> {
        let expired = async {
            match bounds.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        select! {
            biased;
            () = bounds.cancel.cancelled() => Err(CertStorageError::Cancelled { key: self.name.clone() }),
            () = expired => Err(CertStorageError::LockTimeout {
                key: self.name.clone(),
                waited: bounds.started.elapsed(),
            }),
            result = step => result,
        }
    }

    /// Renews the waiting session once half its TTL has passed, replacing it
    /// if the store already dropped it.
    async fn keep_alive(&self, session: &mut Session) -> CertResult<()> {
        if session.renewed_at.elapsed() < self.options.renew_interval() {
            return Ok(());
        }
        match session.renew().await {
            Ok(()) => Ok(()),
            Err(StoreError::SessionNotFound { .. }) => {
                session.forget();
                *session = Session::create(&self.store, &self.options).await?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn attempt(&self, session: &Session) -> CertResult<Attempt> {
        if let Some(index) = self.held_elsewhere(session).await? {
            return Ok(Attempt::Held(index));
        }

        let acquired = self
            .store
            .cas_put(&self.key, Vec::new(), CasCondition::Acquire(session.id.clone()))
            .await?;
        if acquired {
            return Ok(Attempt::Acquired);
        }

        // Lost a race, or the key is embargoed.
        Ok(match self.held_elsewhere(session).await? {
            Some(index) => Attempt::Held(index),
            None => Attempt::Refused,
        })
    }

    async fn held_elsewhere(&self, session: &Session) -> CertResult<Option<u64>> {
        let entry = self.store.get(&self.key).await?;
        Ok(entry.filter(|e| e.is_held() && !e.is_held_by(&session.id)).map(|e| e.modify_index))
    }

    fn hold(&self, session: Session) -> LockHandle {
        debug!(session = %session.id, "lock acquired");
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = match self.options.renewal {
            LockRenewal::Automatic => Some(RenewalTask::spawn(
                Arc::clone(&self.store),
                session.id.clone(),
                self.options.renew_interval(),
                Arc::clone(&lost),
                self.name.clone(),
            )),
            LockRenewal::Manual => None,
        };

        LockHandle {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            key: self.key.clone(),
            session,
            lost,
            renewal,
            released: false,
        }
    }
}

/// Adds up to 50% random jitter to `base`.
fn jittered(base: Duration) -> Duration {
    let max_jitter = (base.as_millis() as u64) / 2;
    let jitter = rand::rng().random_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}

/// Background session renewal owned by a [`LockHandle`].
struct RenewalTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    fn spawn(
        store: Arc<dyn KvStore>,
        session: SessionId,
        interval: Duration,
        lost: Arc<AtomicBool>,
        name: String,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the session was just created.
            ticker.tick().await;

            loop {
                select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.renew_session(&session).await {
                            Ok(()) => {},
                            Err(StoreError::SessionNotFound { .. }) => {
                                lost.store(true, Ordering::SeqCst);
                                warn!(lock = %name, session = %session, "lock session expired; lock lost");
                                break;
                            },
                            Err(e) => {
                                warn!(lock = %name, error = %e, "lock session renewal failed, will retry");
                            },
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
    }
}

/// Ownership of an acquired [`DistributedLock`].
///
/// Release with [`release`](Self::release). A handle dropped while still
/// held releases the lock in a spawned task.
pub struct LockHandle {
    store: Arc<dyn KvStore>,
    name: String,
    key: String,
    session: Session,
    lost: Arc<AtomicBool>,
    renewal: Option<RenewalTask>,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("session", &self.session.id)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    /// Returns the session holding the lock.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    /// Returns the lock's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once the store reported the lock's session gone.
    ///
    /// A lost lock no longer guarantees exclusion.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Renews the lock's session.
    ///
    /// Required periodically with [`LockRenewal::Manual`]; harmless with
    /// automatic renewal.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::LockLost`] if the session is gone.
    #[tracing::instrument(skip(self), fields(lock = %self.name))]
    pub async fn renew(&self) -> CertResult<()> {
        match self.store.renew_session(&self.session.id).await {
            Ok(()) => Ok(()),
            Err(StoreError::SessionNotFound { .. }) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(CertStorageError::LockLost { key: self.name.clone() })
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock and destroys its session.
    ///
    /// Renewal stops first. The lock key is released, then deleted if still
    /// unheld, and the session destroyed; all three are attempted even if the
    /// lock turns out to have been lost.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::LockLost`] if the session no longer held the key,
    /// or [`CertStorageError::Transport`] if the store failed.
    #[tracing::instrument(skip(self), fields(lock = %self.name))]
    pub async fn release(mut self) -> CertResult<()> {
        self.released = true;
        if let Some(renewal) = self.renewal.take() {
            renewal.stop();
        }

        let released = release_key(self.store.as_ref(), &self.key, &self.session.id).await;
        let destroyed = self.session.destroy().await;

        match released? {
            true => {
                destroyed?;
                debug!("lock released");
                Ok(())
            },
            false => {
                if let Err(e) = destroyed {
                    warn!(error = %e, "failed to destroy session of lost lock");
                }
                Err(CertStorageError::LockLost { key: self.name.clone() })
            },
        }
    }
}

/// Releases `key` from `session` and removes it if nobody re-acquired it.
///
/// Returns `false` if the session did not hold the key.
async fn release_key(store: &dyn KvStore, key: &str, session: &SessionId) -> CertResult<bool> {
    if !store.cas_put(key, Vec::new(), CasCondition::Release(session.clone())).await? {
        return Ok(false);
    }
    if let Some(entry) = store.get(key).await?
        && !entry.is_held()
    {
        // Losing this race means someone acquired the key in between; leave it.
        let _ = store.delete_cas(key, entry.modify_index).await?;
    }
    Ok(true)
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.stop();
        }
        if self.released {
            return;
        }

        // The session guard's own drop would only destroy the session, which
        // leaves the key under lock-delay; release it properly instead.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "lock handle dropped outside a runtime; TTL will reclaim it");
            return;
        };
        self.session.forget();
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let session = self.session.id.clone();
        let name = self.name.clone();
        runtime.spawn(async move {
            if let Err(e) = release_key(store.as_ref(), &key, &session).await {
                warn!(lock = %name, error = %e, "release on drop failed");
            }
            if let Err(e) = store.destroy_session(&session).await {
                warn!(lock = %name, error = %e, "session destroy on drop failed; TTL will reclaim it");
            }
        });
    }
}
