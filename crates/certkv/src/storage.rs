//! Certificate storage over a [`KvStore`].

use std::{collections::HashMap, sync::Arc};

use certkv_store::KvStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{Codec, StorageData},
    config::CertStorageConfig,
    error::{CertResult, CertStorageError},
    keys::{KeySpace, immediate_children, normalize},
    lock::{DistributedLock, LockHandle, LockOptions},
};

/// Metadata about a stored key, as returned by [`CertStorage::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// The key as requested.
    pub key: String,
    /// When the value was last stored. The Unix epoch for directory-like keys.
    pub modified: DateTime<Utc>,
    /// Size of the stored value in bytes, before encoding.
    pub size: u64,
    /// `false` if the key only exists as a prefix of other keys.
    pub is_terminal: bool,
}

/// Encrypted certificate storage with distributed locking.
///
/// Values are wrapped in a timestamped record, optionally sealed with
/// AES-256-GCM, and written under the configured namespace prefix. Locks
/// are store sessions bound to keys in a separate lock namespace.
///
/// Every [`lock`](Self::lock) call takes its own store session, so callers
/// sharing one instance exclude each other exactly as separate instances do.
/// [`unlock`](Self::unlock) releases the lock held through this instance.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use certkv::{CertStorage, CertStorageConfig};
/// use certkv_store::MemoryKv;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let config = CertStorageConfig::builder().aes_key(vec![7u8; 32]).build()?;
/// let storage = CertStorage::new(Arc::new(MemoryKv::new()), config);
///
/// storage.store("acme/example.com/sites/example.com/example.com.crt", b"crt").await?;
/// assert_eq!(storage.load("acme/example.com/sites/example.com/example.com.crt").await?, b"crt");
/// assert_eq!(storage.list("acme", false).await?, vec!["acme/example.com"]);
/// # Ok::<(), certkv::CertStorageError>(())
/// # }).unwrap();
/// ```
pub struct CertStorage {
    store: Arc<dyn KvStore>,
    codec: Codec,
    keys: KeySpace,
    lock_options: LockOptions,
    locks: Mutex<HashMap<String, LockHandle>>,
}

impl std::fmt::Debug for CertStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStorage")
            .field("prefix", &self.keys.prefix())
            .field("codec", &self.codec)
            .field("lock_options", &self.lock_options)
            .field("held_locks", &self.locks.lock().len())
            .finish_non_exhaustive()
    }
}

impl CertStorage {
    /// Creates storage over `store` with a validated configuration.
    pub fn new(store: Arc<dyn KvStore>, config: CertStorageConfig) -> Self {
        Self {
            codec: Codec::new(config.value_prefix(), config.encryption_key()),
            keys: KeySpace::new(config.prefix()),
            lock_options: LockOptions::from_config(&config),
            locks: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Returns the key space records are written to.
    #[must_use]
    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    /// Writes `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails or the store rejects the write.
    #[tracing::instrument(skip(self, value), fields(size = value.len()))]
    pub async fn store(&self, key: &str, value: &[u8]) -> CertResult<()> {
        let record = StorageData::new(value.to_vec());
        let bytes = self.codec.encode(&record)?;
        self.store.put(&self.keys.to_physical(key), bytes).await?;
        Ok(())
    }

    /// Reads the value stored at `key`.
    ///
    /// # Errors
    ///
    /// - [`CertStorageError::NotExist`] if nothing is stored at `key`
    /// - [`CertStorageError::Authentication`], [`CertStorageError::Format`] or
    ///   [`CertStorageError::Decode`] if the record cannot be read
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, key: &str) -> CertResult<Vec<u8>> {
        Ok(self.read(key).await?.value)
    }

    /// Removes `key`.
    ///
    /// The delete is conditional on the entry read just before it, so a
    /// concurrent write is not silently discarded.
    ///
    /// # Errors
    ///
    /// - [`CertStorageError::NotExist`] if nothing is stored at `key`
    /// - [`CertStorageError::Conflict`] if the key changed in between
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> CertResult<()> {
        let physical = self.keys.to_physical(key);
        let entry = self.store.get(&physical).await?.ok_or_else(|| CertStorageError::not_exist(key))?;

        if !self.store.delete_cas(&physical, entry.modify_index).await? {
            return Err(CertStorageError::Conflict { key: key.to_owned() });
        }
        Ok(())
    }

    /// Returns `true` if a value is stored at `key`.
    ///
    /// Store failures are logged and reported as absence; use
    /// [`try_exists`](Self::try_exists) to see them.
    #[tracing::instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> bool {
        match self.try_exists(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "existence check failed, reporting absent");
                false
            },
        }
    }

    /// Returns whether a value is stored at `key`, propagating store failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn try_exists(&self, key: &str) -> CertResult<bool> {
        Ok(self.store.get(&self.keys.to_physical(key)).await?.is_some())
    }

    /// Describes `key`.
    ///
    /// A key with no value of its own but with keys below it is reported as a
    /// directory: not terminal, zero size, modified at the Unix epoch.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::NotExist`] if neither a value nor any key below it
    /// exists.
    #[tracing::instrument(skip(self))]
    pub async fn stat(&self, key: &str) -> CertResult<KeyInfo> {
        let physical = self.keys.to_physical(key);
        if let Some(entry) = self.store.get(&physical).await? {
            let record = self.codec.decode(&entry.value)?;
            return Ok(KeyInfo {
                key: key.to_owned(),
                modified: record.modified,
                size: record.value.len() as u64,
                is_terminal: true,
            });
        }

        if self.descendants(key).await?.is_empty() {
            return Err(CertStorageError::not_exist(key));
        }
        Ok(KeyInfo { key: key.to_owned(), modified: DateTime::UNIX_EPOCH, size: 0, is_terminal: false })
    }

    /// Lists keys below `prefix`.
    ///
    /// Recursive listings return every stored key below `prefix`. Otherwise
    /// only the distinct immediate children of `prefix` are returned, with
    /// intermediate path segments reported as if they were directories.
    /// Results are sorted. Lock keys are never listed.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::NotExist`] if no key lies below `prefix`.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self, prefix: &str, recursive: bool) -> CertResult<Vec<String>> {
        let below = self.descendants(prefix).await?;
        if below.is_empty() {
            return Err(CertStorageError::not_exist(prefix));
        }

        if recursive {
            Ok(below)
        } else {
            Ok(immediate_children(prefix, below.iter().map(String::as_str)))
        }
    }

    /// Logical keys strictly below `prefix`, sorted.
    async fn descendants(&self, prefix: &str) -> CertResult<Vec<String>> {
        let prefix = normalize(prefix);
        let physical = self.store.list_keys(&self.keys.to_physical(prefix)).await?;
        let mut below: Vec<String> = self
            .keys
            .logical_keys_within(prefix, &physical)
            .filter(|key| *key != prefix)
            .map(str::to_owned)
            .collect();
        below.sort_unstable();
        below.dedup();
        Ok(below)
    }

    async fn read(&self, key: &str) -> CertResult<StorageData> {
        let entry = self
            .store
            .get(&self.keys.to_physical(key))
            .await?
            .ok_or_else(|| CertStorageError::not_exist(key))?;
        self.codec.decode(&entry.value)
    }

    /// Acquires the lock for `key`, waiting as long as the configuration
    /// allows.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::LockTimeout`] if a wait timeout is configured and
    /// elapses, or [`CertStorageError::Transport`] if the store fails.
    pub async fn lock(&self, key: &str) -> CertResult<()> {
        self.lock_with_cancellation(key, &CancellationToken::new()).await
    }

    /// Acquires the lock for `key`, giving up when `cancel` fires.
    ///
    /// Waits while any caller holds the lock, including another caller on
    /// this instance.
    ///
    /// # Errors
    ///
    /// As [`lock`](Self::lock), plus [`CertStorageError::Cancelled`].
    #[tracing::instrument(skip(self, cancel))]
    pub async fn lock_with_cancellation(&self, key: &str, cancel: &CancellationToken) -> CertResult<()> {
        let name = normalize(key);
        self.discard_lost(name).await;

        let handle = self.lock_for(name).acquire(cancel).await?;
        self.track(name, handle);
        Ok(())
    }

    /// Acquires the lock for `key` only if it is free right now.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::LockContention`] if any caller holds it, including
    /// another caller on this instance.
    #[tracing::instrument(skip(self))]
    pub async fn try_lock(&self, key: &str) -> CertResult<()> {
        let name = normalize(key);
        self.discard_lost(name).await;

        let handle = self.lock_for(name).try_acquire().await?;
        self.track(name, handle);
        Ok(())
    }

    /// Releases the lock for `key` taken through this instance.
    ///
    /// # Errors
    ///
    /// - [`CertStorageError::LockNotHeld`] if this instance does not hold it
    /// - [`CertStorageError::LockLost`] if its session expired while held
    #[tracing::instrument(skip(self))]
    pub async fn unlock(&self, key: &str) -> CertResult<()> {
        let name = normalize(key);
        let handle = self
            .locks
            .lock()
            .remove(name)
            .ok_or_else(|| CertStorageError::LockNotHeld { key: name.to_owned() })?;
        handle.release().await
    }

    /// Returns `true` if this instance holds a live lock for `key`.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.lock().get(normalize(key)).is_some_and(|h| !h.is_lost())
    }

    /// Drops a tracked handle for `name` whose session is gone. A live handle
    /// is left alone; the caller then waits on it in the store.
    async fn discard_lost(&self, name: &str) {
        let stale = {
            let mut locks = self.locks.lock();
            if locks.get(name).is_some_and(LockHandle::is_lost) { locks.remove(name) } else { None }
        };

        if let Some(stale) = stale {
            debug!(lock = name, "discarding lost lock before re-acquiring");
            if let Err(e) = stale.release().await {
                debug!(lock = name, error = %e, "cleanup of lost lock reported an error");
            }
        }
    }

    fn track(&self, name: &str, handle: LockHandle) {
        let displaced = self.locks.lock().insert(name.to_owned(), handle);
        if let Some(displaced) = displaced {
            // Only a lost handle can still be tracked once the key is acquired
            // again; dropping it cleans up its session.
            debug!(lock = name, session = %displaced.session_id(), "replaced lost lock handle");
        }
    }

    fn lock_for(&self, name: &str) -> DistributedLock {
        DistributedLock::new(Arc::clone(&self.store), name, self.keys.lock_key(name), self.lock_options.clone())
    }

    /// Checks that the store is reachable.
    ///
    /// # Errors
    ///
    /// [`CertStorageError::Transport`] if it is not.
    #[tracing::instrument(skip(self))]
    pub async fn health_check(&self) -> CertResult<()> {
        self.store.health_check().await?;
        Ok(())
    }
}
