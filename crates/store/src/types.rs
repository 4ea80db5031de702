//! Common types used across store operations.
//!
//! This module defines the entries returned by reads and the session and
//! conditional-write vocabulary shared by every [`KvStore`](crate::KvStore).

use std::{fmt, time::Duration};

use bytes::Bytes;

/// Key-value entry returned from reads.
///
/// Besides the key and value it carries the store's bookkeeping: the index at
/// which the key was created and last modified, how many times it has been
/// acquired, and which session currently holds it.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use certkv_store::KvEntry;
///
/// let entry = KvEntry::new("caddytls/acme/site.crt", Bytes::from("crt"));
/// assert!(entry.session.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// The key identifying this entry.
    pub key: String,

    /// The value stored at this key.
    pub value: Bytes,

    /// Store index at which the key was created.
    pub create_index: u64,

    /// Store index of the last write to the key.
    pub modify_index: u64,

    /// Number of successful acquisitions of the key.
    pub lock_index: u64,

    /// Session currently holding the key, if any.
    pub session: Option<SessionId>,
}

impl KvEntry {
    /// Creates an entry with zeroed indexes and no session.
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
            create_index: 0,
            modify_index: 0,
            lock_index: 0,
            session: None,
        }
    }

    /// Returns `true` if a session currently holds this key.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.session.is_some()
    }

    /// Returns `true` if this key is held by `session`.
    #[must_use]
    pub fn is_held_by(&self, session: &SessionId) -> bool {
        self.session.as_ref() == Some(session)
    }
}

/// Opaque identifier of a store session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a raw session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happens to keys held by a session when the session is invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionBehavior {
    /// The hold is cleared and the key keeps its value.
    #[default]
    Release,
    /// The key is deleted.
    Delete,
}

/// Parameters for [`KvStore::create_session`](crate::KvStore::create_session).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use certkv_store::{SessionBehavior, SessionOptions};
///
/// let opts = SessionOptions::new(Duration::from_secs(15))
///     .with_name("certkv-lock")
///     .with_lock_delay(Duration::from_secs(1))
///     .with_behavior(SessionBehavior::Release);
/// assert_eq!(opts.ttl, Duration::from_secs(15));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Human-readable session name.
    pub name: String,
    /// Time-to-live; the session is invalidated unless renewed within it.
    pub ttl: Duration,
    /// Effect of invalidation on held keys.
    pub behavior: SessionBehavior,
    /// Embargo applied to released keys after invalidation, during which no
    /// session may acquire them.
    pub lock_delay: Duration,
}

impl SessionOptions {
    /// Default lock-delay applied after a session is invalidated.
    pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

    /// Creates options with the given TTL, release behavior and the default
    /// lock-delay.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            name: String::new(),
            ttl,
            behavior: SessionBehavior::Release,
            lock_delay: Self::DEFAULT_LOCK_DELAY,
        }
    }

    /// Sets the session name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the invalidation behavior.
    #[must_use]
    pub fn with_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Sets the lock-delay.
    #[must_use]
    pub fn with_lock_delay(mut self, lock_delay: Duration) -> Self {
        self.lock_delay = lock_delay;
        self
    }
}

/// Snapshot of a live session returned by
/// [`KvStore::session_info`](crate::KvStore::session_info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Session name as given at creation.
    pub name: String,
    /// Configured time-to-live.
    pub ttl: Duration,
    /// Invalidation behavior.
    pub behavior: SessionBehavior,
    /// Lock-delay applied on invalidation.
    pub lock_delay: Duration,
    /// Store index at which the session was created.
    pub create_index: u64,
}

/// Precondition for [`KvStore::cas_put`](crate::KvStore::cas_put).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasCondition {
    /// Write only if the key does not exist.
    Absent,
    /// Write only if the key's modify index equals the given value. `0`
    /// means the key must be absent.
    ModifyIndex(u64),
    /// Bind the key to the session and write, only if no other session holds
    /// it and it is not under a lock-delay embargo. Re-acquiring by the
    /// holding session succeeds.
    Acquire(SessionId),
    /// Clear the session binding and write, only if the key is held by the
    /// session.
    Release(SessionId),
}
