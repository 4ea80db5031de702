//! Encrypted certificate storage and distributed locking over a
//! session-capable key-value store.
//!
//! This crate stores TLS certificate material (certificates, keys, ACME
//! account data) under slash-delimited logical keys in any [`KvStore`], and
//! coordinates issuance across instances with store-backed locks:
//!
//! - [`Codec`] wraps each value in a timestamped [`StorageData`] record and, when an AES key is
//!   configured, seals it with AES-256-GCM.
//! - [`KeySpace`] maps logical keys into a namespace prefix and synthesizes directory listings from
//!   the flat key set.
//! - [`CertStorage`] is the storage façade: store, load, delete, exists, stat, list, lock and
//!   unlock.
//! - [`DistributedLock`] binds a lock key to a store session with a TTL, so a crashed holder's lock
//!   frees itself after the TTL plus the session's lock-delay.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use certkv::{CertStorage, CertStorageConfig};
//! use certkv_store::MemoryKv;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let storage = CertStorage::new(Arc::new(MemoryKv::new()), CertStorageConfig::default());
//!
//! storage.lock("acme/example.com/sites/example.com").await?;
//! storage.store("acme/example.com/sites/example.com/example.com.key", b"key").await?;
//! storage.unlock("acme/example.com/sites/example.com").await?;
//!
//! let info = storage.stat("acme/example.com/sites/example.com/example.com.key").await?;
//! assert!(info.is_terminal);
//! assert_eq!(info.size, 3);
//! # Ok::<(), certkv::CertStorageError>(())
//! # }).unwrap();
//! ```
//!
//! [`KvStore`]: certkv_store::KvStore

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod storage;

pub use codec::{Codec, StorageData};
pub use config::{CertStorageConfig, EncryptionKey, EndpointConfig, LockRenewal};
pub use error::{CertResult, CertStorageError, ConfigError};
pub use keys::KeySpace;
pub use lock::{DistributedLock, LockHandle, LockOptions};
pub use storage::{CertStorage, KeyInfo};
