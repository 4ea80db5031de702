//! Session-capable key-value store abstraction for certkv.
//!
//! This crate provides the [`KvStore`] trait: the primitives certkv's
//! certificate storage needs from a distributed key-value store such as
//! Consul. Keys are slash-delimited strings, values are opaque bytes, and
//! sessions with a TTL give liveness to the locks built on top.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       certkv                                │
//! │   CertStorage (codec, key space, façade) │ DistributedLock  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    certkv-store                             │
//! │                    KvStore trait                            │
//! │  (get, put, cas_put, list_keys, sessions, blocking_get)     │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │   MemoryKv   │          Consul client adapter               │
//! │ (tests, dev) │              (production)                    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use certkv_store::{CasCondition, KvStore, MemoryKv, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryKv::new();
//!
//!     store.put("caddytls/greeting", b"hello".to_vec()).await?;
//!
//!     let session = store.create_session(SessionOptions::new(Duration::from_secs(15))).await?;
//!     let acquired = store
//!         .cas_put("caddytls/site.lock", Vec::new(), CasCondition::Acquire(session.clone()))
//!         .await?;
//!     assert!(acquired);
//!
//!     store.destroy_session(&session).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Store
//!
//! 1. Implement the [`KvStore`] trait
//! 2. Map store-specific errors to [`StoreError`]
//! 3. Run the [`conformance`] suite against it
//!
//! See the [`memory`] module source for a reference implementation.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` and `conformance` modules with shared test helpers,
//!   an always-unreachable store and assertion macros.
//! - **`failpoints`**: Enables fail-point injection in [`MemoryKv`].

#![deny(unsafe_code)]

pub mod backend;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
pub mod size_limits;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

pub use backend::KvStore;
pub use error::{BoxError, StoreError, StoreResult};
pub use memory::{DEFAULT_SWEEP_INTERVAL, MemoryKv};
pub use size_limits::{
    DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE, SizeLimits, validate_key_size, validate_sizes,
};
pub use types::{CasCondition, KvEntry, SessionBehavior, SessionId, SessionInfo, SessionOptions};
