//! Configuration for certificate storage.
//!
//! [`CertStorageConfig`] is the single explicit configuration value passed
//! to [`CertStorage::new`](crate::CertStorage::new). It is built either in
//! code with [`CertStorageConfig::builder`] or deserialized from a config
//! file; both paths apply the same validation.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use certkv::CertStorageConfig;
//!
//! let config = CertStorageConfig::builder()
//!     .prefix("caddytls")
//!     .aes_key(vec![7u8; 32])
//!     .lock_ttl(Duration::from_secs(30))
//!     .build()?;
//! assert!(config.encryption_key().is_some());
//! # Ok::<(), certkv::ConfigError>(())
//! ```
//!
//! From a file (durations in `humantime` syntax, key as base64):
//!
//! ```
//! use certkv::CertStorageConfig;
//!
//! let config: CertStorageConfig = serde_json::from_str(r#"{
//!     "prefix": "caddytls",
//!     "lock_ttl": "30s",
//!     "lock_wait_timeout": "2m",
//!     "endpoint": { "address": "consul.service:8500", "tls": true }
//! }"#)?;
//! assert_eq!(config.lock_ttl().as_secs(), 30);
//! # Ok::<(), serde_json::Error>(())
//! ```

use std::{fmt, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::error::ConfigError;

/// Default key namespace prefix.
pub const DEFAULT_PREFIX: &str = "caddytls";

/// Default format marker prepended to every encoded record.
pub const DEFAULT_VALUE_PREFIX: &str = "caddy-storage-consul";

/// Default lock session TTL (15 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Default lock-delay after a lock session is invalidated (15 seconds).
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

/// Default pause before retrying an acquire refused by lock-delay (500 ms).
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound of a single long-poll wait on a held lock (5 seconds).
pub const DEFAULT_LOCK_WAIT_POLL: Duration = Duration::from_secs(5);

/// Minimum lock session TTL.
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

/// Length of an AES-256 key in bytes.
pub const AES_KEY_LEN: usize = 32;

/// Symmetric key used to encrypt stored records.
///
/// The key bytes are zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Zeroizing<[u8; AES_KEY_LEN]>);

impl EncryptionKey {
    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKeyLength`] unless `bytes` is exactly
    /// 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let key: [u8; AES_KEY_LEN] =
            bytes.try_into().map_err(|_| ConfigError::InvalidKeyLength { actual: bytes.len() })?;
        Ok(Self(Zeroizing::new(key)))
    }

    /// Decodes a key from standard base64.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEncoding`] for invalid base64 and
    /// [`ConfigError::InvalidKeyLength`] for a key of the wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| ConfigError::InvalidEncoding { field: "aes_key", encoding: "base64" })?,
        );
        Self::from_bytes(&bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0.as_slice()))
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// How a held lock's session is kept alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockRenewal {
    /// A background task renews the session every half TTL.
    #[default]
    Automatic,
    /// The caller renews through [`LockHandle::renew`](crate::LockHandle::renew).
    Manual,
}

/// Connection settings for the key-value store client.
///
/// These are not interpreted by certkv; they are handed to whatever
/// [`KvStore`](certkv_store::KvStore) implementation the host constructs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Store address, `host:port`.
    #[serde(default = "default_address")]
    #[builder(into, default = default_address())]
    pub address: String,

    /// ACL token, if the store requires one.
    #[serde(default)]
    #[builder(into)]
    pub token: Option<String>,

    /// Whether to connect over TLS.
    #[serde(default)]
    #[builder(default)]
    pub tls: bool,

    /// Per-request timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_address() -> String {
    "127.0.0.1:8500".to_owned()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { address: default_address(), token: None, tls: false, timeout: None }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Configuration for [`CertStorage`](crate::CertStorage).
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `prefix` | `caddytls` |
/// | `value_prefix` | `caddy-storage-consul` |
/// | `aes_key` | none (records stored in cleartext) |
/// | `lock_ttl` | 15 s |
/// | `lock_delay` | 15 s |
/// | `lock_wait_timeout` | none (wait indefinitely) |
/// | `lock_retry_interval` | 500 ms |
/// | `lock_wait_poll` | 5 s |
/// | `lock_renewal` | `automatic` |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConfigFile")]
pub struct CertStorageConfig {
    pub(crate) prefix: String,
    pub(crate) value_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) aes_key: Option<EncryptionKey>,
    #[serde(with = "humantime_serde")]
    pub(crate) lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) lock_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) lock_wait_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub(crate) lock_retry_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub(crate) lock_wait_poll: Duration,
    pub(crate) lock_renewal: LockRenewal,
    pub(crate) endpoint: EndpointConfig,
}

#[bon::bon]
impl CertStorageConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `prefix` or `value_prefix` is empty (after trimming slashes from the prefix)
    /// - `aes_key` is not exactly 32 bytes
    /// - `lock_ttl` is shorter than one second
    /// - `lock_wait_poll` is zero
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_PREFIX.to_owned())] prefix: String,
        #[builder(into, default = DEFAULT_VALUE_PREFIX.to_owned())] value_prefix: String,
        aes_key: Option<Vec<u8>>,
        #[builder(default = DEFAULT_LOCK_TTL)] lock_ttl: Duration,
        #[builder(default = DEFAULT_LOCK_DELAY)] lock_delay: Duration,
        lock_wait_timeout: Option<Duration>,
        #[builder(default = DEFAULT_LOCK_RETRY_INTERVAL)] lock_retry_interval: Duration,
        #[builder(default = DEFAULT_LOCK_WAIT_POLL)] lock_wait_poll: Duration,
        #[builder(default)] lock_renewal: LockRenewal,
        #[builder(default)] endpoint: EndpointConfig,
    ) -> Result<Self, ConfigError> {
        let aes_key = aes_key.map(Zeroizing::new).map(|k| EncryptionKey::from_bytes(&k)).transpose()?;
        Self::validated(ConfigFile {
            prefix,
            value_prefix,
            aes_key,
            lock_ttl,
            lock_delay,
            lock_wait_timeout,
            lock_retry_interval,
            lock_wait_poll,
            lock_renewal,
            endpoint,
        })
    }

    fn validated(file: ConfigFile) -> Result<Self, ConfigError> {
        let prefix = file.prefix.trim_matches('/').to_owned();
        if prefix.is_empty() {
            return Err(ConfigError::Empty { field: "prefix" });
        }
        if file.value_prefix.is_empty() {
            return Err(ConfigError::Empty { field: "value_prefix" });
        }
        if file.lock_ttl < MIN_LOCK_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "lock_ttl",
                min: format!("{MIN_LOCK_TTL:?}"),
                value: format!("{:?}", file.lock_ttl),
            });
        }
        if file.lock_wait_poll.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "lock_wait_poll",
                min: "1ms".into(),
                value: "0ns".into(),
            });
        }

        Ok(Self {
            prefix,
            value_prefix: file.value_prefix,
            aes_key: file.aes_key,
            lock_ttl: file.lock_ttl,
            lock_delay: file.lock_delay,
            lock_wait_timeout: file.lock_wait_timeout,
            lock_retry_interval: file.lock_retry_interval,
            lock_wait_poll: file.lock_wait_poll,
            lock_renewal: file.lock_renewal,
            endpoint: file.endpoint,
        })
    }

    /// Returns the key namespace prefix, without surrounding slashes.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the record format marker.
    #[must_use]
    pub fn value_prefix(&self) -> &str {
        &self.value_prefix
    }

    /// Returns the encryption key, if records are encrypted.
    #[must_use]
    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.aes_key.as_ref()
    }

    /// Returns the lock session TTL.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Returns the lock-delay applied when a lock session is invalidated.
    #[must_use]
    pub fn lock_delay(&self) -> Duration {
        self.lock_delay
    }

    /// Returns how long a blocking acquire may wait, or `None` for no limit.
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout
    }

    /// Returns the pause before retrying an acquire refused by lock-delay.
    #[must_use]
    pub fn lock_retry_interval(&self) -> Duration {
        self.lock_retry_interval
    }

    /// Returns the upper bound of a single long-poll wait.
    #[must_use]
    pub fn lock_wait_poll(&self) -> Duration {
        self.lock_wait_poll
    }

    /// Returns the lock renewal mode.
    #[must_use]
    pub fn lock_renewal(&self) -> LockRenewal {
        self.lock_renewal
    }

    /// Returns the store connection settings.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }
}

impl Default for CertStorageConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            value_prefix: DEFAULT_VALUE_PREFIX.to_owned(),
            aes_key: None,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            lock_wait_timeout: None,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            lock_wait_poll: DEFAULT_LOCK_WAIT_POLL,
            lock_renewal: LockRenewal::Automatic,
            endpoint: EndpointConfig::default(),
        }
    }
}

/// On-disk shape of [`CertStorageConfig`], validated on conversion.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(default = "default_value_prefix")]
    value_prefix: String,
    #[serde(default)]
    aes_key: Option<EncryptionKey>,
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    lock_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_lock_delay")]
    lock_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    lock_wait_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default = "default_lock_retry_interval")]
    lock_retry_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_lock_wait_poll")]
    lock_wait_poll: Duration,
    #[serde(default)]
    lock_renewal: LockRenewal,
    #[serde(default)]
    endpoint: EndpointConfig,
}

impl TryFrom<ConfigFile> for CertStorageConfig {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        Self::validated(file)
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_owned()
}

fn default_value_prefix() -> String {
    DEFAULT_VALUE_PREFIX.to_owned()
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_lock_delay() -> Duration {
    DEFAULT_LOCK_DELAY
}

fn default_lock_retry_interval() -> Duration {
    DEFAULT_LOCK_RETRY_INTERVAL
}

fn default_lock_wait_poll() -> Duration {
    DEFAULT_LOCK_WAIT_POLL
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CertStorageConfig::builder().build().unwrap();

        assert_eq!(config, CertStorageConfig::default());
        assert_eq!(config.prefix(), "caddytls");
        assert_eq!(config.value_prefix(), "caddy-storage-consul");
        assert!(config.encryption_key().is_none());
        assert_eq!(config.lock_ttl(), Duration::from_secs(15));
        assert_eq!(config.lock_wait_timeout(), None);
        assert_eq!(config.lock_renewal(), LockRenewal::Automatic);
    }

    #[test]
    fn test_prefix_slashes_trimmed() {
        let config = CertStorageConfig::builder().prefix("/tenants/a/").build().unwrap();
        assert_eq!(config.prefix(), "tenants/a");
    }

    #[rstest]
    #[case::empty_prefix("", "tag", 32, Duration::from_secs(15), "prefix")]
    #[case::slash_only_prefix("/", "tag", 32, Duration::from_secs(15), "prefix")]
    #[case::empty_value_prefix("p", "", 32, Duration::from_secs(15), "value_prefix")]
    #[case::short_key("p", "tag", 16, Duration::from_secs(15), "32 bytes")]
    #[case::long_key("p", "tag", 33, Duration::from_secs(15), "32 bytes")]
    #[case::sub_second_ttl("p", "tag", 32, Duration::from_millis(500), "lock_ttl")]
    fn test_validation_rejects(
        #[case] prefix: &str,
        #[case] value_prefix: &str,
        #[case] key_len: usize,
        #[case] ttl: Duration,
        #[case] mentions: &str,
    ) {
        let err = CertStorageConfig::builder()
            .prefix(prefix)
            .value_prefix(value_prefix)
            .aes_key(vec![1u8; key_len])
            .lock_ttl(ttl)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains(mentions), "error should mention {mentions}: {err}");
    }

    #[test]
    fn test_deserialize_full() {
        let key = STANDARD.encode([9u8; 32]);
        let json = format!(
            r#"{{
                "prefix": "certs",
                "value_prefix": "v1",
                "aes_key": "{key}",
                "lock_ttl": "20s",
                "lock_delay": "1s",
                "lock_wait_timeout": "1m",
                "lock_retry_interval": "250ms",
                "lock_wait_poll": "2s",
                "lock_renewal": "manual",
                "endpoint": {{ "address": "consul:8501", "token": "secret", "tls": true, "timeout": "10s" }}
            }}"#
        );

        let config: CertStorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.prefix(), "certs");
        assert_eq!(config.encryption_key().unwrap().as_bytes(), &[9u8; 32]);
        assert_eq!(config.lock_ttl(), Duration::from_secs(20));
        assert_eq!(config.lock_wait_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.lock_retry_interval(), Duration::from_millis(250));
        assert_eq!(config.lock_renewal(), LockRenewal::Manual);
        assert_eq!(config.endpoint().address, "consul:8501");
        assert_eq!(config.endpoint().timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: CertStorageConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CertStorageConfig::default());
    }

    #[test]
    fn test_deserialize_validates() {
        let result = serde_json::from_str::<CertStorageConfig>(r#"{ "lock_ttl": "10ms" }"#);
        assert!(result.unwrap_err().to_string().contains("lock_ttl"));

        let result = serde_json::from_str::<CertStorageConfig>(r#"{ "aes_key": "not base64!" }"#);
        assert!(result.unwrap_err().to_string().contains("base64"));
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<CertStorageConfig>(r#"{ "prefx": "typo" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_round_trips_through_validation() {
        let config = CertStorageConfig::builder()
            .aes_key(vec![3u8; 32])
            .lock_wait_timeout(Duration::from_secs(90))
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let back: CertStorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let config = CertStorageConfig::builder()
            .aes_key(vec![0xAB; 32])
            .endpoint(EndpointConfig::builder().token("hunter2").build())
            .build()
            .unwrap();

        let debug = format!("{config:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("171"), "key bytes must not be printed: {debug}");
    }
}
