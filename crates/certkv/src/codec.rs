//! Record encoding and authenticated encryption.
//!
//! Every value certkv writes to the store is an encoded [`StorageData`]
//! record:
//!
//! ```text
//! cleartext:  value_prefix ‖ JSON(StorageData)
//! encrypted:  nonce(12) ‖ AES-256-GCM(value_prefix ‖ JSON(StorageData)) ‖ tag(16)
//! ```
//!
//! The prefix is a format marker checked on decode so that foreign or
//! corrupted values are rejected instead of misread. It is not a security
//! boundary; integrity comes from the GCM tag.
//!
//! Without a configured key records are written in cleartext. That is an
//! explicit choice made by leaving `aes_key` unset, never a fallback taken
//! when encryption fails.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    config::{DEFAULT_VALUE_PREFIX, EncryptionKey},
    error::{CertResult, CertStorageError},
};

/// Length of the GCM nonce prepended to every encrypted record.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to every encrypted record.
pub const TAG_LEN: usize = 16;

/// The logical record stored under each key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageData {
    /// Opaque payload: a certificate, a private key, or JSON metadata.
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,

    /// Time of the write that produced this record.
    pub modified: DateTime<Utc>,
}

impl StorageData {
    /// Wraps a payload, stamped with the current time.
    #[must_use]
    pub fn new(value: Vec<u8>) -> Self {
        Self { value, modified: Utc::now() }
    }
}

/// Serializes `Vec<u8>` as standard base64 text.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

/// Encodes and decodes [`StorageData`] records.
///
/// # Example
///
/// ```
/// use certkv::{Codec, StorageData};
///
/// let codec = Codec::new("caddy-storage-consul", None);
/// let record = StorageData::new(b"-----BEGIN CERTIFICATE-----".to_vec());
///
/// let bytes = codec.encode(&record)?;
/// assert!(bytes.starts_with(b"caddy-storage-consul"));
/// assert_eq!(codec.decode(&bytes)?, record);
/// # Ok::<(), certkv::CertStorageError>(())
/// ```
#[derive(Clone)]
pub struct Codec {
    value_prefix: Vec<u8>,
    cipher: Option<Aes256Gcm>,
}

impl Codec {
    /// Creates a codec with the given format marker and optional key.
    #[must_use]
    pub fn new(value_prefix: impl Into<String>, key: Option<&EncryptionKey>) -> Self {
        Self {
            value_prefix: value_prefix.into().into_bytes(),
            cipher: key.map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k.as_bytes()))),
        }
    }

    /// Returns `true` if records are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serializes, prefixes and (if keyed) encrypts a record.
    ///
    /// Each call draws a fresh random nonce, so encoding the same record
    /// twice yields different bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CertStorageError::Encode`] if the record cannot be
    /// serialized, or [`CertStorageError::Encryption`] if the cipher fails.
    pub fn encode(&self, data: &StorageData) -> CertResult<Vec<u8>> {
        let json = to_json(data)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(self.value_prefix.len() + json.len()));
        plaintext.extend_from_slice(&self.value_prefix);
        plaintext.extend_from_slice(&json);

        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher.encrypt(&nonce, plaintext.as_slice()).map_err(|_| {
            CertStorageError::Encryption { message: "AES-GCM seal failed".into() }
        })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Authenticates (if keyed), checks the prefix of, and deserializes a
    /// record.
    ///
    /// # Errors
    ///
    /// - [`CertStorageError::Authentication`] if the input is shorter than nonce + tag, or the
    ///   tag does not verify (tampering or a different key)
    /// - [`CertStorageError::Format`] if the prefix does not match
    /// - [`CertStorageError::Decode`] if the body is not a valid record
    pub fn decode(&self, bytes: &[u8]) -> CertResult<StorageData> {
        let plaintext = match &self.cipher {
            Some(cipher) => Zeroizing::new(open(cipher, bytes)?),
            None => Zeroizing::new(bytes.to_vec()),
        };

        let body = plaintext.strip_prefix(self.value_prefix.as_slice()).ok_or_else(|| {
            CertStorageError::Format { message: "record does not start with the expected prefix".into() }
        })?;

        serde_json::from_slice(body).map_err(|source| CertStorageError::Decode {
            message: "malformed record body".into(),
            source,
        })
    }
}

fn to_json<T: Serialize>(record: &T) -> CertResult<Zeroizing<Vec<u8>>> {
    serde_json::to_vec(record)
        .map(Zeroizing::new)
        .map_err(|source| CertStorageError::Encode { message: "record is not serializable".into(), source })
}

fn open(cipher: &Aes256Gcm, bytes: &[u8]) -> CertResult<Vec<u8>> {
    if bytes.len() < NONCE_LEN + TAG_LEN {
        return Err(CertStorageError::Authentication {
            message: format!(
                "encrypted record is {} bytes, shorter than nonce and tag ({} bytes)",
                bytes.len(),
                NONCE_LEN + TAG_LEN
            ),
        });
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| {
        CertStorageError::Authentication { message: "record failed integrity check".into() }
    })
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_VALUE_PREFIX, None)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("value_prefix", &String::from_utf8_lossy(&self.value_prefix))
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
