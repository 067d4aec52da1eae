//! Field-level authenticated encryption.
//!
//! Payload layout is `nonce (12 bytes) || ciphertext || tag (16 bytes)`. Every
//! call to [`FieldCipher::encrypt`] draws a fresh nonce, so identical plaintexts
//! never produce identical payloads.

use std::fmt;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::{AuthError, LOG_TARGET, SecretBytes, SecretString};

/// Key size for AES-256-GCM.
pub const KEY_LEN: usize = 32;

/// Nonce size for AES-GCM.
pub const NONCE_LEN: usize = 12;

const TAG_LEN: usize = 16;

/// A 256-bit symmetric key, wiped on drop.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Result<Self, AuthError> {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng
            .try_fill_bytes(bytes.as_mut_slice())
            .map_err(|e| AuthError::Internal(format!("random source unavailable: {e}")))?;
        Ok(Self(bytes))
    }

    /// Parses a standard base64 encoding of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|_| {
            AuthError::ConfigurationError("encryption key is not valid base64".to_owned())
        })?);

        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            AuthError::ConfigurationError(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;

        Ok(Self::from_bytes(bytes))
    }

    /// Standard base64 encoding, for provisioning a new key into a secret store.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_slice())
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Where the per-process key comes from.
///
/// Platform secret stores usually surface secrets as environment variables
/// or mounted files; both are provided.
pub trait KeySource: Send + Sync {
    fn load_key(&self) -> Result<EncryptionKey, AuthError>;
}

/// Reads a base64 key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvKeySource {
    var: String,
}

impl EnvKeySource {
    pub const DEFAULT_VAR: &'static str = "CUSTODIA_ENCRYPTION_KEY";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvKeySource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl KeySource for EnvKeySource {
    fn load_key(&self) -> Result<EncryptionKey, AuthError> {
        let value = Zeroizing::new(std::env::var(&self.var).map_err(|_| {
            AuthError::ConfigurationError(format!("{} is not set", self.var))
        })?);
        EncryptionKey::from_base64(&value)
    }
}

/// Reads a base64 key from a file such as `/run/secrets/custodia_key`.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeySource for FileKeySource {
    fn load_key(&self) -> Result<EncryptionKey, AuthError> {
        let content = Zeroizing::new(std::fs::read_to_string(&self.path).map_err(|e| {
            AuthError::ConfigurationError(format!(
                "failed to read key file {}: {e}",
                self.path.display()
            ))
        })?);
        EncryptionKey::from_base64(&content)
    }
}

/// AES-256-GCM encryption of opaque column payloads.
///
/// # Example
///
/// ```rust
/// use custodia::cipher::{EncryptionKey, FieldCipher};
///
/// let cipher = FieldCipher::new(&EncryptionKey::generate().unwrap());
///
/// let a = cipher.encrypt(b"case-worker").unwrap();
/// let b = cipher.encrypt(b"case-worker").unwrap();
/// assert_ne!(a, b);
///
/// let plain = cipher.decrypt(&a).unwrap();
/// assert_eq!(plain.expose_secret(), b"case-worker");
/// ```
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.0.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn from_source(source: &dyn KeySource) -> Result<Self, AuthError> {
        let key = source.load_key()?;
        Ok(Self::new(&key))
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// Empty plaintext is encrypted like any other value; absence of a value is
    /// the caller's concern (a NULL column), never an empty payload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self.cipher.encrypt(&nonce, plaintext).map_err(|_| {
            log::error!(target: LOG_TARGET, "msg=\"encryption failed\"");
            AuthError::Internal("encryption failed".to_owned())
        })?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Decrypts a payload produced by [`encrypt`](Self::encrypt).
    ///
    /// Truncated, tampered or foreign-key payloads fail with
    /// `AuthError::DecryptionFailed`; no partial plaintext is ever returned.
    pub fn decrypt(&self, payload: &[u8]) -> Result<SecretBytes, AuthError> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            log::warn!(target: LOG_TARGET, "msg=\"decryption failed\", reason=\"truncated payload\", len={}", payload.len());
            return Err(AuthError::DecryptionFailed);
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                log::warn!(target: LOG_TARGET, "msg=\"decryption failed\", reason=\"authentication\"");
                AuthError::DecryptionFailed
            })?;

        Ok(SecretBytes::new(plaintext))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, AuthError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypts UTF-8 text. Both the byte buffer and the returned string are
    /// wiped on drop; copies made through `expose_secret` are not.
    pub fn decrypt_str(&self, payload: &[u8]) -> Result<SecretString, AuthError> {
        self.decrypt(payload)?
            .into_secret_string()
            .ok_or(AuthError::DecryptionFailed)
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldCipher(AES-256-GCM)")
    }
}
