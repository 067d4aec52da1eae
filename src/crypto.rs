//! Secret material: random tokens, constant-time comparison and password hashing.

use argon2::{Algorithm, Argon2, Params, PasswordVerifier, Version};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use password_hash::{PasswordHash, PasswordHasher as ArgonPasswordHasher, SaltString};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{AuthError, SecretString};

/// Smallest accepted token size in bytes before encoding.
pub const MIN_TOKEN_BYTES: usize = 16;

/// Largest accepted token size in bytes before encoding.
pub const MAX_TOKEN_BYTES: usize = 128;

/// Default token size in bytes (256 bits of entropy).
pub const DEFAULT_TOKEN_BYTES: usize = 32;

const fn encoded_len(byte_len: usize) -> usize {
    (byte_len * 4).div_ceil(3)
}

/// Generates a URL-safe token backed by the operating system RNG.
///
/// `byte_len` is the amount of randomness before encoding and must lie in
/// `[MIN_TOKEN_BYTES, MAX_TOKEN_BYTES]`.
///
/// # Example
///
/// ```rust
/// use custodia::crypto::{generate_token, validate_token_format};
///
/// let token = generate_token(32).unwrap();
/// assert_eq!(token.len(), 43);
/// assert!(validate_token_format(token.expose_secret()));
/// assert!(generate_token(8).is_err());
/// ```
pub fn generate_token(byte_len: usize) -> Result<SecretString, AuthError> {
    if !(MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES).contains(&byte_len) {
        return Err(AuthError::ConfigurationError(format!(
            "token length must be between {MIN_TOKEN_BYTES} and {MAX_TOKEN_BYTES} bytes, got {byte_len}"
        )));
    }

    let mut raw = Zeroizing::new(vec![0u8; byte_len]);
    OsRng
        .try_fill_bytes(raw.as_mut_slice())
        .map_err(|e| AuthError::Internal(format!("random source unavailable: {e}")))?;

    Ok(SecretString::new(URL_SAFE_NO_PAD.encode(raw.as_slice())))
}

/// Cheap structural check run before any storage lookup.
///
/// Rejects tokens whose encoded length is out of range without decoding them,
/// then decodes and re-checks the byte bounds.
pub fn validate_token_format(token: &str) -> bool {
    let len = token.len();
    if len < encoded_len(MIN_TOKEN_BYTES) || len > encoded_len(MAX_TOKEN_BYTES) {
        return false;
    }

    match URL_SAFE_NO_PAD.decode(token) {
        Ok(decoded) => {
            let decoded = Zeroizing::new(decoded);
            (MIN_TOKEN_BYTES..=MAX_TOKEN_BYTES).contains(&decoded.len())
        }
        Err(_) => false,
    }
}

/// SHA-256 of a token, hex encoded. Tokens are high-entropy, so a fast
/// hash is enough to make the digest non-reversible.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compares two byte strings without short-circuiting on the first difference.
///
/// Length is not secret: inputs of different length compare unequal immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Trait for password hashing and verification.
///
/// The default implementation is [`Argon2Hasher`].
///
/// ```rust
/// use custodia::crypto::{Argon2Hasher, PasswordHasher};
///
/// let hasher = Argon2Hasher::default();
/// let hash = hasher.hash("correct horse").unwrap();
/// assert!(hasher.verify("correct horse", &hash).unwrap());
/// assert!(!hasher.verify("battery staple", &hash).unwrap());
/// ```
pub trait PasswordHasher: Send + Sync {
    /// # Errors
    ///
    /// Returns `AuthError::PasswordHashError` if hashing fails.
    fn hash(&self, password: &str) -> Result<String, AuthError>;

    /// # Errors
    ///
    /// Returns `AuthError::PasswordHashError` if the stored hash is malformed.
    fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthError>;
}

/// Argon2id password hasher with configurable parameters.
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    /// Memory cost in KiB
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            memory_cost: 19456, // 19 MiB - argon2 default
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl Argon2Hasher {
    #[must_use]
    pub fn new(memory_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            memory_cost,
            time_cost,
            parallelism,
        }
    }

    /// 64 MiB memory, 3 iterations, 4 lanes.
    #[must_use]
    pub fn production() -> Self {
        Self {
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let params = Params::new(self.memory_cost, self.time_cost, self.parallelism, None)
            .map_err(|_| AuthError::PasswordHashError)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|_| AuthError::PasswordHashError)
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(hash).map_err(|_| AuthError::PasswordHashError)?;

        // params come from the PHC string, not from self
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}
