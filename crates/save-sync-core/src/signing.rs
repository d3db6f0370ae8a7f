//! Password-derived session keys and save payload signing.
//!
//! The host generates a random salt per session and sends it in clear during
//! the handshake. Both sides derive the same key from the shared password with
//! PBKDF2-HMAC-SHA256; the key itself never crosses the wire.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count for session key derivation.
pub const PBKDF2_ITERATIONS: u32 = 200_000;

/// Session key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// HMAC-SHA256 tag length in bytes.
pub const TAG_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),

    #[error("Invalid salt length: expected {SALT_LEN} bytes, got {0}")]
    InvalidSaltLength(usize),

    #[error("Signature mismatch")]
    Mismatch,
}

/// Random per-session salt, transmitted in the `Hello` frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Generate a fresh random salt.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, SigningError> {
        let bytes = STANDARD
            .decode(s.as_bytes())
            .map_err(|e| SigningError::InvalidBase64(e.to_string()))?;
        let len = bytes.len();
        let array: [u8; SALT_LEN] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidSaltLength(len))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", self.to_base64())
    }
}

/// 32-byte key shared by every party that knows the session password.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Derive the session key from the shared password and the session salt.
    pub fn derive(password: &str, salt: &Salt) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn mac(&self, filename: &str, size: u64, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(filename.as_bytes());
        mac.update(b"\n");
        mac.update(size.to_string().as_bytes());
        mac.update(b"\n");
        mac.update(payload);
        mac
    }

    /// Compute the tag over `filename \n size \n payload`.
    pub fn sign(&self, filename: &str, size: u64, payload: &[u8]) -> [u8; TAG_LEN] {
        let digest = self.mac(filename, size, payload).finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        tag
    }

    /// Check a tag in constant time.
    pub fn verify(
        &self,
        filename: &str,
        size: u64,
        payload: &[u8],
        tag: &[u8],
    ) -> Result<(), SigningError> {
        self.mac(filename, size, payload)
            .verify_slice(tag)
            .map_err(|_| SigningError::Mismatch)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
