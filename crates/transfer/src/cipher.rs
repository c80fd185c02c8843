//! Per-chunk authenticated encryption (AES-256-GCM).
//!
//! Frame layout:
//!
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Every call to [`ChunkCipher::encrypt`] draws a fresh nonce from the OS
//! CSPRNG. No counter state is kept, so nonces stay unique across restarts.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::MAX_CHUNK_SIZE;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Bytes added to every plaintext chunk.
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Errors from chunk encryption and decryption.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// Frame shorter than nonce + tag.
    #[error("malformed frame: {len} bytes (minimum {FRAME_OVERHEAD})")]
    Format { len: usize },

    /// Tag did not verify: the frame was tampered with, corrupted, or
    /// encrypted under a different key.
    #[error("chunk authentication failed")]
    Authentication,

    #[error("chunk of {size} bytes exceeds maximum {max}")]
    Oversized { size: usize, max: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// 256-bit symmetric key supplied by the key-exchange layer.
///
/// Wiped from memory on drop; `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(hex_key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CipherError::InvalidKey(format!("not hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CipherError::InvalidKey(format!("{} bytes, need 32", v.len())))?;
        Ok(Self(bytes))
    }

    /// Generates a random key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// AES-256-GCM cipher bound to one key, with a plaintext size cap.
pub struct ChunkCipher {
    aead: Aes256Gcm,
    max_plaintext: usize,
}

impl ChunkCipher {
    /// Creates a cipher capped at [`MAX_CHUNK_SIZE`] bytes of plaintext.
    pub fn new(key: &SecretKey) -> Self {
        Self::with_max_plaintext(key, MAX_CHUNK_SIZE as usize)
    }

    pub fn with_max_plaintext(key: &SecretKey, max_plaintext: usize) -> Self {
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self {
            aead,
            max_plaintext,
        }
    }

    /// Encrypts one chunk into a self-describing frame.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if plaintext.len() > self.max_plaintext {
            return Err(CipherError::Oversized {
                size: plaintext.len(),
                max: self.max_plaintext,
            });
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        // Output is ciphertext || tag.
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Authentication)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Verifies and decrypts one frame.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CipherError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CipherError::Format { len: frame.len() });
        }
        let plaintext_len = frame.len() - FRAME_OVERHEAD;
        if plaintext_len > self.max_plaintext {
            return Err(CipherError::Oversized {
                size: plaintext_len,
                max: self.max_plaintext,
            });
        }

        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)
    }
}

/// Encrypts `plaintext` under `key` (see [`ChunkCipher::encrypt`]).
pub fn encrypt_chunk(plaintext: &[u8], key: &SecretKey) -> Result<Vec<u8>, CipherError> {
    ChunkCipher::new(key).encrypt(plaintext)
}

/// Decrypts a frame under `key` (see [`ChunkCipher::decrypt`]).
pub fn decrypt_chunk(frame: &[u8], key: &SecretKey) -> Result<Vec<u8>, CipherError> {
    ChunkCipher::new(key).decrypt(frame)
}
