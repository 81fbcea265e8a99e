//! AES-GCM seal/open of fixed-size plaintext blocks.

use aes_gcm::{
    aead::{consts::U12, rand_core::RngCore, Aead, KeyInit, OsRng},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use thiserror::Error;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_SIZE: usize = 12;

/// Byte length of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Per-record overhead on disk: nonce plus tag.
pub const META_SIZE: usize = NONCE_SIZE + TAG_SIZE;

// `aes-gcm` only aliases the 128- and 256-bit variants.
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Errors produced by the codec layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The key is not a valid AES key length.
    #[error("invalid encryption key length: expected 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Sealing failed inside the AEAD implementation.
    #[error("block encryption failed")]
    Seal,

    /// Authentication failed: tag mismatch, truncated record, or wrong key.
    #[error("block decryption failed (authentication tag mismatch or truncated record)")]
    Decrypt,
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM codec bound to one encryption key.
///
/// The variant is selected by key length at construction time; all three AES
/// key sizes share the 96-bit nonce and 128-bit tag layout, so the on-disk
/// record format is identical across them.
pub struct AeadCodec {
    cipher: Cipher,
}

impl AeadCodec {
    /// Build a codec from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidKeyLength`] unless the key is 16, 24 or
    /// 32 bytes long.
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        let cipher = match key.len() {
            16 => Cipher::Aes128(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|_| CodecError::InvalidKeyLength(key.len()))?,
            ),
            24 => Cipher::Aes192(
                Aes192Gcm::new_from_slice(key)
                    .map_err(|_| CodecError::InvalidKeyLength(key.len()))?,
            ),
            32 => Cipher::Aes256(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| CodecError::InvalidKeyLength(key.len()))?,
            ),
            n => return Err(CodecError::InvalidKeyLength(n)),
        };
        Ok(Self { cipher })
    }

    /// Seal one plaintext block.
    ///
    /// Generates a fresh 12-byte nonce from the OS CSPRNG and returns it
    /// alongside the ciphertext with the 16-byte tag appended.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Seal`] on an internal AEAD error.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), CodecError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CodecError::Seal)?;

        Ok((nonce_bytes, ciphertext))
    }

    /// Open one sealed block.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decrypt`] if authentication fails for any
    /// reason; the caller must never fall back to treating the record as
    /// plaintext.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CodecError::Decrypt);
        }
        let nonce = Nonce::from_slice(nonce);
        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes192(c) => c.decrypt(nonce, ciphertext),
            Cipher::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CodecError::Decrypt)
    }
}
