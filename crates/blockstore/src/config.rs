//! Configuration loading and validation for the encrypted block layer.
//!
//! The layer is configured by the filesystem host, either programmatically
//! or from the host's config sources. The encryption key arrives
//! base64-encoded and may be supplied through the `ENCRYPTION_KEY`
//! environment variable instead of the config document.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::error::StoreError;

/// Environment variable consulted when `encryption-key` is absent.
pub const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";

/// Raw block-layer options as they appear in the host's config document.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockStoreOptions {
    /// Plaintext block size in MiB.
    #[serde(rename = "block-size-mb", alias = "block_size_mb", default = "default_block_size_mb")]
    pub block_size_mb: u64,

    /// Mount point holding the ciphertext files.
    #[serde(
        rename = "encrypted-mount-path",
        alias = "encrypted_mount_path",
        default = "default_mount_path"
    )]
    pub encrypted_mount_path: String,

    /// Base64-encoded AES key. Falls back to [`ENV_ENCRYPTION_KEY`].
    #[serde(rename = "encryption-key", alias = "encryption_key", default)]
    pub encryption_key: String,
}

fn default_block_size_mb() -> u64 {
    1
}
fn default_mount_path() -> String {
    "/mnt/cipher/".into()
}

impl Default for BlockStoreOptions {
    fn default() -> Self {
        Self {
            block_size_mb: default_block_size_mb(),
            encrypted_mount_path: default_mount_path(),
            encryption_key: String::new(),
        }
    }
}

/// Validated block-layer configuration with the key decoded.
#[derive(Clone)]
pub struct BlockStoreConfig {
    /// Plaintext block size in bytes.
    pub block_size: u64,
    /// Mount point holding the ciphertext files.
    pub mount_path: String,
    /// Decoded AES key bytes (16, 24 or 32 of them).
    pub key: Vec<u8>,
}

impl std::fmt::Debug for BlockStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("BlockStoreConfig")
            .field("block_size", &self.block_size)
            .field("mount_path", &self.mount_path)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl BlockStoreConfig {
    /// Resolve and validate raw options into a usable configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the key is missing, is not valid
    /// base64, decodes to an unsupported length, or the block size is zero.
    pub fn from_options(opts: &BlockStoreOptions) -> Result<Self, StoreError> {
        let encoded = if opts.encryption_key.is_empty() {
            std::env::var(ENV_ENCRYPTION_KEY).unwrap_or_default()
        } else {
            opts.encryption_key.clone()
        };
        if encoded.is_empty() {
            return Err(StoreError::Config("encryption key not set".into()));
        }

        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StoreError::Config(format!("error decoding encryption key: {e}")))?;
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(StoreError::Config(format!(
                "decoded encryption key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }

        if opts.block_size_mb == 0 {
            return Err(StoreError::Config("block-size-mb must be > 0".into()));
        }

        Ok(Self {
            block_size: opts.block_size_mb * 1024 * 1024,
            mount_path: opts.encrypted_mount_path.clone(),
            key,
        })
    }

    /// Load options from the process environment and validate them.
    ///
    /// Environment variables map onto the option names with `-` replaced by
    /// `_` (e.g. `BLOCK_SIZE_MB`); the key itself comes from
    /// [`ENV_ENCRYPTION_KEY`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] on any missing or invalid value.
    pub fn from_env() -> Result<Self, StoreError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build configuration: {e}")))?;

        let opts: BlockStoreOptions = cfg
            .try_deserialize()
            .map_err(|e| StoreError::Config(format!("failed to deserialise configuration: {e}")))?;
        Self::from_options(&opts)
    }
}
