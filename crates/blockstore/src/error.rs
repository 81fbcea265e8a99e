//! Error types for the encrypted block layer.

use thiserror::Error;

use crate::crypto::codec::CodecError;

/// Errors surfaced by the block store to the filesystem host.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid or missing configuration (bad key, bad base64, zero block size).
    #[error("configuration error: {0}")]
    Config(String),

    /// The named file or directory does not exist on the cipher mount.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// A read was requested past the logical end of the file.
    #[error("read offset past logical end of file")]
    OutOfRange,

    /// An operation that needs the writer handle ran without an open session.
    #[error("no open write session for {0}")]
    NoWriteSession(String),

    /// Block decryption failed: tag mismatch, truncated record, or wrong key.
    #[error(transparent)]
    Decrypt(#[from] CodecError),

    /// Underlying filesystem failure. The host layer owns retries.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
