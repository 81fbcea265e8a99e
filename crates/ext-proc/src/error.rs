//! Error types for the filter pipeline.

use thiserror::Error;

/// Fatal configuration errors raised while building the filter factory.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy source selection or another setting is unusable.
    #[error("configuration error: {0}")]
    Invalid(String),

    /// Reading a policy source from disk failed.
    #[error("failed to read policy source: {0}")]
    Io(#[from] std::io::Error),

    /// A policy module failed to compile.
    #[error("policy compilation failed: {0}")]
    Policy(String),

    /// The OCI policy bundle could not be downloaded or unpacked.
    #[error("{0}")]
    BundleDownload(String),

    /// The downloaded bundle carried no policy modules.
    #[error("expected bundle with at least one module but got none")]
    EmptyBundle,
}
