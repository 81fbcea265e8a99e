//! AES-GCM block encryption primitives.
//!
//! This module is free of filesystem dependencies: it seals and opens whole
//! plaintext blocks and nothing else. Each seal draws a fresh 96-bit nonce
//! from the OS CSPRNG, so rewriting a block never reuses a nonce under the
//! same key.

pub mod codec;

pub use codec::{AeadCodec, CodecError, META_SIZE, NONCE_SIZE, TAG_SIZE};
