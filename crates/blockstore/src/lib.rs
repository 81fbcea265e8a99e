//! `blockstore` — transparent per-block authenticated encryption over a
//! backing object-storage mount.
//!
//! The layer sits between a filesystem driver and a "cipher" mount point.
//! Plaintext is carried in fixed-size blocks (default 1 MiB); each block is
//! sealed with AES-GCM under a fresh random nonce and written as a
//! `nonce ‖ ciphertext ‖ tag` record of `block_size + 28` bytes. The last
//! plaintext block is zero-padded up to the block size, and the padding
//! length is persisted as an 8-byte big-endian trailer after the final
//! record when the file is committed, so readers can recover the logical
//! file length from the physical one.
//!
//! # On-disk format
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┬─────────┐
//! │ block 0 rec  │ block 1 rec  │ ... │ block N-1    │ trailer │
//! │ (B+28 bytes) │ (B+28 bytes) │     │ (B+28 bytes) │ (8 B)   │
//! └──────────────┴──────────────┴─────┴──────────────┴─────────┘
//! record = 12-byte nonce ‖ B bytes ciphertext ‖ 16-byte GCM tag
//! trailer = big-endian u64 padding length of the last block
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod layout;
pub mod session;
pub mod store;

pub use config::BlockStoreConfig;
pub use error::StoreError;
pub use store::BlockStore;
