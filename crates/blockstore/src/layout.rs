//! Pure arithmetic mapping between logical and physical file coordinates.
//!
//! Every physical record is `block_size + META_SIZE` bytes; the trailer sits
//! immediately after the last record. None of these functions touch the
//! filesystem except [`BlockLayout::logical_size_from`], which reads the
//! 8-byte trailer through the reader it is handed.

use std::io;

use crate::crypto::META_SIZE;

/// Width of the big-endian padding-length trailer.
pub const TRAILER_SIZE: u64 = 8;

/// Coordinate mapping for one configured block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u64,
}

impl BlockLayout {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    /// Configured plaintext block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Size of one on-disk record: block plus nonce and tag.
    pub fn record_size(&self) -> u64 {
        self.block_size + META_SIZE as u64
    }

    /// Index of the block containing the logical offset.
    pub fn block_index(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    /// Physical offset of the record for the given block index.
    pub fn physical_offset(&self, index: u64) -> u64 {
        index * self.record_size()
    }

    /// Physical offset of the trailer for a file of `n` blocks.
    pub fn trailer_offset(&self, n: u64) -> u64 {
        n * self.record_size()
    }

    /// Recover the logical file size from the physical one.
    ///
    /// `read_trailer` must fill its buffer from the given physical offset
    /// (the last 8 bytes of the file). Files too short to hold at least one
    /// record and a trailer report logical size 0: either no block has been
    /// staged yet, or the writer crashed before commit and the content is
    /// unreadable by design.
    ///
    /// # Errors
    ///
    /// Propagates failures from `read_trailer`.
    pub fn logical_size_from<F>(&self, physical_size: u64, read_trailer: F) -> io::Result<u64>
    where
        F: FnOnce(&mut [u8; 8], u64) -> io::Result<()>,
    {
        let total_blocks = physical_size / self.record_size();
        if total_blocks == 0 || physical_size < self.trailer_offset(total_blocks) + TRAILER_SIZE {
            return Ok(0);
        }

        let mut trailer = [0u8; 8];
        read_trailer(&mut trailer, physical_size - TRAILER_SIZE)?;
        let padding = u64::from_be_bytes(trailer);

        Ok(physical_size
            .saturating_sub(padding)
            .saturating_sub(total_blocks * META_SIZE as u64)
            .saturating_sub(TRAILER_SIZE))
    }
}
