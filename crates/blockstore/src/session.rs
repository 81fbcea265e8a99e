//! Per-open-file write session: the writer handle and last-chunk tracker.
//!
//! A session is created by `create_file` and destroyed by `commit_data`.
//! Staging writes the sealed record first and only then takes the tracker
//! mutex, so concurrent stages of different blocks never serialise their
//! I/O; the tracker race resolves correctly because `farthest_block_seen`
//! is a maximum.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::crypto::{AeadCodec, NONCE_SIZE};
use crate::error::StoreError;
use crate::layout::BlockLayout;

/// Tracker for the highest staged block and its padding.
///
/// `padding_length` is only meaningful when it came from the stage call
/// covering `farthest_block_seen`; in a well-formed stream only the
/// highest-indexed block is short.
#[derive(Debug)]
struct LastChunkTracker {
    /// Highest block index staged in this session; −1 before any write.
    farthest_block_seen: i64,
    /// Zero-padding applied to the most recently staged block.
    padding_length: u64,
}

/// Write-side state for one open ciphertext file.
pub struct FileSession {
    handle: Arc<File>,
    tracker: Mutex<LastChunkTracker>,
}

impl FileSession {
    /// Wrap a freshly opened read-write ciphertext handle.
    pub fn new(handle: File) -> Self {
        Self {
            handle: Arc::new(handle),
            tracker: Mutex::new(LastChunkTracker {
                farthest_block_seen: -1,
                padding_length: 0,
            }),
        }
    }

    /// Seal one plaintext block and write its record at the aligned offset.
    ///
    /// Contract (enforced by the filesystem host): `offset` is a multiple of
    /// the block size and `data` is at most one block long. Short blocks are
    /// zero-padded to the block size before sealing. Restaging a block is
    /// permitted and replaces the record under a fresh nonce; stages may
    /// arrive out of order as long as the highest-indexed one carries the
    /// actual final padding.
    ///
    /// # Errors
    ///
    /// Propagates sealing and positioned-write failures.
    pub fn stage_block(
        &self,
        codec: &AeadCodec,
        layout: &BlockLayout,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StoreError> {
        debug_assert_eq!(offset % layout.block_size(), 0, "stage offset must be block-aligned");
        debug_assert!(data.len() as u64 <= layout.block_size(), "stage data exceeds block size");

        let block_size = layout.block_size() as usize;
        let padding_length = (block_size - data.len().min(block_size)) as u64;

        let (nonce, sealed) = if padding_length > 0 {
            let mut padded = Vec::with_capacity(block_size);
            padded.extend_from_slice(data);
            padded.resize(block_size, 0);
            codec.seal(&padded)?
        } else {
            codec.seal(data)?
        };

        let block_index = layout.block_index(offset);
        let record_offset = layout.physical_offset(block_index);

        let mut record = Vec::with_capacity(NONCE_SIZE + sealed.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&sealed);

        // Positioned write first; the tracker mutex is only for bookkeeping.
        self.handle.write_all_at(&record, record_offset)?;

        // Only the highest-indexed block determines the trailer; stages of
        // earlier blocks must not clobber its padding.
        let mut tracker = self.tracker.lock().expect("last-chunk tracker poisoned");
        if block_index as i64 >= tracker.farthest_block_seen {
            tracker.farthest_block_seen = block_index as i64;
            tracker.padding_length = padding_length;
        }
        debug!(
            block_index,
            farthest = tracker.farthest_block_seen,
            padding = tracker.padding_length,
            "staged block"
        );
        Ok(())
    }

    /// Write the padding trailer (if anything was staged) and consume the
    /// session, closing the writer handle.
    ///
    /// With no staged blocks this just closes the handle. On a trailer write
    /// failure the handle is still closed and the file is left without a
    /// trailer, so readers recover a logical size of 0 — the commit is
    /// all-or-nothing.
    ///
    /// # Errors
    ///
    /// Propagates the trailer write failure.
    pub fn commit(self, layout: &BlockLayout) -> Result<(), StoreError> {
        let mut tracker = self.tracker.lock().expect("last-chunk tracker poisoned");
        if tracker.farthest_block_seen != -1 {
            let trailer_offset = layout.trailer_offset((tracker.farthest_block_seen + 1) as u64);
            let trailer = tracker.padding_length.to_be_bytes();
            self.handle.write_all_at(&trailer, trailer_offset)?;
            info!(
                padding = tracker.padding_length,
                offset = trailer_offset,
                "wrote padding trailer"
            );
            tracker.farthest_block_seen = -1;
            tracker.padding_length = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::{rand_core::RngCore, OsRng};
    use std::fs::OpenOptions;
    use std::io::Read;

    const BLOCK: u64 = 4096;

    fn codec() -> AeadCodec {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        AeadCodec::new(&key).unwrap()
    }

    fn open_temp(dir: &tempfile::TempDir, name: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join(name))
            .unwrap()
    }

    #[test]
    fn stage_then_commit_writes_record_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BlockLayout::new(BLOCK);
        let codec = codec();
        let session = FileSession::new(open_temp(&dir, "f"));

        let data = vec![0xABu8; BLOCK as usize - 100];
        session.stage_block(&codec, &layout, 0, &data).unwrap();
        session.commit(&layout).unwrap();

        let mut contents = Vec::new();
        File::open(dir.path().join("f"))
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents.len() as u64, layout.record_size() + 8);
        let trailer = u64::from_be_bytes(contents[contents.len() - 8..].try_into().unwrap());
        assert_eq!(trailer, 100);
    }

    #[test]
    fn commit_without_writes_leaves_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BlockLayout::new(BLOCK);
        let session = FileSession::new(open_temp(&dir, "empty"));
        session.commit(&layout).unwrap();
        let meta = std::fs::metadata(dir.path().join("empty")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn out_of_order_stages_track_the_highest_block() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BlockLayout::new(BLOCK);
        let codec = codec();
        let session = FileSession::new(open_temp(&dir, "ooo"));

        // Final (short) block staged first, then an earlier full block.
        let last = vec![1u8; 64];
        let first = vec![2u8; BLOCK as usize];
        session.stage_block(&codec, &layout, 2 * BLOCK, &last).unwrap();
        session.stage_block(&codec, &layout, 0, &first).unwrap();
        {
            let tracker = session.tracker.lock().unwrap();
            assert_eq!(tracker.farthest_block_seen, 2);
            assert_eq!(tracker.padding_length, BLOCK - 64);
        }
        session.commit(&layout).unwrap();

        let mut contents = Vec::new();
        File::open(dir.path().join("ooo"))
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents.len() as u64, 3 * layout.record_size() + 8);
        let trailer = u64::from_be_bytes(contents[contents.len() - 8..].try_into().unwrap());
        assert_eq!(trailer, BLOCK - 64);
    }
}
