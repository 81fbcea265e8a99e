//! Filesystem facade: the component surface consumed by the host driver.
//!
//! Operations mirror the host's filesystem-component interface: create-file,
//! stage-data, commit-data, read-in-buffer, get-attr, create-dir and
//! stream-dir. Writes go through the single per-file [`FileSession`]
//! installed by [`BlockStore::create_file`]; reads always open fresh
//! read-only handles against the cipher mount.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::{debug, info, trace};

use crate::config::BlockStoreConfig;
use crate::crypto::{AeadCodec, NONCE_SIZE};
use crate::error::StoreError;
use crate::layout::BlockLayout;
use crate::session::FileSession;

/// Logical handle returned to the host on `create_file`.
///
/// The host owns the logical size and updates it as it stages data; reads
/// clamp against it.
#[derive(Debug)]
pub struct FileHandle {
    /// Logical path relative to the mount point.
    pub path: String,
    /// Logical file size as tracked by the host.
    size: AtomicI64,
    /// Creation-time timestamp.
    pub mtime: SystemTime,
}

impl FileHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: AtomicI64::new(0),
            mtime: SystemTime::now(),
        }
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, size: i64) {
        self.size.store(size, Ordering::SeqCst);
    }
}

/// Attribute record for one entry on the cipher mount, with the logical
/// size recovered from the trailer for regular files.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    /// Path relative to the mount point.
    pub path: String,
    /// Base name of the entry.
    pub name: String,
    /// Logical size for files; raw size for directories.
    pub size: i64,
    /// Unix permission bits.
    pub mode: u32,
    /// Modified time.
    pub mtime: SystemTime,
    /// Access time (approximated as "now", matching the upstream driver).
    pub atime: SystemTime,
    /// Change time (same as mtime).
    pub ctime: SystemTime,
    /// Creation time (same as mtime).
    pub crtime: SystemTime,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Encrypting block store over a cipher mount point.
pub struct BlockStore {
    layout: BlockLayout,
    codec: AeadCodec,
    mount_point: PathBuf,
    session: RwLock<Option<FileSession>>,
}

impl BlockStore {
    /// Build a store from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the decoded key is rejected by the
    /// codec.
    pub fn new(config: &BlockStoreConfig) -> Result<Self, StoreError> {
        let codec =
            AeadCodec::new(&config.key).map_err(|e| StoreError::Config(e.to_string()))?;
        info!(
            block_size = config.block_size,
            mount_path = %config.mount_path,
            "block store configured"
        );
        Ok(Self {
            layout: BlockLayout::new(config.block_size),
            codec,
            mount_point: PathBuf::from(&config.mount_path),
            session: RwLock::new(None),
        })
    }

    fn cipher_path(&self, name: &str) -> PathBuf {
        self.mount_point.join(name)
    }

    /// Open (creating if absent) the ciphertext file for `name` read-write
    /// and install it as the session's writer handle.
    ///
    /// # Errors
    ///
    /// Passes through filesystem errors from the open.
    pub fn create_file(&self, name: &str, mode: u32) -> Result<FileHandle, StoreError> {
        let path = self.cipher_path(name);
        info!(path = %path.display(), "create file");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&path)?;

        let mut session = self.session.write().expect("session lock poisoned");
        *session = Some(FileSession::new(file));
        Ok(FileHandle::new(name))
    }

    /// Seal one block of plaintext and write it at its aligned record slot.
    ///
    /// `offset` must be block-aligned and `data` at most one block long;
    /// short blocks are zero-padded and their padding recorded for the
    /// commit trailer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoWriteSession`] when called before
    /// `create_file`, otherwise passes through seal and write failures.
    pub fn stage_data(&self, name: &str, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        trace!(name, offset, len = data.len(), "stage data");
        let session = self.session.read().expect("session lock poisoned");
        let session = session
            .as_ref()
            .ok_or_else(|| StoreError::NoWriteSession(name.to_owned()))?;
        session.stage_block(&self.codec, &self.layout, offset, data)
    }

    /// Finish the write session: persist the padding trailer and close the
    /// writer handle. A session with no staged blocks just closes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoWriteSession`] when no session is open,
    /// otherwise passes through the trailer write failure.
    pub fn commit_data(&self, name: &str) -> Result<(), StoreError> {
        info!(name, "commit data");
        let session = {
            let mut guard = self.session.write().expect("session lock poisoned");
            guard
                .take()
                .ok_or_else(|| StoreError::NoWriteSession(name.to_owned()))?
        };
        session.commit(&self.layout)
    }

    /// Read and decrypt the block containing `offset` into `buf`.
    ///
    /// The reader contract is block-aligned: the decrypted block is copied
    /// into `buf` from its origin, so callers stream block-by-block with
    /// offsets that are multiples of the block size. Returns the number of
    /// logical bytes available at `offset`, clamped to the buffer length.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OutOfRange`] for offsets past the logical end,
    /// [`StoreError::Decrypt`] on authentication failure, and passes through
    /// filesystem errors.
    pub fn read_in_buffer(
        &self,
        handle: &FileHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StoreError> {
        trace!(path = %handle.path, offset, "read in buffer");
        let size = handle.size();
        if offset > size as u64 {
            return Err(StoreError::OutOfRange);
        }

        let remaining = (size as u64 - offset).min(buf.len() as u64) as usize;
        if remaining == 0 {
            return Ok(0);
        }

        // Reads never share the writer handle.
        let file = File::open(self.cipher_path(&handle.path))?;

        let record_offset = self.layout.physical_offset(self.layout.block_index(offset));
        let mut record = vec![0u8; self.layout.record_size() as usize];
        file.read_exact_at(&mut record, record_offset)?;

        let plaintext = self
            .codec
            .open(&record[..NONCE_SIZE], &record[NONCE_SIZE..])?;

        let n = buf.len().min(plaintext.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        Ok(remaining)
    }

    /// Stat `name` on the cipher mount, recovering the logical size from
    /// the trailer for regular files.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for missing entries and passes
    /// through other stat/read failures.
    pub fn get_attr(&self, name: &str) -> Result<FileAttributes, StoreError> {
        trace!(name, "get attr");
        let path = self.cipher_path(name);
        let meta = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_owned())
            } else {
                StoreError::Io(e)
            }
        })?;

        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let base_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_owned());

        let size = if meta.is_dir() {
            meta.len() as i64
        } else {
            let file = File::open(&path)?;
            self.layout
                .logical_size_from(meta.len(), |buf, off| file.read_exact_at(buf, off))?
                as i64
        };

        Ok(FileAttributes {
            path: name.to_owned(),
            name: base_name,
            size,
            mode: meta.mode(),
            mtime,
            atime: SystemTime::now(),
            ctime: mtime,
            crtime: mtime,
            is_dir: meta.is_dir(),
        })
    }

    /// Create a directory on the cipher mount with mode 0777.
    ///
    /// # Errors
    ///
    /// Passes through the mkdir failure.
    pub fn create_dir(&self, name: &str) -> Result<(), StoreError> {
        let path = self.cipher_path(name);
        info!(path = %path.display(), "create dir");
        std::fs::DirBuilder::new().mode(0o777).create(&path)?;
        Ok(())
    }

    /// Enumerate a directory, returning attributes (with recovered logical
    /// sizes) for every entry that still exists at stat time.
    ///
    /// # Errors
    ///
    /// Passes through the directory read failure and any non-not-found
    /// attribute failure.
    pub fn stream_dir(&self, name: &str) -> Result<Vec<FileAttributes>, StoreError> {
        let dir = format_list_dir_name(name);
        info!(dir, "stream dir");

        let entries = std::fs::read_dir(self.cipher_path(&dir))?;
        let mut attrs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let child = format!("{dir}{}", entry.file_name().to_string_lossy());
            match self.get_attr(&child) {
                Ok(attr) => attrs.push(attr),
                // Raced with a delete between listing and stat.
                Err(StoreError::NotFound(_)) => {
                    debug!(child, "entry vanished during listing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(attrs)
    }
}

/// Normalise a directory name for enumeration: the root `"/"` becomes the
/// empty string, and any other non-empty name gets a trailing separator so
/// children list under it rather than alongside it.
fn format_list_dir_name(name: &str) -> String {
    if name == "/" {
        String::new()
    } else if !name.is_empty() && !name.ends_with('/') {
        format!("{name}/")
    } else {
        name.to_owned()
    }
}
