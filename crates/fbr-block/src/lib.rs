#![forbid(unsafe_code)]
//! Cached block record and the storage layer blocks are fetched from.
//!
//! Provides the [`Block`] value held by the cache, the [`BlockSource`] trait
//! the cache calls on a miss, and [`FileTable`], a positional-read source
//! over open files.

use fbr_error::{FbrError, Result};
use fbr_types::{BlockIndex, FileDescriptor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// One resident chunk of one file's data plus its reference counter.
///
/// Invariant: `data` is never mutated after construction. Its length is at
/// most the cache block size; only the final block of a file may be shorter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    fd: FileDescriptor,
    index: BlockIndex,
    counter: u64,
    data: Vec<u8>,
}

impl Block {
    #[must_use]
    pub fn new(fd: FileDescriptor, index: BlockIndex, counter: u64, data: Vec<u8>) -> Self {
        Self {
            fd,
            index,
            counter,
            data,
        }
    }

    #[must_use]
    pub fn fd(&self) -> FileDescriptor {
        self.fd
    }

    #[must_use]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Credit one reference. Only the cache calls this.
    pub fn increment_counter(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }
}

/// Storage collaborator: supplies raw block bytes on a cache miss.
pub trait BlockSource {
    /// Fetch up to `block_size` bytes starting at `index * block_size` of the
    /// file identified by `fd`.
    ///
    /// Returning fewer than `block_size` bytes signals end of file within
    /// this block. An unknown descriptor or unreadable range is an error.
    fn fetch_block(
        &self,
        fd: FileDescriptor,
        index: BlockIndex,
        block_size: u32,
    ) -> Result<Vec<u8>>;
}

impl<S: BlockSource + ?Sized> BlockSource for &S {
    fn fetch_block(
        &self,
        fd: FileDescriptor,
        index: BlockIndex,
        block_size: u32,
    ) -> Result<Vec<u8>> {
        (**self).fetch_block(fd, index, block_size)
    }
}

impl<S: BlockSource + ?Sized> BlockSource for Arc<S> {
    fn fetch_block(
        &self,
        fd: FileDescriptor,
        index: BlockIndex,
        block_size: u32,
    ) -> Result<Vec<u8>> {
        (**self).fetch_block(fd, index, block_size)
    }
}

/// Read into `buf` at `offset` until it is full or the file ends.
///
/// Returns the number of bytes read.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0_usize;
    while filled < buf.len() {
        let at = offset.saturating_add(filled as u64);
        match file.read_at(&mut buf[filled..], at) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[derive(Debug, Default)]
struct FileTableState {
    next_fd: i32,
    files: HashMap<FileDescriptor, Arc<File>>,
}

/// Table of open files that hands out descriptors and serves blocks from them.
///
/// Uses `std::os::unix::fs::FileExt` positional reads, so concurrent fetches
/// share no seek position. The file handle is cloned out of the table before
/// reading; the table lock is never held across I/O.
#[derive(Debug, Default)]
pub struct FileTable {
    state: Mutex<FileTableState>,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` read-only and register it under a fresh descriptor.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<FileDescriptor> {
        let file = File::open(path.as_ref())?;
        let mut state = self.state.lock();
        let fd = FileDescriptor(state.next_fd);
        state.next_fd = state
            .next_fd
            .checked_add(1)
            .ok_or_else(|| FbrError::RangeOverflow("file descriptor space exhausted".to_owned()))?;
        state.files.insert(fd, Arc::new(file));
        drop(state);
        tracing::debug!(
            target: "fbr::block",
            fd = fd.0,
            path = %path.as_ref().display(),
            "file_table_open"
        );
        Ok(fd)
    }

    /// Forget `fd`. Returns `false` if it was not open.
    ///
    /// Descriptors are never reused by this table, but callers sharing a cache
    /// should still invalidate the file's cached blocks.
    pub fn close(&self, fd: FileDescriptor) -> bool {
        let closed = self.state.lock().files.remove(&fd).is_some();
        tracing::debug!(target: "fbr::block", fd = fd.0, closed, "file_table_close");
        closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn file(&self, fd: FileDescriptor) -> Result<Arc<File>> {
        self.state
            .lock()
            .files
            .get(&fd)
            .cloned()
            .ok_or(FbrError::BadDescriptor(fd.0))
    }
}

impl BlockSource for FileTable {
    fn fetch_block(
        &self,
        fd: FileDescriptor,
        index: BlockIndex,
        block_size: u32,
    ) -> Result<Vec<u8>> {
        let file = self.file(fd)?;
        let offset = index.byte_offset(block_size).ok_or_else(|| {
            FbrError::RangeOverflow(format!(
                "block offset overflow: block={index} block_size={block_size}"
            ))
        })?;
        let len = usize::try_from(block_size)
            .map_err(|_| FbrError::RangeOverflow("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        let filled = read_full_at(&file, &mut buf, offset.0)?;
        buf.truncate(filled);
        tracing::trace!(
            target: "fbr::block",
            fd = fd.0,
            block = index.0,
            bytes = filled,
            "file_table_fetch"
        );
        Ok(buf)
    }
}
