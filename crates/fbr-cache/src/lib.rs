#![forbid(unsafe_code)]
//! Fixed-capacity block read cache with Frequency-Based Replacement (FBR).
//!
//! [`FbrCache`] sits between a reader of arbitrary byte ranges and a
//! [`BlockSource`]. Reads are split into aligned blocks; each block is served
//! from the cache when resident, otherwise fetched, admitted and possibly
//! traded for an eviction.
//!
//! # Policy
//!
//! Resident blocks form one recency list split into New, Middle and Old
//! segments (see [`Segment`]).
//!
//! - A freshly fetched block enters the head of New with counter 0.
//! - A hit in New moves the block to the head of New without crediting it,
//!   so bursts of correlated references do not inflate its count.
//! - A hit in Middle or Old credits one reference and moves the block to the
//!   head of Middle.
//! - When the cache is full, the Old block with the lowest counter is evicted,
//!   the least recently used one on ties.
//!
//! # Concurrency
//!
//! `FbrCache` takes `&mut self` for every read and does no locking of its
//! own. [`SharedFbrCache`] wraps it in one mutex for callers that share a
//! cache between threads.

mod config;
mod list;

pub use config::CacheConfig;
pub use fbr_block::{Block, BlockSource, FileTable};
pub use list::{Segment, SegmentLens};

use fbr_error::{FbrError, Result};
use fbr_types::{BlockIndex, BlockPiece, BlockSpan, ByteOffset, FileDescriptor, RangeError};
use list::{SegmentedList, SlotId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Running counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Touched block indices that were already resident.
    pub hits: u64,
    /// Touched block indices that had to be fetched.
    pub misses: u64,
    /// Blocks dropped to make room for an admission.
    pub evictions: u64,
    /// Bytes copied into callers' buffers.
    pub bytes_read: u64,
    /// Fetches the source could not satisfy.
    pub fetch_failures: u64,
    /// Reads that ended early at end of file.
    pub short_reads: u64,
}

impl CacheStats {
    /// Fraction of touched blocks served without a fetch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

fn range_error(err: RangeError) -> FbrError {
    FbrError::RangeOverflow(err.to_string())
}

/// FBR-managed read cache in front of a [`BlockSource`].
#[derive(Debug)]
pub struct FbrCache<S: BlockSource> {
    source: S,
    config: CacheConfig,
    list: SegmentedList,
    /// Per-file membership: which block indices are resident, and where.
    ///
    /// Invariant: holds exactly the (fd, index) pairs in `list`, and never an
    /// empty inner map.
    index: HashMap<FileDescriptor, HashMap<BlockIndex, SlotId>>,
    stats: CacheStats,
}

impl<S: BlockSource> FbrCache<S> {
    pub fn new(config: CacheConfig, source: S) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            target: "fbr::cache",
            n_old_blk = config.n_old_blk,
            n_new_blk = config.n_new_blk,
            cache_size = config.cache_size,
            block_size = config.block_size,
            "fbr_cache_new"
        );
        Ok(Self {
            source,
            config,
            list: SegmentedList::new(config.n_new_blk, config.n_old_blk, config.cache_size),
            index: HashMap::new(),
            stats: CacheStats::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Maximum number of resident blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.cache_size
    }

    /// Number of resident blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn segment_lens(&self) -> SegmentLens {
        self.list.lens()
    }

    fn slot_of(&self, fd: FileDescriptor, index: BlockIndex) -> Option<SlotId> {
        self.index.get(&fd)?.get(&index).copied()
    }

    /// Whether the block `index` of `fd` is resident. No policy side effects.
    #[must_use]
    pub fn is_block_in_cache(&self, fd: FileDescriptor, index: BlockIndex) -> bool {
        self.slot_of(fd, index).is_some()
    }

    /// Reference counter of a resident block. No policy side effects.
    #[must_use]
    pub fn counter_of(&self, fd: FileDescriptor, index: BlockIndex) -> Option<u64> {
        let slot = self.slot_of(fd, index)?;
        self.list.block(slot).map(Block::counter)
    }

    /// Segment a resident block currently sits in. No policy side effects.
    #[must_use]
    pub fn segment_of(&self, fd: FileDescriptor, index: BlockIndex) -> Option<Segment> {
        let slot = self.slot_of(fd, index)?;
        self.list.segment(slot)
    }

    /// Resident blocks from most to least recently used.
    pub fn resident_blocks(&self) -> impl Iterator<Item = (&Block, Segment)> + '_ {
        self.list.iter()
    }

    /// Copy `buf.len()` bytes of `fd` starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is smaller than `buf.len()`
    /// only when the file ends inside the range. If the source fails on some
    /// block, the read fails; blocks admitted earlier in the same call stay
    /// cached.
    pub fn read_data(
        &mut self,
        fd: FileDescriptor,
        offset: ByteOffset,
        buf: &mut [u8],
    ) -> Result<usize> {
        let Some(span) =
            BlockSpan::new(offset, buf.len(), self.config.block_size).map_err(range_error)?
        else {
            return Ok(0);
        };

        let mut copied = 0_usize;
        for piece in span.pieces() {
            let Some(slot) = self.access(fd, piece.index)? else {
                // The file ends before this block.
                self.stats.short_reads += 1;
                break;
            };
            let block = self.list.block(slot).ok_or_else(|| {
                FbrError::Invariant(format!(
                    "indexed slot {slot} for fd {fd} block {} is vacant",
                    piece.index
                ))
            })?;
            let n = copy_piece(block.data(), &piece, buf);
            copied += n;
            if n < piece.len {
                self.stats.short_reads += 1;
                break;
            }
        }

        self.stats.bytes_read += copied as u64;
        tracing::trace!(
            target: "fbr::cache",
            fd = fd.0,
            offset = offset.0,
            requested = buf.len(),
            copied,
            "fbr_read"
        );
        Ok(copied)
    }

    /// `read(2)`-shaped entry point: reads `size` bytes at `offset` into the
    /// front of `buf` and returns the byte count, or `-errno` on failure.
    pub fn read_data_raw(&mut self, buf: &mut [u8], size: usize, offset: u64, fd: i32) -> isize {
        let result = match buf.get_mut(..size) {
            Some(dst) => self.read_data(FileDescriptor(fd), ByteOffset(offset), dst),
            None => Err(FbrError::InvalidArgument(format!(
                "size {size} exceeds buffer length {}",
                buf.len()
            ))),
        };
        match result {
            Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
            Err(err) => -(err.to_errno() as isize),
        }
    }

    /// Locate or fetch block `index` of `fd` and record the access.
    ///
    /// Returns `None` when the source has no bytes at all for the block.
    fn access(&mut self, fd: FileDescriptor, index: BlockIndex) -> Result<Option<SlotId>> {
        if let Some(slot) = self.slot_of(fd, index) {
            self.stats.hits += 1;
            let credited = self.list.touch(slot);
            tracing::trace!(
                target: "fbr::cache",
                fd = fd.0,
                block = index.0,
                credited,
                "fbr_hit"
            );
            return Ok(Some(slot));
        }

        self.stats.misses += 1;
        let data = match self.source.fetch_block(fd, index, self.config.block_size) {
            Ok(data) => data,
            Err(err) => {
                self.stats.fetch_failures += 1;
                tracing::warn!(
                    target: "fbr::cache",
                    fd = fd.0,
                    block = index.0,
                    error = %err,
                    "fbr_fetch_failed"
                );
                return Err(err);
            }
        };
        if data.len() > self.config.block_size as usize {
            self.stats.fetch_failures += 1;
            return Err(FbrError::OversizedBlock {
                fd: fd.0,
                block: index.0,
                len: data.len(),
                block_size: self.config.block_size,
            });
        }
        if data.is_empty() {
            tracing::trace!(target: "fbr::cache", fd = fd.0, block = index.0, "fbr_past_eof");
            return Ok(None);
        }
        Ok(Some(self.admit(Block::new(fd, index, 0, data))))
    }

    /// Insert a fetched block at the head of New, evicting first if full.
    fn admit(&mut self, block: Block) -> SlotId {
        if self.list.len() >= self.config.cache_size {
            self.evict_block();
        }
        let (fd, index, len) = (block.fd(), block.index(), block.len());
        let slot = self.list.push_new(block);
        self.index.entry(fd).or_default().insert(index, slot);
        tracing::debug!(
            target: "fbr::cache",
            fd = fd.0,
            block = index.0,
            len,
            resident = self.list.len(),
            "fbr_admit"
        );
        slot
    }

    /// Evict one block under FBR: lowest counter in Old, least recently used
    /// on ties, or the overall least recently used block if Old is empty.
    fn evict_block(&mut self) -> Option<Block> {
        let victim = self.list.victim()?;
        let block = self.list.remove(victim)?;
        self.forget(block.fd(), block.index());
        self.stats.evictions += 1;
        tracing::debug!(
            target: "fbr::cache",
            fd = block.fd().0,
            block = block.index().0,
            counter = block.counter(),
            "fbr_evict"
        );
        Some(block)
    }

    fn forget(&mut self, fd: FileDescriptor, index: BlockIndex) {
        if let Some(blocks) = self.index.get_mut(&fd) {
            blocks.remove(&index);
            if blocks.is_empty() {
                self.index.remove(&fd);
            }
        }
    }

    /// Drop every resident block of `fd`, e.g. when the descriptor is closed.
    ///
    /// Returns the number of blocks dropped.
    pub fn invalidate_file(&mut self, fd: FileDescriptor) -> usize {
        let Some(blocks) = self.index.remove(&fd) else {
            return 0;
        };
        let dropped = blocks
            .into_values()
            .filter_map(|slot| self.list.remove(slot))
            .count();
        tracing::debug!(target: "fbr::cache", fd = fd.0, dropped, "fbr_invalidate_file");
        dropped
    }

    /// Drop every resident block.
    pub fn clear(&mut self) {
        self.list.clear();
        self.index.clear();
        tracing::debug!(target: "fbr::cache", "fbr_clear");
    }

    /// Verify capacity, segment bounds and membership-index agreement.
    pub fn check_invariants(&self) -> Result<()> {
        self.list.check().map_err(FbrError::Invariant)?;
        let lens = self.list.lens();
        if lens.total() > self.config.cache_size {
            return Err(FbrError::Invariant(format!(
                "{} resident blocks exceed cache_size={}",
                lens.total(),
                self.config.cache_size
            )));
        }
        if lens.new > self.config.n_new_blk || lens.old > self.config.n_old_blk {
            return Err(FbrError::Invariant(format!(
                "segment bounds exceeded: {lens:?}"
            )));
        }
        let mut indexed = 0_usize;
        for (fd, blocks) in &self.index {
            if blocks.is_empty() {
                return Err(FbrError::Invariant(format!("empty index entry for fd {fd}")));
            }
            for (index, slot) in blocks {
                let Some(block) = self.list.block(*slot) else {
                    return Err(FbrError::Invariant(format!(
                        "fd {fd} block {index} points at vacant slot {slot}"
                    )));
                };
                if block.fd() != *fd || block.index() != *index {
                    return Err(FbrError::Invariant(format!(
                        "fd {fd} block {index} points at fd {} block {}",
                        block.fd(),
                        block.index()
                    )));
                }
                indexed += 1;
            }
        }
        if indexed != lens.total() {
            return Err(FbrError::Invariant(format!(
                "index holds {indexed} blocks, list holds {}",
                lens.total()
            )));
        }
        Ok(())
    }
}

/// Copy the wanted part of `data` into `buf`. Returns bytes copied, which is
/// less than `piece.len` when `data` is a short final block.
fn copy_piece(data: &[u8], piece: &BlockPiece, buf: &mut [u8]) -> usize {
    let available = data.len().saturating_sub(piece.start);
    let n = piece.len.min(available);
    if n > 0 {
        buf[piece.dest..piece.dest + n].copy_from_slice(&data[piece.start..piece.start + n]);
    }
    n
}

/// An [`FbrCache`] behind one mutex, for callers sharing it across threads.
///
/// Every operation holds the lock for its full duration, including fetches
/// on a miss, so reads never interleave.
#[derive(Debug)]
pub struct SharedFbrCache<S: BlockSource> {
    inner: Mutex<FbrCache<S>>,
}

impl<S: BlockSource> SharedFbrCache<S> {
    pub fn new(config: CacheConfig, source: S) -> Result<Self> {
        Ok(Self::from_cache(FbrCache::new(config, source)?))
    }

    #[must_use]
    pub fn from_cache(cache: FbrCache<S>) -> Self {
        Self {
            inner: Mutex::new(cache),
        }
    }

    pub fn read_data(
        &self,
        fd: FileDescriptor,
        offset: ByteOffset,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.inner.lock().read_data(fd, offset, buf)
    }

    #[must_use]
    pub fn is_block_in_cache(&self, fd: FileDescriptor, index: BlockIndex) -> bool {
        self.inner.lock().is_block_in_cache(fd, index)
    }

    pub fn invalidate_file(&self, fd: FileDescriptor) -> usize {
        self.inner.lock().invalidate_file(fd)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }

    /// Run `f` with exclusive access to the cache.
    pub fn with_cache<R>(&self, f: impl FnOnce(&mut FbrCache<S>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    #[must_use]
    pub fn into_inner(self) -> FbrCache<S> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves `len` bytes per file where byte `i` is `(fd + i) % 251`.
    #[derive(Debug)]
    struct PatternSource {
        len: u64,
        fetches: Mutex<Vec<(FileDescriptor, BlockIndex)>>,
    }

    impl PatternSource {
        fn new(len: u64) -> Self {
            Self {
                len,
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn byte(fd: FileDescriptor, at: u64) -> u8 {
            ((u64::try_from(fd.0).unwrap_or(0) + at) % 251) as u8
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().len()
        }
    }

    impl BlockSource for PatternSource {
        fn fetch_block(
            &self,
            fd: FileDescriptor,
            index: BlockIndex,
            block_size: u32,
        ) -> Result<Vec<u8>> {
            if fd.0 < 0 {
                return Err(FbrError::BadDescriptor(fd.0));
            }
            self.fetches.lock().push((fd, index));
            let start = index.0 * u64::from(block_size);
            let end = (start + u64::from(block_size)).min(self.len);
            Ok((start..end.max(start)).map(|at| Self::byte(fd, at)).collect())
        }
    }

    fn cache(n_old: usize, block_size: u32, n_new: usize, size: usize) -> FbrCache<PatternSource> {
        FbrCache::new(
            CacheConfig::new(n_old, block_size, n_new, size),
            PatternSource::new(1 << 20),
        )
        .expect("cache")
    }

    #[test]
    fn rejects_invalid_config() {
        let err = FbrCache::new(CacheConfig::new(3, 4, 3, 4), PatternSource::new(16))
            .expect_err("invalid");
        assert!(matches!(err, FbrError::InvalidConfig(_)));
    }

    #[test]
    fn read_within_one_block_returns_source_bytes() {
        let mut cache = cache(1, 8, 1, 4);
        let fd = FileDescriptor(2);
        let mut buf = [0_u8; 3];
        assert_eq!(cache.read_data(fd, ByteOffset(9), &mut buf).expect("read"), 3);
        let expected: Vec<u8> = (9..12).map(|at| PatternSource::byte(fd, at)).collect();
        assert_eq!(buf.as_slice(), expected.as_slice());
        assert!(cache.is_block_in_cache(fd, BlockIndex(1)));
        assert!(!cache.is_block_in_cache(fd, BlockIndex(0)));
        cache.check_invariants().expect("invariants");
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let mut cache = cache(1, 8, 1, 4);
        let fd = FileDescriptor(0);
        let mut buf = [0_u8; 8];
        cache.read_data(fd, ByteOffset(0), &mut buf).expect("first");
        cache.read_data(fd, ByteOffset(2), &mut buf[..4]).expect("second");
        assert_eq!(cache.source().fetch_count(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.bytes_read, 12);
    }

    #[test]
    fn empty_read_touches_nothing() {
        let mut cache = cache(1, 8, 1, 4);
        let mut buf = [0_u8; 0];
        assert_eq!(
            cache
                .read_data(FileDescriptor(0), ByteOffset(100), &mut buf)
                .expect("read"),
            0
        );
        assert!(cache.is_empty());
        assert_eq!(cache.source().fetch_count(), 0);
    }

    #[test]
    fn raw_read_reports_errno_on_failure() {
        let mut cache = cache(1, 8, 1, 4);
        let mut buf = [0_u8; 8];
        assert_eq!(cache.read_data_raw(&mut buf, 8, 0, 5), 8);
        assert_eq!(
            cache.read_data_raw(&mut buf, 8, 0, -1),
            -(FbrError::BadDescriptor(-1).to_errno() as isize)
        );
        assert_eq!(
            cache.read_data_raw(&mut buf, 9, 0, 5),
            -(FbrError::InvalidArgument(String::new()).to_errno() as isize)
        );
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[test]
    fn invalidate_file_drops_only_that_file() {
        let mut cache = cache(1, 4, 1, 4);
        let mut buf = [0_u8; 8];
        cache.read_data(FileDescriptor(1), ByteOffset(0), &mut buf).expect("fd1");
        cache.read_data(FileDescriptor(2), ByteOffset(0), &mut buf[..4]).expect("fd2");
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.invalidate_file(FileDescriptor(1)), 2);
        assert_eq!(cache.invalidate_file(FileDescriptor(1)), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_block_in_cache(FileDescriptor(2), BlockIndex(0)));
        cache.check_invariants().expect("invariants");
    }

    #[test]
    fn clear_releases_all_blocks() {
        let mut cache = cache(1, 4, 1, 4);
        let mut buf = [0_u8; 16];
        cache.read_data(FileDescriptor(1), ByteOffset(0), &mut buf).expect("read");
        assert_eq!(cache.len(), 4);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.is_block_in_cache(FileDescriptor(1), BlockIndex(0)));
        cache.check_invariants().expect("invariants");
    }

    #[test]
    fn oversized_block_is_rejected_and_not_admitted() {
        struct Greedy;
        impl BlockSource for Greedy {
            fn fetch_block(
                &self,
                _fd: FileDescriptor,
                _index: BlockIndex,
                block_size: u32,
            ) -> Result<Vec<u8>> {
                Ok(vec![0_u8; block_size as usize + 1])
            }
        }

        let mut cache = FbrCache::new(CacheConfig::new(1, 4, 1, 2), Greedy).expect("cache");
        let mut buf = [0_u8; 4];
        let err = cache
            .read_data(FileDescriptor(0), ByteOffset(0), &mut buf)
            .expect_err("oversized");
        assert!(matches!(err, FbrError::OversizedBlock { len: 5, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn shared_cache_serializes_access() {
        let shared = std::sync::Arc::new(
            SharedFbrCache::new(CacheConfig::new(2, 16, 2, 8), PatternSource::new(4096))
                .expect("cache"),
        );
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let shared = std::sync::Arc::clone(&shared);
                std::thread::spawn(move || {
                    let fd = FileDescriptor(t);
                    let mut buf = [0_u8; 40];
                    for round in 0..20_u64 {
                        let n = shared
                            .read_data(fd, ByteOffset(round * 7), &mut buf)
                            .expect("read");
                        assert_eq!(n, buf.len());
                        assert_eq!(buf[0], PatternSource::byte(fd, round * 7));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        shared.with_cache(|cache| cache.check_invariants().expect("invariants"));
        let stats = shared.stats();
        assert_eq!(stats.bytes_read, 4 * 20 * 40);
        let shared = std::sync::Arc::try_unwrap(shared).expect("sole owner");
        assert!(shared.into_inner().len() <= 8);
    }
}
