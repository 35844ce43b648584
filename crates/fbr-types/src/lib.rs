#![forbid(unsafe_code)]
//! Unit-carrying identifiers shared by the block and cache layers, plus the
//! arithmetic that maps a byte range onto the blocks it touches.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of an open file, as handed out by the storage adapter.
///
/// The cache never owns the underlying resource; it only uses the value as
/// a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileDescriptor(pub i32);

/// Position of a block within its file, in units of the cache block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

/// Byte offset into a logical file (pread semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl BlockIndex {
    /// Byte offset of the first byte of this block, or `None` on overflow.
    #[must_use]
    pub fn byte_offset(self, block_size: u32) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(block_size)).map(ByteOffset)
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("byte range overflows: offset={offset} len={len}")]
    Overflow { offset: u64, len: u64 },
}

/// The aligned blocks covered by a byte range `[offset, offset + len)`.
///
/// Invariant: `offset < end`; empty ranges are never represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    offset: u64,
    end: u64,
    block_size: u64,
}

/// The part of one block a span wants, and where it lands in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPiece {
    pub index: BlockIndex,
    /// First wanted byte, relative to the start of the block.
    pub start: usize,
    /// Number of wanted bytes; `start + len <= block_size`.
    pub len: usize,
    /// Destination offset, relative to the start of the range.
    pub dest: usize,
}

impl BlockSpan {
    /// Decompose `[offset, offset + len)` into block-sized pieces.
    ///
    /// Returns `Ok(None)` for an empty range.
    pub fn new(offset: ByteOffset, len: usize, block_size: u32) -> Result<Option<Self>, RangeError> {
        if block_size == 0 {
            return Err(RangeError::ZeroBlockSize);
        }
        if len == 0 {
            return Ok(None);
        }
        let len_u64 = u64::try_from(len).map_err(|_| RangeError::Overflow {
            offset: offset.0,
            len: u64::MAX,
        })?;
        let end = offset
            .checked_add(len_u64)
            .ok_or(RangeError::Overflow {
                offset: offset.0,
                len: len_u64,
            })?
            .0;
        Ok(Some(Self {
            offset: offset.0,
            end,
            block_size: u64::from(block_size),
        }))
    }

    #[must_use]
    pub fn first_block(&self) -> BlockIndex {
        BlockIndex(self.offset / self.block_size)
    }

    #[must_use]
    pub fn last_block(&self) -> BlockIndex {
        BlockIndex((self.end - 1) / self.block_size)
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.last_block().0 - self.first_block().0 + 1
    }

    /// Pieces in ascending block order.
    ///
    /// Every length and offset yielded is bounded by the block size or by the
    /// range length, both of which fit in `usize`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pieces(&self) -> impl Iterator<Item = BlockPiece> + '_ {
        (self.first_block().0..=self.last_block().0).map(move |index| {
            let block_start = index * self.block_size;
            let block_end = block_start.saturating_add(self.block_size);
            let from = block_start.max(self.offset);
            let to = block_end.min(self.end);
            BlockPiece {
                index: BlockIndex(index),
                start: (from - block_start) as usize,
                len: (to - from) as usize,
                dest: (from - self.offset) as usize,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_range_has_no_span() {
        assert_eq!(BlockSpan::new(ByteOffset(17), 0, 4).expect("span"), None);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert_eq!(
            BlockSpan::new(ByteOffset(0), 1, 0),
            Err(RangeError::ZeroBlockSize)
        );
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let err = BlockSpan::new(ByteOffset(u64::MAX - 1), 4, 4).expect_err("overflow");
        assert!(matches!(err, RangeError::Overflow { .. }));
    }

    #[test]
    fn range_inside_one_block() {
        let span = BlockSpan::new(ByteOffset(5), 2, 4).expect("span").expect("non-empty");
        assert_eq!(span.first_block(), BlockIndex(1));
        assert_eq!(span.last_block(), BlockIndex(1));
        let pieces: Vec<_> = span.pieces().collect();
        assert_eq!(
            pieces,
            vec![BlockPiece {
                index: BlockIndex(1),
                start: 1,
                len: 2,
                dest: 0,
            }]
        );
    }

    #[test]
    fn range_straddling_two_blocks() {
        let span = BlockSpan::new(ByteOffset(2), 4, 4).expect("span").expect("non-empty");
        let pieces: Vec<_> = span.pieces().collect();
        assert_eq!(span.block_count(), 2);
        assert_eq!(
            pieces,
            vec![
                BlockPiece {
                    index: BlockIndex(0),
                    start: 2,
                    len: 2,
                    dest: 0,
                },
                BlockPiece {
                    index: BlockIndex(1),
                    start: 0,
                    len: 2,
                    dest: 2,
                },
            ]
        );
    }

    #[test]
    fn block_byte_offset_detects_overflow() {
        assert_eq!(BlockIndex(3).byte_offset(4096), Some(ByteOffset(12_288)));
        assert_eq!(BlockIndex(u64::MAX).byte_offset(2), None);
    }

    #[test]
    fn byte_offset_add_detects_overflow() {
        assert_eq!(ByteOffset(0).checked_add(512), Some(ByteOffset(512)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn pieces_tile_the_range_exactly(
            offset in 0_u64..10_000,
            len in 1_usize..5_000,
            block_size in 1_u32..700,
        ) {
            let span = BlockSpan::new(ByteOffset(offset), len, block_size)
                .expect("span")
                .expect("non-empty");
            let mut expected_dest = 0_usize;
            let mut last_index = None;
            for piece in span.pieces() {
                prop_assert_eq!(piece.dest, expected_dest);
                prop_assert!(piece.len > 0);
                prop_assert!(piece.start + piece.len <= block_size as usize);
                if let Some(prev) = last_index {
                    prop_assert_eq!(piece.index.0, prev + 1);
                    prop_assert_eq!(piece.start, 0);
                }
                last_index = Some(piece.index.0);
                expected_dest += piece.len;
            }
            prop_assert_eq!(expected_dest, len);
            prop_assert_eq!(last_index, Some(span.last_block().0));
        }
    }
}
