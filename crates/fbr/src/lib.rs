#![forbid(unsafe_code)]
//! FBR block cache public API facade.
//!
//! Re-exports the cache, its block and source types, identifiers and errors
//! through one crate for downstream consumers.

pub use fbr_block::{Block, BlockSource, FileTable};
pub use fbr_cache::{CacheConfig, CacheStats, FbrCache, Segment, SegmentLens, SharedFbrCache};
pub use fbr_error::{FbrError, Result};
pub use fbr_types::{BlockIndex, BlockPiece, BlockSpan, ByteOffset, FileDescriptor, RangeError};
