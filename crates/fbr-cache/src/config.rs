//! Cache sizing.

use fbr_error::{FbrError, Result};
use serde::{Deserialize, Serialize};

/// Fixed configuration of an [`FbrCache`](crate::FbrCache).
///
/// Sizes are in blocks except `block_size`, which is in bytes. The Middle
/// segment absorbs whatever New and Old do not, so
/// `n_old_blk + n_new_blk <= cache_size` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum size of the Old segment (eviction candidates).
    pub n_old_blk: usize,
    /// Bytes per block; drives the offset to block-index mapping.
    pub block_size: u32,
    /// Maximum size of the New segment (uncredited recent blocks).
    pub n_new_blk: usize,
    /// Maximum number of resident blocks.
    pub cache_size: usize,
}

impl CacheConfig {
    #[must_use]
    pub fn new(n_old_blk: usize, block_size: u32, n_new_blk: usize, cache_size: usize) -> Self {
        Self {
            n_old_blk,
            block_size,
            n_new_blk,
            cache_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(FbrError::InvalidConfig("block_size must be > 0".to_owned()));
        }
        if self.cache_size == 0 {
            return Err(FbrError::InvalidConfig("cache_size must be > 0".to_owned()));
        }
        let reserved = self.n_old_blk.checked_add(self.n_new_blk).ok_or_else(|| {
            FbrError::InvalidConfig("n_old_blk + n_new_blk overflows".to_owned())
        })?;
        if reserved > self.cache_size {
            return Err(FbrError::InvalidConfig(format!(
                "n_old_blk={} + n_new_blk={} exceeds cache_size={}",
                self.n_old_blk, self.n_new_blk, self.cache_size
            )));
        }
        Ok(())
    }

    /// Blocks left over for the Middle segment once New and Old are full.
    #[must_use]
    pub fn n_middle_max(&self) -> usize {
        self.cache_size
            .saturating_sub(self.n_old_blk)
            .saturating_sub(self.n_new_blk)
    }
}
