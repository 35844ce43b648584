#![forbid(unsafe_code)]
//! Error types for the FBR block cache.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Surfaced by |
//! |-------|----------|-------------|
//! | Configuration | `InvalidConfig` | `CacheConfig::validate`, `FbrCache::new` |
//! | Fetch failure | `Io`, `BadDescriptor`, `Fetch`, `OversizedBlock` | `BlockSource::fetch_block`, `FbrCache::read_data` |
//! | Request | `InvalidArgument`, `RangeOverflow` | `FbrCache::read_data`, `FbrCache::read_data_raw` |
//! | Internal | `Invariant` | `FbrCache::check_invariants` |
//!
//! A short read (the source returning fewer bytes than a full block at end of
//! file) is not an error. It is reported as a smaller byte count.
//!
//! `fbr-error` does not depend on `fbr-types`: descriptors and block indices
//! are carried as their raw integers so that every crate can depend on this
//! one without cycles. `RangeError` from `fbr-types` is converted into
//! `RangeOverflow` inside `fbr-cache`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `BadDescriptor` | `EBADF` |
//! | `Fetch` | `EIO` |
//! | `OversizedBlock` | `EIO` |
//! | `InvalidConfig` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `RangeOverflow` | `EOVERFLOW` |
//! | `Invariant` | `EIO` |

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum FbrError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage source does not know this descriptor.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(i32),

    /// The storage source could not supply a block.
    #[error("fetch failed for fd {fd} block {block}: {detail}")]
    Fetch { fd: i32, block: u64, detail: String },

    /// The storage source returned more than one block of bytes.
    #[error("source returned {len} bytes for fd {fd} block {block}, block size is {block_size}")]
    OversizedBlock {
        fd: i32,
        block: u64,
        len: usize,
        block_size: u32,
    },

    /// Cache configuration violates a capacity or segment-size constraint.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// A read request is malformed (e.g. size larger than the buffer).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Offset or length arithmetic overflowed.
    #[error("range overflow: {0}")]
    RangeOverflow(String),

    /// Internal bookkeeping disagreement.
    #[error("cache invariant violated: {0}")]
    Invariant(String),
}

impl FbrError {
    /// Convert this error into a POSIX errno, for callers exposing a
    /// `read(2)`-shaped interface.
    ///
    /// The mapping is exhaustive so adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadDescriptor(_) => libc::EBADF,
            Self::Fetch { .. } | Self::OversizedBlock { .. } | Self::Invariant(_) => libc::EIO,
            Self::InvalidConfig(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::RangeOverflow(_) => libc::EOVERFLOW,
        }
    }
}

/// Result alias using `FbrError`.
pub type Result<T> = std::result::Result<T, FbrError>;
