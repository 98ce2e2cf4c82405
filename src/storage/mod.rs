//! Storage Module
//!
//! The single database file: locking, positional writes, growth and the
//! memory-mapped read view.
//!
//! ## Responsibilities
//! - Advisory file lock (exclusive for writers, shared for read-only opens)
//! - Grow the file ahead of page allocation
//! - Map the file read-only; snapshots hold an `Arc` to the map they began on
//! - Flush dirty pages and meta pages with positional writes + fsync
//!
//! ## File Layout
//! ```text
//! ┌────────┬────────┬──────────┬───────────┬─────────────────────┐
//! │ Meta 0 │ Meta 1 │ Freelist │ Root leaf │ ... B+tree pages ...│
//! │ page 0 │ page 1 │ page 2*  │ page 3*   │                     │
//! └────────┴────────┴──────────┴───────────┴─────────────────────┘
//!   (* initial placement; later commits write them elsewhere)
//! ```

mod file;

pub use file::DbFile;

use crate::error::{BoltError, Result};

/// Smallest growth step (32 KB)
const MIN_MMAP_SIZE: u64 = 1 << 15;

/// Size after which growth switches from doubling to fixed steps (1 GB)
const MAX_MMAP_STEP: u64 = 1 << 30;

/// Largest supported map
pub const MAX_MMAP_SIZE: u64 = 0xFFFF_FFFF_FFFF;

/// Size the file/map should have to hold `size` bytes
///
/// Doubles from 32 KB up to 1 GB, then grows in 1 GB steps.
/// The result is always a multiple of the page size.
pub fn mmap_size(size: u64, page_size: usize) -> Result<u64> {
    let page_size = page_size as u64;

    let mut target = MIN_MMAP_SIZE;
    while target < size && target < MAX_MMAP_STEP {
        target <<= 1;
    }

    if size > target {
        if size > MAX_MMAP_SIZE {
            return Err(BoltError::OutOfSpace(format!(
                "requested map size {} exceeds maximum {}",
                size, MAX_MMAP_SIZE
            )));
        }
        target = size.div_ceil(MAX_MMAP_STEP) * MAX_MMAP_STEP;
    }

    Ok(target.div_ceil(page_size) * page_size)
}
