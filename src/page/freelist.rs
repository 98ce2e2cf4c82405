//! Free-list
//!
//! Tracks pages that can be reused by future allocations.
//!
//! Pages freed by a write transaction are *pending* until no open reader can
//! still observe them; `release` moves them to the free set once the oldest
//! reader is at least as new as the freeing transaction.
//!
//! ## Page Format
//! ```text
//! ┌────────────────────────────┬───────────────────────────────┐
//! │ Header (count = n, or      │ [Pgid: u64] * n               │
//! │  0xFFFF with real n in the │ (free and pending ids, sorted)│
//! │  first u64 slot)           │                               │
//! └────────────────────────────┴───────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::error::{BoltError, Result};

use super::{flags, read_u64, write_header, write_u64, Page, Pgid, TxId, PAGE_HEADER_SIZE};

/// Count value signalling that the real count lives in the first slot
const COUNT_OVERFLOW: usize = 0xFFFF;

/// Free and pending page ids
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    /// Sorted ids available for allocation
    ids: Vec<Pgid>,
    /// Ids freed by a transaction, keyed by that transaction
    pending: BTreeMap<TxId, Vec<Pgid>>,
    /// Every id in `ids` or `pending`
    cache: HashSet<Pgid>,
}

impl FreeList {
    /// Create an empty free list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages available for allocation
    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of pages waiting on open readers
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Free plus pending
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// True if the page is free or pending
    pub fn is_free(&self, id: Pgid) -> bool {
        self.cache.contains(&id)
    }

    /// Take `n` contiguous free pages, returning the first id
    pub fn allocate(&mut self, n: usize) -> Option<Pgid> {
        if n == 0 || self.ids.len() < n {
            return None;
        }

        let mut run_start = 0usize;
        for i in 0..self.ids.len() {
            if i > 0 && self.ids[i] != self.ids[i - 1] + 1 {
                run_start = i;
            }
            if i + 1 - run_start == n {
                let first = self.ids[run_start];
                for id in self.ids.drain(run_start..=i) {
                    self.cache.remove(&id);
                }
                return Some(first);
            }
        }

        None
    }

    /// Mark a page and its overflow pages as freed by `txid`
    pub fn free(&mut self, txid: TxId, id: Pgid, overflow: u32) -> Result<()> {
        if id <= 1 {
            return Err(BoltError::Corrupted(format!("cannot free meta page {}", id)));
        }

        let pending = self.pending.entry(txid).or_default();
        for page in id..=id + overflow as u64 {
            if !self.cache.insert(page) {
                return Err(BoltError::Corrupted(format!("page {} already freed", page)));
            }
            pending.push(page);
        }
        Ok(())
    }

    /// Move pending pages freed by transactions `<= txid` into the free set
    pub fn release(&mut self, txid: TxId) {
        let still_pending = self.pending.split_off(&(txid.saturating_add(1)));
        let released = std::mem::replace(&mut self.pending, still_pending);
        let mut added = false;
        for ids in released.into_values() {
            self.ids.extend(ids);
            added = true;
        }
        if added {
            self.ids.sort_unstable();
        }
    }

    /// Forget pages freed by `txid` (used when it does not commit)
    pub fn rollback(&mut self, txid: TxId) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// All free and pending ids, sorted
    pub fn all_ids(&self) -> Vec<Pgid> {
        let mut all: Vec<Pgid> = self.ids.clone();
        for ids in self.pending.values() {
            all.extend_from_slice(ids);
        }
        all.sort_unstable();
        all
    }

    /// Bytes needed to persist this free list (header included)
    pub fn size(&self) -> usize {
        let mut n = self.count();
        if n >= COUNT_OVERFLOW {
            n += 1;
        }
        PAGE_HEADER_SIZE + n * 8
    }

    /// Load a free list from its page. Every stored id becomes free.
    pub fn read(page: &Page<'_>) -> Result<Self> {
        if page.flags() & flags::FREELIST == 0 {
            return Err(BoltError::Corrupted(format!(
                "page {} is not a free-list page (flags 0x{:02x})",
                page.id(),
                page.flags()
            )));
        }

        let data = page.data();
        let (mut offset, count) = match page.count() {
            COUNT_OVERFLOW if data.len() >= 8 => (8, read_u64(data, 0) as usize),
            COUNT_OVERFLOW => (8, usize::MAX),
            n => (0, n),
        };
        let fits = count
            .checked_mul(8)
            .and_then(|len| len.checked_add(offset))
            .is_some_and(|end| end <= data.len());
        if !fits {
            return Err(BoltError::Corrupted(format!(
                "page {}: free list of {} ids does not fit in the page",
                page.id(),
                count
            )));
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(read_u64(data, offset));
            offset += 8;
        }
        ids.sort_unstable();

        let cache = ids.iter().copied().collect();
        Ok(Self {
            ids,
            pending: BTreeMap::new(),
            cache,
        })
    }

    /// Write the free list into a page buffer sized by `size()`
    pub fn write(&self, id: Pgid, overflow: u32, buf: &mut [u8]) {
        let all = self.all_ids();
        let mut offset = PAGE_HEADER_SIZE;

        if all.len() >= COUNT_OVERFLOW {
            write_header(buf, id, flags::FREELIST, COUNT_OVERFLOW as u16, overflow);
            write_u64(buf, offset, all.len() as u64);
            offset += 8;
        } else {
            write_header(buf, id, flags::FREELIST, all.len() as u16, overflow);
        }

        for pgid in all {
            write_u64(buf, offset, pgid);
            offset += 8;
        }
    }
}
