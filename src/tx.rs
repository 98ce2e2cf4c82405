//! Transactions
//!
//! A `Tx` sees one consistent snapshot of the database: the meta page and
//! memory map current when it began.
//!
//! ## Lifecycle
//! ```text
//!            begin
//!              │
//!              ▼
//!          ┌────────┐  commit()   ┌───────────┐
//!          │ Active │────────────►│ Committed │
//!          └────────┘             └───────────┘
//!              │ rollback() / drop
//!              ▼
//!         ┌────────────┐
//!         │ RolledBack │
//!         └────────────┘
//! ```
//! `commit` and `rollback` consume the transaction. Dropping an active
//! transaction rolls it back and releases the writer slot or reader
//! registration.
//!
//! ## Commit Protocol
//! 1. Rebalance nodes touched by deletes
//! 2. Spill nodes to newly allocated pages (children first)
//! 3. Write the free list to a new page
//! 4. Grow the file if the high-water mark moved past its end
//! 5. Write dirty pages, fsync
//! 6. Write the meta page to slot `txid % 2`, fsync
//! 7. Publish the new snapshot (meta, map, free list)
//!
//! A failure before step 7 leaves the previous meta authoritative.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::btree::node::Node;
use crate::btree::Cursor;
use crate::bucket::{Bucket, BucketState, ROOT_BUCKET};
use crate::db::Shared;
use crate::error::{BoltError, Result};
use crate::page::{flags, write_header, FreeList, Meta, PageView, Pgid, TxId};
use crate::storage::mmap_size;

/// Counters collected while a transaction runs and commits
#[derive(Debug, Clone, Default)]
pub struct TxStats {
    /// Pages allocated
    pub page_count: usize,
    /// Bytes allocated
    pub page_alloc: usize,
    /// Pages materialized into nodes
    pub node_count: usize,
    /// Nodes examined by rebalance
    pub rebalance: usize,
    /// Node splits
    pub split: usize,
    /// Nodes written to pages
    pub spill: usize,
    /// Page writes issued at commit (meta included)
    pub write: usize,
    /// Time spent committing
    pub commit_time: Duration,
}

/// Mutable per-transaction state
///
/// Kept behind a `RefCell` so that `Bucket` and `Cursor` handles can share
/// the transaction by reference.
pub(crate) struct TxInner {
    pub txid: TxId,
    pub page_size: usize,
    pub fill_percent: f64,
    /// Meta as of begin; updated during commit
    pub meta: Meta,
    /// Writer's private copy of the free list
    pub freelist: FreeList,
    /// Dirty pages by id, written in order at commit
    pub pages: BTreeMap<Pgid, Vec<u8>>,
    /// Node arena
    pub nodes: Vec<Node>,
    /// Opened buckets; index 0 is the root bucket
    pub buckets: Vec<BucketState>,
    pub stats: TxStats,
}

/// A read-only or read-write transaction
pub struct Tx {
    shared: Arc<Shared>,
    /// Map this snapshot reads from
    mmap: Arc<Mmap>,
    id: TxId,
    writable: bool,
    committed: bool,
    pub(crate) inner: RefCell<TxInner>,
}

impl Tx {
    pub(crate) fn new(
        shared: Arc<Shared>,
        meta: Meta,
        mmap: Arc<Mmap>,
        freelist: FreeList,
        writable: bool,
    ) -> Self {
        let id = if writable { meta.txid + 1 } else { meta.txid };
        let inner = TxInner {
            txid: id,
            page_size: shared.page_size,
            fill_percent: shared.options.fill_percent,
            meta,
            freelist,
            pages: BTreeMap::new(),
            nodes: Vec::new(),
            buckets: vec![BucketState::root(meta.root)],
            stats: TxStats::default(),
        };

        Self {
            shared,
            mmap,
            id,
            writable,
            committed: false,
            inner: RefCell::new(inner),
        }
    }

    /// Transaction id (a writer gets the id its commit will carry)
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Size of the database as seen by this transaction, in bytes
    pub fn size(&self) -> u64 {
        self.inner.borrow().meta.pgid * self.shared.page_size as u64
    }

    pub fn stats(&self) -> TxStats {
        self.inner.borrow().stats.clone()
    }

    pub(crate) fn view(&self) -> PageView<'_> {
        PageView::new(&self.mmap[..], self.shared.page_size)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(BoltError::TxNotWritable);
        }
        Ok(())
    }

    fn root(&self) -> Bucket<'_> {
        Bucket::new(self, ROOT_BUCKET)
    }

    // =========================================================================
    // Top-level Buckets
    // =========================================================================

    /// Open a top-level bucket
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().bucket(name)
    }

    /// Create a top-level bucket; fails with `BucketExists` if present
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root().create_bucket_if_not_exists(name)
    }

    /// Delete a top-level bucket and everything nested in it
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root().delete_bucket(name)
    }

    /// Call `f` for every top-level bucket, in name order
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Bucket<'_>) -> Result<()>,
    {
        let names = {
            let view = self.view();
            self.inner.borrow().bucket_names(ROOT_BUCKET, &view)?
        };
        for name in names {
            let bucket = self.bucket(&name)?;
            f(&name, bucket)?;
        }
        Ok(())
    }

    /// Cursor over the top-level bucket names
    pub fn cursor(&self) -> Cursor<'_> {
        self.root().cursor()
    }

    // =========================================================================
    // Commit / Rollback
    // =========================================================================

    /// Write all changes to disk and publish them to new transactions
    ///
    /// On error nothing is published and the transaction is rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_writable()?;
        self.write_commit()?;
        self.committed = true;
        Ok(())
    }

    /// Discard the transaction
    pub fn rollback(self) {
        drop(self);
    }

    fn write_commit(&self) -> Result<()> {
        let start = Instant::now();
        let shared = &self.shared;
        let page_size = shared.page_size;
        let view = self.view();
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        inner.rebalance_bucket(ROOT_BUCKET, &view)?;
        inner.spill_bucket(ROOT_BUCKET, &view)?;
        inner.meta.root = inner.buckets[ROOT_BUCKET].header;

        let old_freelist = inner.meta.freelist;
        inner.free(old_freelist, &view)?;
        let count = inner.freelist.size().div_ceil(page_size);
        let freelist_pgid = inner.allocate(count)?;
        let buf = inner.pages.get_mut(&freelist_pgid).ok_or_else(|| {
            BoltError::Corrupted(format!("allocated page {} has no buffer", freelist_pgid))
        })?;
        inner.freelist.write(freelist_pgid, (count - 1) as u32, buf);
        inner.meta.freelist = freelist_pgid;

        let required = inner.meta.pgid * page_size as u64;
        let file_len = shared.file.len()?;
        if required > file_len {
            let size = mmap_size(required, page_size)?;
            shared.file.grow(size, !shared.options.no_grow_sync)?;
            debug!(from = file_len, to = size, "grew database file");
        }

        for (&pgid, buf) in &inner.pages {
            shared.file.write_at(pgid * page_size as u64, buf)?;
        }
        inner.stats.write += inner.pages.len();
        if !shared.options.no_sync {
            shared.file.sync()?;
        }

        inner.meta.txid = inner.txid;
        let mut meta_page = vec![0u8; page_size];
        inner.meta.write_page(&mut meta_page);
        shared
            .file
            .write_at(inner.meta.slot() * page_size as u64, &meta_page)?;
        inner.stats.write += 1;
        if !shared.options.no_sync {
            shared.file.sync()?;
        }

        let mmap = if required > self.mmap.len() as u64 {
            let len = shared.file.len()?;
            debug!(len, "remapped database file");
            Some(shared.file.map(len)?)
        } else {
            None
        };

        inner.stats.commit_time = start.elapsed();
        let freelist = std::mem::take(&mut inner.freelist);
        shared.publish(inner.meta, mmap, freelist);

        debug!(
            txid = inner.txid,
            pages = inner.stats.page_count,
            splits = inner.stats.split,
            rebalances = inner.stats.rebalance,
            writes = inner.stats.write,
            elapsed_us = inner.stats.commit_time.as_micros() as u64,
            "committed transaction"
        );
        Ok(())
    }

    // =========================================================================
    // Backup
    // =========================================================================

    /// Write a consistent copy of this snapshot as a database file
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let page_size = self.shared.page_size;
        let meta = self.inner.borrow().meta;

        let mut page = vec![0u8; page_size];
        for slot in 0..2 {
            page.fill(0);
            let mut copy = meta;
            copy.write_page(&mut page);
            write_header(&mut page, slot, flags::META, 0, 0);
            w.write_all(&page)?;
        }

        let end = meta.pgid as usize * page_size;
        let data = self.mmap.get(2 * page_size..end).ok_or_else(|| {
            BoltError::Corrupted(format!(
                "high-water mark {} is beyond the mapped file",
                meta.pgid
            ))
        })?;
        w.write_all(data)?;

        Ok(end as u64)
    }

    /// Write a consistent copy of this snapshot to `path`
    pub fn copy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        let bytes = self.write_to(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(path = %path.as_ref().display(), bytes, "copied snapshot");
        Ok(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.writable {
            if !self.committed {
                trace!(txid = self.id, "rolled back transaction");
            }
            self.shared.end_write(self.committed);
        } else {
            self.shared.end_read(self.id);
        }
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("writable", &self.writable)
            .finish()
    }
}
