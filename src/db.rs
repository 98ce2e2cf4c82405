//! Database handle
//!
//! Opens the file, recovers the latest committed meta page and hands out
//! transactions.
//!
//! ## Concurrency Model: Single-Writer / Multiple-Reader (MVCC)
//!
//! - **Writer**: at most one read-write transaction at a time, serialized by
//!   the writer slot (`Mutex<bool>` + `Condvar`, bounded by
//!   `write_lock_timeout`)
//! - **Readers**: any number, never blocked. Each pins the snapshot
//!   `(meta, Arc<Mmap>)` current at begin and registers its txid
//! - **Reclamation**: pages freed by transaction `w` are reused only once no
//!   registered reader is older than `w`
//!
//! ```text
//!  begin(false) ──► state.read() ──► clone (meta, mmap) ──► register txid
//!  begin(true)  ──► writer slot  ──► clone (meta, mmap, freelist)
//!  commit       ──► write pages + meta ──► publish: state.write(), freelist
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use memmap2::Mmap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{BoltError, Result};
use crate::page::{
    flags, write_header, FreeList, Meta, PageView, TxId, MAX_PAGE_SIZE, META_SIZE, MIN_PAGE_SIZE,
    PAGE_HEADER_SIZE,
};
use crate::storage::{mmap_size, DbFile};
use crate::tx::Tx;

/// Committed state new transactions start from
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub meta: Meta,
    pub mmap: Arc<Mmap>,
}

/// Database-wide counters
#[derive(Default)]
struct Counters {
    read_txs: AtomicU64,
    write_txs: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// State shared by the `Db` handle and every open transaction
pub(crate) struct Shared {
    pub options: Options,
    /// Page size recorded in the file
    pub page_size: usize,
    pub file: DbFile,
    state: RwLock<Snapshot>,
    /// Free list as of the last commit
    freelist: Mutex<FreeList>,
    /// Open readers: txid -> count
    readers: Mutex<BTreeMap<TxId, usize>>,
    /// Writer slot
    writer: Mutex<bool>,
    writer_released: Condvar,
    closed: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn acquire_writer(&self) -> Result<()> {
        let deadline = self.options.write_lock_timeout.map(|t| Instant::now() + t);
        let mut busy = self.writer.lock();
        while *busy {
            match deadline {
                Some(deadline) => {
                    let result = self.writer_released.wait_until(&mut busy, deadline);
                    if result.timed_out() && *busy {
                        return Err(BoltError::LockTimeout("writer"));
                    }
                }
                None => self.writer_released.wait(&mut busy),
            }
        }
        *busy = true;
        Ok(())
    }

    fn release_writer(&self) {
        let mut busy = self.writer.lock();
        *busy = false;
        // `close` waits on the same condvar as queued writers.
        self.writer_released.notify_all();
    }

    /// Called when a write transaction ends
    pub(crate) fn end_write(&self, committed: bool) {
        if committed {
            self.counters.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.release_writer();
    }

    /// Called when a read transaction ends
    pub(crate) fn end_read(&self, txid: TxId) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&txid) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&txid);
            }
        }
    }

    /// Make a committed transaction visible to new transactions
    pub(crate) fn publish(&self, meta: Meta, mmap: Option<Arc<Mmap>>, freelist: FreeList) {
        *self.freelist.lock() = freelist;
        let mut state = self.state.write();
        state.meta = meta;
        if let Some(mmap) = mmap {
            state.mmap = mmap;
        }
    }
}

/// Point-in-time database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Read transactions started
    pub read_txs: u64,
    /// Write transactions started
    pub write_txs: u64,
    pub commits: u64,
    pub rollbacks: u64,
    /// Read transactions currently open
    pub open_read_txs: usize,
    /// Pages available for reuse
    pub free_pages: usize,
    /// Freed pages still visible to open readers
    pub pending_pages: usize,
    /// Id of the last committed transaction
    pub txid: TxId,
    /// High-water mark (pages in use or free)
    pub page_count: u64,
    pub page_size: usize,
}

/// An open database file
///
/// `Db` is `Send + Sync`; share it by reference or wrap it in an `Arc`.
pub struct Db {
    path: PathBuf,
    shared: Arc<Shared>,
}

impl Db {
    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Open a database file, creating and initializing it if it is empty
    ///
    /// On open:
    /// 1. Validate options, take the advisory file lock
    /// 2. Initialize the four bootstrap pages for a new file
    /// 3. Load both meta pages; the valid one with the higher txid wins
    /// 4. Load the free list and map the file
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();

        let file = DbFile::open(path, options.read_only, options.timeout)?;
        if file.is_empty()? {
            if options.read_only {
                return Err(BoltError::InvalidDatabase(format!(
                    "{} is empty and opened read-only",
                    path.display()
                )));
            }
            Self::init(&file, options.page_size)?;
            debug!(path = %path.display(), page_size = options.page_size, "initialized new database");
        }

        let len = file.len()?;
        let mmap = file.map(len)?;
        let (meta, page_size) = Self::load_meta(&mmap, options.page_size)?;
        if meta.pgid * page_size as u64 > len {
            return Err(BoltError::Corrupted(format!(
                "high-water mark {} is beyond the end of the file ({} bytes)",
                meta.pgid, len
            )));
        }

        let freelist = {
            let view = PageView::new(&mmap[..], page_size);
            FreeList::read(&view.page(meta.freelist)?)?
        };

        let mmap = if !options.read_only && options.initial_mmap_size as u64 > len {
            let size = mmap_size(options.initial_mmap_size as u64, page_size)?;
            file.grow(size, !options.no_grow_sync)?;
            drop(mmap);
            file.map(size)?
        } else {
            mmap
        };

        info!(
            path = %path.display(),
            page_size,
            txid = meta.txid,
            pages = meta.pgid,
            free_pages = freelist.free_count(),
            read_only = options.read_only,
            "opened database"
        );

        let shared = Shared {
            options,
            page_size,
            file,
            state: RwLock::new(Snapshot { meta, mmap }),
            freelist: Mutex::new(freelist),
            readers: Mutex::new(BTreeMap::new()),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            shared: Arc::new(shared),
        })
    }

    /// Open with default options
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, Options::default())
    }

    /// Write the bootstrap pages: two metas, an empty free list, an empty root leaf
    fn init(file: &DbFile, page_size: usize) -> Result<()> {
        let mut buf = vec![0u8; page_size * 4];

        for (slot, chunk) in buf.chunks_mut(page_size).take(2).enumerate() {
            let mut meta = Meta::new(page_size, slot as TxId, 2, 3, 4);
            meta.write_page(chunk);
        }
        FreeList::new().write(2, 0, &mut buf[page_size * 2..page_size * 3]);
        write_header(&mut buf[page_size * 3..], 3, flags::LEAF, 0, 0);

        file.write_at(0, &buf)?;
        file.sync()?;
        Ok(())
    }

    /// Pick the newest valid meta page
    fn load_meta(data: &[u8], default_page_size: usize) -> Result<(Meta, usize)> {
        let first = Meta::decode(data)?;
        let first_ok = first.validate().and_then(|_| Self::check_page_size(&first));

        // Locate meta 1 with the page size meta 0 claims, if it can be trusted.
        let page_size = match &first_ok {
            Ok(()) => first.page_size as usize,
            Err(e) => {
                warn!(error = %e, "meta page 0 failed validation");
                default_page_size
            }
        };

        let second = data
            .get(page_size..page_size + PAGE_HEADER_SIZE + META_SIZE)
            .ok_or_else(|| BoltError::InvalidDatabase("file too small for two meta pages".to_string()))
            .and_then(Meta::decode);
        let second_ok = match &second {
            Ok(meta) => meta.validate().and_then(|_| Self::check_page_size(meta)),
            Err(e) => Err(BoltError::InvalidDatabase(e.to_string())),
        };
        if let Err(e) = &second_ok {
            warn!(error = %e, "meta page 1 failed validation");
        }

        let meta = match (first_ok, second, second_ok) {
            (Ok(()), Ok(second), Ok(())) => {
                if second.txid > first.txid {
                    second
                } else {
                    first
                }
            }
            (Ok(()), _, _) => first,
            (Err(_), Ok(second), Ok(())) => second,
            (Err(e), _, second_err) => {
                // A wrong magic or version on page 0 means this is not our file.
                return Err(match (e, second_err) {
                    (e @ BoltError::InvalidDatabase(_), Err(BoltError::InvalidDatabase(_)))
                    | (e @ BoltError::VersionMismatch { .. }, _) => e,
                    _ => BoltError::CorruptMeta,
                });
            }
        };

        Ok((meta, meta.page_size as usize))
    }

    fn check_page_size(meta: &Meta) -> Result<()> {
        let size = meta.page_size as usize;
        if !size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
            return Err(BoltError::InvalidDatabase(format!("invalid page size {}", size)));
        }
        Ok(())
    }

    /// Close the database
    ///
    /// Waits for an active write transaction to finish and releases the file
    /// lock. Read transactions still open keep their snapshot readable; new
    /// transactions fail with `DatabaseNotOpen`. Must not be called from a
    /// thread holding the write transaction.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut busy = self.shared.writer.lock();
            while *busy {
                self.shared.writer_released.wait(&mut busy);
            }
        }
        self.shared.file.unlock()?;
        info!(path = %self.path.display(), "closed database");
        Ok(())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction
    ///
    /// A read-write transaction waits for the writer slot (up to
    /// `write_lock_timeout`). A read-only one never blocks.
    pub fn begin(&self, writable: bool) -> Result<Tx> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BoltError::DatabaseNotOpen);
        }
        if writable {
            self.begin_write()
        } else {
            self.begin_read()
        }
    }

    fn begin_read(&self) -> Result<Tx> {
        let snapshot = {
            let state = self.shared.state.read();
            *self.shared.readers.lock().entry(state.meta.txid).or_insert(0) += 1;
            state.clone()
        };
        self.shared.counters.read_txs.fetch_add(1, Ordering::Relaxed);

        Ok(Tx::new(
            Arc::clone(&self.shared),
            snapshot.meta,
            snapshot.mmap,
            FreeList::new(),
            false,
        ))
    }

    fn begin_write(&self) -> Result<Tx> {
        if self.shared.options.read_only {
            return Err(BoltError::DatabaseReadOnly);
        }
        self.shared.acquire_writer()?;
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.release_writer();
            return Err(BoltError::DatabaseNotOpen);
        }

        let snapshot = self.shared.state.read().clone();
        let mut freelist = self.shared.freelist.lock().clone();

        // Pages freed at or before the oldest open snapshot are safe to reuse.
        let oldest = self
            .shared
            .readers
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(snapshot.meta.txid);
        freelist.release(oldest.min(snapshot.meta.txid));

        self.shared.counters.write_txs.fetch_add(1, Ordering::Relaxed);
        Ok(Tx::new(
            Arc::clone(&self.shared),
            snapshot.meta,
            snapshot.mmap,
            freelist,
            true,
        ))
    }

    /// Run `f` in a read-write transaction
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise.
    pub fn update<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx) -> std::result::Result<T, E>,
        E: From<BoltError>,
    {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Run `f` in a read-only transaction
    pub fn view<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx) -> std::result::Result<T, E>,
        E: From<BoltError>,
    {
        let tx = self.begin(false)?;
        let result = f(&tx);
        tx.rollback();
        result
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Page size recorded in the file
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.options.read_only
    }

    pub fn stats(&self) -> Stats {
        let counters = &self.shared.counters;
        let meta = self.shared.state.read().meta;
        let freelist = self.shared.freelist.lock();
        Stats {
            read_txs: counters.read_txs.load(Ordering::Relaxed),
            write_txs: counters.write_txs.load(Ordering::Relaxed),
            commits: counters.commits.load(Ordering::Relaxed),
            rollbacks: counters.rollbacks.load(Ordering::Relaxed),
            open_read_txs: self.shared.readers.lock().values().sum(),
            free_pages: freelist.free_count(),
            pending_pages: freelist.pending_count(),
            txid: meta.txid,
            page_count: meta.pgid,
            page_size: self.shared.page_size,
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("page_size", &self.shared.page_size)
            .finish()
    }
}
