//! Database file handle
//!
//! Wraps the OS file with locking, positional writes and memory mapping.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;

use crate::error::{BoltError, Result};

/// Interval between advisory lock attempts
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// The open database file
///
/// ## Concurrency:
/// - `file`: Mutex serializes seek+write pairs (only the writer writes)
/// - Readers never touch the file directly; they read through an `Arc<Mmap>`
pub struct DbFile {
    /// Path the file was opened from
    path: PathBuf,

    /// File handle (holds the advisory lock for its lifetime)
    file: Mutex<File>,

    /// Opened without write access
    read_only: bool,
}

impl DbFile {
    /// Open (or create) the file and take the advisory lock
    ///
    /// Read-write opens take an exclusive lock, read-only opens a shared one.
    /// Fails with `LockTimeout` if the lock is still held after `timeout`.
    pub fn open(path: &Path, read_only: bool, timeout: Option<Duration>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;

        Self::lock(&file, !read_only, timeout)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            read_only,
        })
    }

    /// Poll the advisory lock until it is granted or the timeout passes
    fn lock(file: &File, exclusive: bool, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let contended = fs2::lock_contended_error();

        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(file)
            } else {
                FileExt::try_lock_shared(file)
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == contended.raw_os_error() =>
                {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(BoltError::LockTimeout("file"));
                        }
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current file length in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// True if the file holds no bytes yet
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Write `buf` at byte offset `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Extend the file to `size` bytes
    ///
    /// Any failure here is reported as `OutOfSpace`.
    pub fn grow(&self, size: u64, sync: bool) -> Result<()> {
        let file = self.file.lock();
        file.set_len(size).map_err(|e| {
            BoltError::OutOfSpace(format!(
                "failed to grow {} to {} bytes: {}",
                self.path.display(),
                size,
                e
            ))
        })?;
        if sync {
            file.sync_all()
                .map_err(|e| BoltError::OutOfSpace(format!("failed to sync file growth: {}", e)))?;
        }
        Ok(())
    }

    /// Flush written data to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Map the first `len` bytes of the file read-only
    pub fn map(&self, len: u64) -> Result<Arc<Mmap>> {
        let file = self.file.lock();
        // SAFETY: the map is read-only and the file only ever grows while it is
        // open. Pages visible to a snapshot are never rewritten while that
        // snapshot is alive, so the mapped bytes a reader looks at are stable.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(&*file)? };
        Ok(Arc::new(mmap))
    }

    /// Release the advisory lock early (it is also released on drop)
    pub fn unlock(&self) -> Result<()> {
        FileExt::unlock(&*self.file.lock())?;
        Ok(())
    }
}
