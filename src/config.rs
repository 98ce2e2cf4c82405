//! Configuration for boltkv
//!
//! Open-time options with sensible defaults.

use std::time::Duration;

use crate::error::{BoltError, Result};
use crate::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Lowest accepted split fill percentage
pub const MIN_FILL_PERCENT: f64 = 0.1;

/// Highest accepted split fill percentage
pub const MAX_FILL_PERCENT: f64 = 1.0;

/// Default split fill percentage (nodes split at their byte midpoint)
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Options used when opening a database
#[derive(Debug, Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------
    /// How long to wait for the advisory file lock.
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,

    /// How long `begin(true)` waits for the single writer slot.
    /// `None` waits indefinitely.
    pub write_lock_timeout: Option<Duration>,

    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Open the file read-only with a shared lock
    pub read_only: bool,

    /// Page size used when creating a new file.
    /// Existing files keep the page size recorded in their meta page.
    pub page_size: usize,

    /// Initial size of the file/memory map in bytes (0 = grow on demand)
    pub initial_mmap_size: usize,

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------
    /// Skip fsync on commit (unsafe across power loss, useful for bulk loads)
    pub no_sync: bool,

    /// Skip fsync after growing the file
    pub no_grow_sync: bool,

    // -------------------------------------------------------------------------
    // B+Tree Tuning
    // -------------------------------------------------------------------------
    /// Fraction of a page a node fills before it is split on commit
    pub fill_percent: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: None,
            write_lock_timeout: None,
            read_only: false,
            page_size: DEFAULT_PAGE_SIZE,
            initial_mmap_size: 0,
            no_sync: false,
            no_grow_sync: false,
            fill_percent: DEFAULT_FILL_PERCENT,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Reject option combinations the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(BoltError::Config(format!(
                "page size must be a power of two between {} and {}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }

        if !(MIN_FILL_PERCENT..=MAX_FILL_PERCENT).contains(&self.fill_percent) {
            return Err(BoltError::Config(format!(
                "fill percent must be between {} and {}, got {}",
                MIN_FILL_PERCENT, MAX_FILL_PERCENT, self.fill_percent
            )));
        }

        Ok(())
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Set the file lock timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Set the writer slot timeout
    pub fn write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.options.write_lock_timeout = Some(timeout);
        self
    }

    /// Open the database read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    /// Set the page size for newly created files
    pub fn page_size(mut self, size: usize) -> Self {
        self.options.page_size = size;
        self
    }

    /// Set the initial file/memory map size (in bytes)
    pub fn initial_mmap_size(mut self, size: usize) -> Self {
        self.options.initial_mmap_size = size;
        self
    }

    /// Disable fsync on commit
    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.options.no_sync = no_sync;
        self
    }

    /// Disable fsync after file growth
    pub fn no_grow_sync(mut self, no_grow_sync: bool) -> Self {
        self.options.no_grow_sync = no_grow_sync;
        self
    }

    /// Set the node split fill percentage
    pub fn fill_percent(mut self, fill_percent: f64) -> Self {
        self.options.fill_percent = fill_percent;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}
