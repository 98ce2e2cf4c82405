//! # boltkv
//!
//! An embedded, single-file, transactional key-value store with:
//! - A copy-on-write B+tree over fixed-size pages
//! - Nested namespaces ("buckets") and ordered cursors
//! - Single-writer / multi-reader MVCC transactions
//! - Crash safety through double-buffered meta pages (no log to replay)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Db::update / Db::view                      │
//! │            (one writer slot, many readers)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                Tx (snapshot: meta + mmap)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Bucket    │─────────►│   Cursor    │
//!   │ (directory) │          │ (ordered)   │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────────────────────────────┐
//!   │   B+tree nodes (COW, per-tx arena)  │
//!   └──────────────────┬──────────────────┘
//!                      ▼
//!   ┌─────────────────────────────────────┐
//!   │ Pages: meta, free list, file + mmap │
//!   └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```no_run
//! use boltkv::{Db, Options};
//!
//! # fn main() -> boltkv::Result<()> {
//! let db = Db::open("app.db", Options::default())?;
//!
//! db.update(|tx| -> boltkv::Result<()> {
//!     let users = tx.create_bucket_if_not_exists(b"users")?;
//!     users.put(b"alice", b"admin")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| -> boltkv::Result<()> {
//!     let users = tx.bucket(b"users")?;
//!     assert_eq!(users.get(b"alice")?, Some(b"admin".to_vec()));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page;
pub mod storage;
pub mod btree;
pub mod bucket;
pub mod tx;
pub mod db;
mod check;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BoltError, Result};
pub use config::{Options, OptionsBuilder};
pub use btree::Cursor;
pub use bucket::{Bucket, BucketStats};
pub use tx::{Tx, TxStats};
pub use db::{Db, Stats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of boltkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
