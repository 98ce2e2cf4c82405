//! Error types for boltkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using BoltError
pub type Result<T> = std::result::Result<T, BoltError>;

/// Unified error type for boltkv operations
#[derive(Debug, Error)]
pub enum BoltError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not grow to hold newly allocated pages.
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    // -------------------------------------------------------------------------
    // Database Errors
    // -------------------------------------------------------------------------
    #[error("Database not open")]
    DatabaseNotOpen,

    #[error("Database is in read-only mode")]
    DatabaseReadOnly,

    #[error("Timed out waiting for the {0} lock")]
    LockTimeout(&'static str),

    #[error("Invalid database: {0}")]
    InvalidDatabase(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Neither meta page passed validation.
    #[error("Both meta pages are corrupt")]
    CorruptMeta,

    #[error("Database corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction not writable")]
    TxNotWritable,

    #[error("Cursor expired: its bucket no longer exists in this transaction")]
    CursorExpired,

    // -------------------------------------------------------------------------
    // Bucket Errors
    // -------------------------------------------------------------------------
    #[error("Bucket not found")]
    BucketNotFound,

    #[error("Bucket already exists")]
    BucketExists,

    #[error("Bucket name required")]
    BucketNameRequired,

    /// A bucket operation hit a plain value, or a value operation hit a bucket.
    #[error("Incompatible value")]
    IncompatibleValue,

    // -------------------------------------------------------------------------
    // Key/Value Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key required")]
    KeyRequired,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BoltError {
    /// True for the recoverable "absent" errors (missing key or bucket)
    pub fn is_not_found(&self) -> bool {
        matches!(self, BoltError::KeyNotFound | BoltError::BucketNotFound)
    }
}
