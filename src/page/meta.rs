//! Meta pages
//!
//! Pages 0 and 1 hold the two most recent committed meta records. The meta
//! written by transaction `t` goes to slot `t % 2`, so the previous commit is
//! always intact while the next one is being written.
//!
//! ## Layout (after the 16-byte page header)
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ Magic(4) │Version(4) │ PageSize (4) │ Flags(4) │
//! ├──────────┴───────────┴──────────────┴──────────┤
//! │ Root: Pgid (8) | Sequence (8)                  │
//! ├────────────────────────────────────────────────┤
//! │ Freelist (8) | Pgid (8) | TxId (8)             │
//! ├────────────────────────────────────────────────┤
//! │ CRC32 of all preceding meta bytes (4)          │
//! └────────────────────────────────────────────────┘
//! ```

use crate::error::{BoltError, Result};

use super::{
    flags, read_u32, read_u64, write_header, write_u32, write_u64, BucketHeader, Pgid, TxId,
    PAGE_HEADER_SIZE,
};

/// Magic number identifying a boltkv file
pub const MAGIC: u32 = 0x424F_4C54;

/// Current on-disk format version
pub const VERSION: u32 = 1;

/// Encoded meta size (without the page header)
pub const META_SIZE: usize = 68;

/// Offset of the checksum within the encoded meta
const CHECKSUM_OFFSET: usize = 64;

/// Committed database root state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    /// Root bucket header
    pub root: BucketHeader,
    /// Page holding the free list
    pub freelist: Pgid,
    /// High-water mark: first page id never allocated
    pub pgid: Pgid,
    /// Id of the transaction that wrote this meta
    pub txid: TxId,
    pub checksum: u32,
}

impl Meta {
    /// Meta for a freshly initialized file
    pub fn new(page_size: usize, txid: TxId, freelist: Pgid, root: Pgid, pgid: Pgid) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: VERSION,
            page_size: page_size as u32,
            flags: 0,
            root: BucketHeader { root, sequence: 0 },
            freelist,
            pgid,
            txid,
            checksum: 0,
        };
        meta.checksum = meta.sum();
        meta
    }

    /// Decode the raw meta fields of a meta page (no validation)
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < PAGE_HEADER_SIZE + META_SIZE {
            return Err(BoltError::InvalidDatabase(format!(
                "meta page too short: {} bytes",
                page.len()
            )));
        }
        let buf = &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE];
        Ok(Self {
            magic: read_u32(buf, 0),
            version: read_u32(buf, 4),
            page_size: read_u32(buf, 8),
            flags: read_u32(buf, 12),
            root: BucketHeader {
                root: read_u64(buf, 16),
                sequence: read_u64(buf, 24),
            },
            freelist: read_u64(buf, 32),
            pgid: read_u64(buf, 40),
            txid: read_u64(buf, 48),
            checksum: read_u32(buf, CHECKSUM_OFFSET),
        })
    }

    /// Check magic, version and checksum
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(BoltError::InvalidDatabase(format!(
                "invalid magic 0x{:08x}",
                self.magic
            )));
        }
        if self.version != VERSION {
            return Err(BoltError::VersionMismatch {
                expected: VERSION,
                found: self.version,
            });
        }
        if self.checksum != self.sum() {
            return Err(BoltError::Corrupted(format!(
                "meta checksum mismatch for txid {}",
                self.txid
            )));
        }
        Ok(())
    }

    /// CRC32 over the encoded fields preceding the checksum
    pub fn sum(&self) -> u32 {
        let mut buf = [0u8; META_SIZE];
        self.encode_fields(&mut buf);
        crc32fast::hash(&buf[..CHECKSUM_OFFSET])
    }

    /// Slot this meta is written to
    pub fn slot(&self) -> Pgid {
        self.txid % 2
    }

    /// Write a full meta page (header included) into `page`,
    /// refreshing the checksum
    pub fn write_page(&mut self, page: &mut [u8]) {
        self.checksum = self.sum();
        write_header(page, self.slot(), flags::META, 0, 0);
        self.encode_fields(&mut page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE]);
    }

    fn encode_fields(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.magic);
        write_u32(buf, 4, self.version);
        write_u32(buf, 8, self.page_size);
        write_u32(buf, 12, self.flags);
        write_u64(buf, 16, self.root.root);
        write_u64(buf, 24, self.root.sequence);
        write_u64(buf, 32, self.freelist);
        write_u64(buf, 40, self.pgid);
        write_u64(buf, 48, self.txid);
        // 56..64 reserved
        write_u32(buf, CHECKSUM_OFFSET, self.checksum);
    }
}
