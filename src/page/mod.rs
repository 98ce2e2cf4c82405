//! Page Module
//!
//! On-disk page layout shared by every component.
//!
//! ## Responsibilities
//! - Page header encoding (id, type flags, element count, overflow)
//! - Branch and leaf element encoding
//! - Meta pages (double-buffered root pointer)
//! - Free-list bookkeeping
//!
//! ## Page Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (16 bytes)                                        │
//! │   Id: u64 (8) | Flags: u16 (2) | Count: u16 (2) |        │
//! │   Overflow: u32 (4)                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ Elements (16 bytes each)                                 │
//! │   Branch: [Pos: u32][KSize: u32][Pgid: u64]              │
//! │   Leaf:   [Flags: u32][Pos: u32][KSize: u32][VSize: u32] │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data: keys (and values) addressed by element Pos         │
//! │   (Pos is relative to the element's own offset)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A page with `overflow = n` occupies `n + 1` contiguous pages on disk.
//! All integers are little-endian.

mod freelist;
mod meta;

pub use freelist::FreeList;
pub use meta::{Meta, MAGIC, META_SIZE, VERSION};

use crate::error::{BoltError, Result};

/// Page identifier (page number within the file)
pub type Pgid = u64;

/// Transaction identifier
pub type TxId = u64;

// =============================================================================
// Layout Constants
// =============================================================================

/// Page header size: Id (8) + Flags (2) + Count (2) + Overflow (4)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one branch element
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Size of one leaf element
pub const LEAF_ELEMENT_SIZE: usize = 16;

/// Size of an encoded bucket header: Root (8) + Sequence (8)
pub const BUCKET_HEADER_SIZE: usize = 16;

/// Default page size (4 KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Minimum number of keys a split piece must hold
pub const MIN_KEYS_PER_PAGE: usize = 2;

/// Maximum key length in bytes
pub const MAX_KEY_SIZE: usize = 32768;

/// Maximum value length in bytes
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Leaf element flag marking a nested bucket
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

/// Page type flags
pub mod flags {
    pub const BRANCH: u16 = 0x01;
    pub const LEAF: u16 = 0x02;
    pub const META: u16 = 0x04;
    pub const FREELIST: u16 = 0x10;
}

// =============================================================================
// Byte Helpers
// =============================================================================

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Page Header
// =============================================================================

/// Write a page header at the start of `buf`
pub fn write_header(buf: &mut [u8], id: Pgid, flags: u16, count: u16, overflow: u32) {
    write_u64(buf, 0, id);
    write_u16(buf, 8, flags);
    write_u16(buf, 10, count);
    write_u32(buf, 12, overflow);
}

/// Page type decoded from the header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Branch,
    Leaf,
    Meta,
    Freelist,
}

impl PageKind {
    pub fn from_flags(flags: u16) -> Option<Self> {
        if flags & self::flags::BRANCH != 0 {
            Some(PageKind::Branch)
        } else if flags & self::flags::LEAF != 0 {
            Some(PageKind::Leaf)
        } else if flags & self::flags::META != 0 {
            Some(PageKind::Meta)
        } else if flags & self::flags::FREELIST != 0 {
            Some(PageKind::Freelist)
        } else {
            None
        }
    }
}

// =============================================================================
// Page View
// =============================================================================

/// Read-only view over a page (and its overflow pages)
#[derive(Clone, Copy)]
pub struct Page<'a> {
    buf: &'a [u8],
}

/// A decoded leaf element
#[derive(Debug, Clone, Copy)]
pub struct LeafElement<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// A decoded branch element
#[derive(Debug, Clone, Copy)]
pub struct BranchElement<'a> {
    pub key: &'a [u8],
    pub pgid: Pgid,
}

impl<'a> Page<'a> {
    /// Wrap a buffer starting at a page boundary
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn id(&self) -> Pgid {
        read_u64(self.buf, 0)
    }

    pub fn flags(&self) -> u16 {
        read_u16(self.buf, 8)
    }

    pub fn kind(&self) -> Option<PageKind> {
        PageKind::from_flags(self.flags())
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & flags::LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & flags::BRANCH != 0
    }

    pub fn count(&self) -> usize {
        read_u16(self.buf, 10) as usize
    }

    pub fn overflow(&self) -> u32 {
        read_u32(self.buf, 12)
    }

    /// Bytes following the header (spans overflow pages)
    pub fn data(&self) -> &'a [u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn leaf_element(&self, index: usize) -> LeafElement<'a> {
        let offset = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
        let flags = read_u32(self.buf, offset);
        let pos = read_u32(self.buf, offset + 4) as usize;
        let ksize = read_u32(self.buf, offset + 8) as usize;
        let vsize = read_u32(self.buf, offset + 12) as usize;
        let key_start = offset + pos;
        let value_start = key_start + ksize;
        LeafElement {
            flags,
            key: &self.buf[key_start..value_start],
            value: &self.buf[value_start..value_start + vsize],
        }
    }

    pub fn branch_element(&self, index: usize) -> BranchElement<'a> {
        let offset = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
        let pos = read_u32(self.buf, offset) as usize;
        let ksize = read_u32(self.buf, offset + 4) as usize;
        let pgid = read_u64(self.buf, offset + 8);
        let key_start = offset + pos;
        BranchElement {
            key: &self.buf[key_start..key_start + ksize],
            pgid,
        }
    }

    /// Key of the element at `index`, for either page type
    pub fn key_at(&self, index: usize) -> &'a [u8] {
        if self.is_leaf() {
            self.leaf_element(index).key
        } else {
            self.branch_element(index).key
        }
    }

    /// Verify that the element table and every key and value lie inside the
    /// buffer. Element accessors may only be used on pages that pass.
    pub fn check_bounds(&self) -> Result<()> {
        let (leaf, elem_size) = if self.is_leaf() {
            (true, LEAF_ELEMENT_SIZE)
        } else if self.is_branch() {
            (false, BRANCH_ELEMENT_SIZE)
        } else {
            return Ok(());
        };

        let count = self.count();
        if PAGE_HEADER_SIZE + count * elem_size > self.buf.len() {
            return Err(BoltError::Corrupted(format!(
                "page {}: {} elements do not fit in the page",
                self.id(),
                count
            )));
        }

        for index in 0..count {
            let offset = PAGE_HEADER_SIZE + index * elem_size;
            let (pos, len) = if leaf {
                let pos = read_u32(self.buf, offset + 4) as usize;
                let ksize = read_u32(self.buf, offset + 8) as usize;
                let vsize = read_u32(self.buf, offset + 12) as usize;
                (pos, ksize.checked_add(vsize))
            } else {
                let pos = read_u32(self.buf, offset) as usize;
                (pos, Some(read_u32(self.buf, offset + 4) as usize))
            };

            let end = len.and_then(|len| offset.checked_add(pos)?.checked_add(len));
            if !end.is_some_and(|end| end <= self.buf.len()) {
                return Err(BoltError::Corrupted(format!(
                    "page {}: element {} extends past the end of the page",
                    self.id(),
                    index
                )));
            }
        }
        Ok(())
    }
}

/// Read-only access to the pages of one snapshot
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    page_size: usize,
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8], page_size: usize) -> Self {
        Self { data, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of whole pages covered by the view
    pub fn page_count(&self) -> u64 {
        (self.data.len() / self.page_size) as u64
    }

    /// Borrow the page with the given id
    pub fn page(&self, id: Pgid) -> Result<Page<'a>> {
        let offset = (id as usize)
            .checked_mul(self.page_size)
            .filter(|offset| offset + PAGE_HEADER_SIZE <= self.data.len())
            .ok_or_else(|| {
                BoltError::Corrupted(format!(
                    "page {} is outside the mapped file ({} pages)",
                    id,
                    self.page_count()
                ))
            })?;
        Ok(Page::new(&self.data[offset..]))
    }
}

// =============================================================================
// Bucket Header
// =============================================================================

/// Value stored in a parent leaf for a nested bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketHeader {
    /// Root page of the bucket's B+tree (0 until first commit)
    pub root: Pgid,
    /// Monotonic per-bucket sequence
    pub sequence: u64,
}

impl BucketHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BUCKET_HEADER_SIZE];
        write_u64(&mut buf, 0, self.root);
        write_u64(&mut buf, 8, self.sequence);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUCKET_HEADER_SIZE {
            return Err(BoltError::Corrupted(format!(
                "bucket header too short: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            root: read_u64(buf, 0),
            sequence: read_u64(buf, 8),
        })
    }
}
