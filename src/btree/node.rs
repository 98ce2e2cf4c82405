//! In-memory B+tree nodes
//!
//! A node is a mutable copy of one page, materialized the first time a write
//! transaction touches it. Nodes live in a per-transaction arena and refer to
//! each other by `NodeId`; the page they were read from is never modified.

use crate::page::{
    flags, write_header, write_u32, write_u64, Page, Pgid, BRANCH_ELEMENT_SIZE,
    LEAF_ELEMENT_SIZE, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE,
};

/// Index of a node in the transaction's arena
pub type NodeId = usize;

/// Index of a bucket in the transaction's arena
pub type BucketId = usize;

/// One key/value (leaf) or key/child (branch) entry of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct INode {
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub pgid: Pgid,
}

/// A materialized page
#[derive(Debug, Clone)]
pub struct Node {
    /// Bucket owning this node
    pub bucket: BucketId,
    pub is_leaf: bool,
    /// Touched by a delete; checked by rebalance on commit
    pub unbalanced: bool,
    /// Already written by the current spill
    pub spilled: bool,
    /// Merged away or collapsed; no longer part of the tree
    pub dead: bool,
    /// Key the parent currently uses to reference this node
    pub key: Vec<u8>,
    /// Page this node was read from (0 for nodes never written)
    pub pgid: Pgid,
    pub parent: Option<NodeId>,
    /// Materialized children
    pub children: Vec<NodeId>,
    pub inodes: Vec<INode>,
}

impl Node {
    pub fn new(bucket: BucketId, is_leaf: bool, parent: Option<NodeId>) -> Self {
        Self {
            bucket,
            is_leaf,
            unbalanced: false,
            spilled: false,
            dead: false,
            key: Vec::new(),
            pgid: 0,
            parent,
            children: Vec::new(),
            inodes: Vec::new(),
        }
    }

    /// Copy the contents of a branch or leaf page into a new node
    pub fn from_page(bucket: BucketId, page: &Page<'_>, parent: Option<NodeId>) -> Self {
        let mut node = Self::new(bucket, page.is_leaf(), parent);
        node.pgid = page.id();
        node.inodes = (0..page.count())
            .map(|i| {
                if node.is_leaf {
                    let elem = page.leaf_element(i);
                    INode {
                        flags: elem.flags,
                        key: elem.key.to_vec(),
                        value: elem.value.to_vec(),
                        pgid: 0,
                    }
                } else {
                    let elem = page.branch_element(i);
                    INode {
                        flags: 0,
                        key: elem.key.to_vec(),
                        value: Vec::new(),
                        pgid: elem.pgid,
                    }
                }
            })
            .collect();
        if let Some(first) = node.inodes.first() {
            node.key = first.key.clone();
        }
        node
    }

    /// Minimum number of entries before the node is considered underfull
    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    fn element_size(&self) -> usize {
        if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        }
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let elsize = self.element_size();
        PAGE_HEADER_SIZE
            + self
                .inodes
                .iter()
                .map(|inode| elsize + inode.key.len() + inode.value.len())
                .sum::<usize>()
    }

    /// Like `size() < limit` but stops counting early
    pub fn size_less_than(&self, limit: usize) -> bool {
        let elsize = self.element_size();
        let mut size = PAGE_HEADER_SIZE;
        for inode in &self.inodes {
            size += elsize + inode.key.len() + inode.value.len();
            if size >= limit {
                return false;
            }
        }
        true
    }

    /// Position of the first entry with key `>= key`, and whether it matches
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        let index = self.inodes.partition_point(|inode| inode.key.as_slice() < key);
        let exact = index < self.inodes.len() && self.inodes[index].key == key;
        (index, exact)
    }

    /// Insert or replace the entry stored under `old_key`
    pub fn put(&mut self, old_key: &[u8], new_key: &[u8], value: Vec<u8>, pgid: Pgid, flags: u32) {
        let (index, exact) = self.search(old_key);
        if !exact {
            self.inodes.insert(index, INode::default());
        }
        let inode = &mut self.inodes[index];
        inode.flags = flags;
        inode.key = new_key.to_vec();
        inode.value = value;
        inode.pgid = pgid;
    }

    /// Remove the entry for `key`; returns false if it was absent
    pub fn del(&mut self, key: &[u8]) -> bool {
        let (index, exact) = self.search(key);
        if !exact {
            return false;
        }
        self.inodes.remove(index);
        self.unbalanced = true;
        true
    }

    /// Index at which to split so the first piece stays under `threshold` bytes
    ///
    /// Both pieces keep at least `MIN_KEYS_PER_PAGE` entries.
    pub fn split_index(&self, threshold: usize) -> usize {
        let elsize = self.element_size();
        let mut size = PAGE_HEADER_SIZE;
        let mut index = 0;
        for i in 0..self.inodes.len() - MIN_KEYS_PER_PAGE {
            index = i;
            let inode = &self.inodes[i];
            let entry = elsize + inode.key.len() + inode.value.len();
            if i >= MIN_KEYS_PER_PAGE && size + entry > threshold {
                break;
            }
            size += entry;
        }
        index
    }

    /// Serialize into `buf` (sized to at least `size()`)
    ///
    /// The page header id/overflow are written by the caller's allocation.
    pub fn write(&self, buf: &mut [u8], id: Pgid, overflow: u32) {
        let page_flags = if self.is_leaf { flags::LEAF } else { flags::BRANCH };
        write_header(buf, id, page_flags, self.inodes.len() as u16, overflow);

        let elsize = self.element_size();
        let mut data_offset = PAGE_HEADER_SIZE + elsize * self.inodes.len();

        for (i, inode) in self.inodes.iter().enumerate() {
            let elem_offset = PAGE_HEADER_SIZE + i * elsize;
            let pos = (data_offset - elem_offset) as u32;

            if self.is_leaf {
                write_u32(buf, elem_offset, inode.flags);
                write_u32(buf, elem_offset + 4, pos);
                write_u32(buf, elem_offset + 8, inode.key.len() as u32);
                write_u32(buf, elem_offset + 12, inode.value.len() as u32);
            } else {
                write_u32(buf, elem_offset, pos);
                write_u32(buf, elem_offset + 4, inode.key.len() as u32);
                write_u64(buf, elem_offset + 8, inode.pgid);
            }

            buf[data_offset..data_offset + inode.key.len()].copy_from_slice(&inode.key);
            data_offset += inode.key.len();
            buf[data_offset..data_offset + inode.value.len()].copy_from_slice(&inode.value);
            data_offset += inode.value.len();
        }
    }
}
