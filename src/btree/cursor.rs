//! Cursor
//!
//! Ordered traversal of one bucket's B+tree.
//!
//! ## Design
//! The cursor keeps a stack of frames, one per tree level, from the root down
//! to the current leaf. Each frame points at either an untouched page (read
//! straight from the snapshot's map) or a node materialized by the current
//! write transaction, plus the index of the current element.
//!
//! ```text
//!   stack[0]  root   (page 3,  index 1)
//!   stack[1]  branch (node 7,  index 0)
//!   stack[2]  leaf   (page 12, index 4)  <- current entry
//! ```
//!
//! `CursorCore` holds the position only; every step borrows the transaction
//! state for its duration, so callers can freely mutate between steps.

use crate::error::{BoltError, Result};
use crate::page::{Page, PageView, Pgid, BUCKET_LEAF_FLAG};
use crate::tx::{Tx, TxInner};
use crate::bucket::Bucket;

use super::node::{BucketId, Node, NodeId};
use super::tree::PageNode;

/// One level of the cursor stack
#[derive(Debug, Clone, Copy)]
struct ElemRef {
    pgid: Pgid,
    node: Option<NodeId>,
    index: usize,
}

/// Entry under the cursor, copied out of the page or node
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
}

impl RawEntry {
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

/// Elements of a frame, page-backed or node-backed
enum Elems<'a> {
    Page(Page<'a>),
    Node(&'a Node),
}

impl<'a> Elems<'a> {
    fn is_leaf(&self) -> bool {
        match self {
            Elems::Page(p) => p.is_leaf(),
            Elems::Node(n) => n.is_leaf,
        }
    }

    fn count(&self) -> usize {
        match self {
            Elems::Page(p) => p.count(),
            Elems::Node(n) => n.inodes.len(),
        }
    }

    fn key(&self, index: usize) -> &'a [u8] {
        match self {
            Elems::Page(p) => p.key_at(index),
            Elems::Node(n) => &n.inodes[index].key,
        }
    }

    fn child(&self, index: usize) -> Pgid {
        match self {
            Elems::Page(p) => p.branch_element(index).pgid,
            Elems::Node(n) => n.inodes[index].pgid,
        }
    }

    fn entry(&self, index: usize) -> RawEntry {
        match self {
            Elems::Page(p) => {
                let elem = p.leaf_element(index);
                RawEntry {
                    key: elem.key.to_vec(),
                    value: elem.value.to_vec(),
                    flags: elem.flags,
                }
            }
            Elems::Node(n) => {
                let inode = &n.inodes[index];
                RawEntry {
                    key: inode.key.clone(),
                    value: inode.value.clone(),
                    flags: inode.flags,
                }
            }
        }
    }

    /// First index with key `>= key`, and whether it is an exact match
    fn search(&self, key: &[u8]) -> (usize, bool) {
        let (mut lo, mut hi) = (0, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo, lo < self.count() && self.key(lo) == key)
    }
}

// =============================================================================
// Cursor Core
// =============================================================================

/// Cursor position, independent of any borrow of the transaction
#[derive(Debug, Clone)]
pub(crate) struct CursorCore {
    bucket: BucketId,
    stack: Vec<ElemRef>,
}

impl CursorCore {
    pub fn new(bucket: BucketId) -> Self {
        Self {
            bucket,
            stack: Vec::new(),
        }
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    fn elems<'a>(r: &ElemRef, inner: &'a TxInner, view: &PageView<'a>) -> Result<Elems<'a>> {
        match r.node {
            Some(id) => Ok(Elems::Node(&inner.nodes[id])),
            None => Ok(Elems::Page(view.page(r.pgid)?)),
        }
    }

    fn top(&self) -> Result<ElemRef> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| BoltError::Corrupted("cursor is not positioned".to_string()))
    }

    fn push(&mut self, pgid: Pgid, inner: &TxInner, view: &PageView<'_>) -> Result<()> {
        let node = match inner.page_node(self.bucket, pgid, view)? {
            PageNode::Node(id) => Some(id),
            PageNode::Page(page) => {
                if !page.is_leaf() && !page.is_branch() {
                    return Err(BoltError::Corrupted(format!(
                        "page {} is not a branch or leaf (flags 0x{:02x})",
                        pgid,
                        page.flags()
                    )));
                }
                page.check_bounds()?;
                None
            }
        };
        self.stack.push(ElemRef {
            pgid,
            node,
            index: 0,
        });
        Ok(())
    }

    fn reset(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<()> {
        self.stack.clear();
        let root = inner.buckets[self.bucket].header.root;
        self.push(root, inner, view)
    }

    /// Entry at the current position, or `None` past the end of a leaf
    pub fn current(&self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        let Some(r) = self.stack.last() else {
            return Ok(None);
        };
        let elems = Self::elems(r, inner, view)?;
        if r.index >= elems.count() {
            return Ok(None);
        }
        Ok(Some(elems.entry(r.index)))
    }

    fn top_count(&self, inner: &TxInner, view: &PageView<'_>) -> Result<usize> {
        let r = self.top()?;
        Ok(Self::elems(&r, inner, view)?.count())
    }

    /// Descend to the first leaf under the top frame
    fn go_first(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<()> {
        loop {
            let r = self.top()?;
            let elems = Self::elems(&r, inner, view)?;
            if elems.is_leaf() {
                return Ok(());
            }
            let pgid = elems.child(r.index);
            self.push(pgid, inner, view)?;
        }
    }

    /// Descend to the last leaf under the top frame
    fn go_last(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<()> {
        loop {
            let r = self.top()?;
            let elems = Self::elems(&r, inner, view)?;
            if elems.is_leaf() {
                return Ok(());
            }
            let pgid = elems.child(r.index);
            self.push(pgid, inner, view)?;
            let count = self.top_count(inner, view)?;
            if let Some(top) = self.stack.last_mut() {
                top.index = count.saturating_sub(1);
            }
        }
    }

    pub fn first(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        self.reset(inner, view)?;
        self.go_first(inner, view)?;
        if self.top_count(inner, view)? == 0 {
            return self.next(inner, view);
        }
        self.current(inner, view)
    }

    pub fn last(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        self.reset(inner, view)?;
        let count = self.top_count(inner, view)?;
        if let Some(top) = self.stack.last_mut() {
            top.index = count.saturating_sub(1);
        }
        self.go_last(inner, view)?;
        if self.top_count(inner, view)? == 0 {
            return self.prev(inner, view);
        }
        self.current(inner, view)
    }

    pub fn next(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        loop {
            let mut level = None;
            for i in (0..self.stack.len()).rev() {
                let r = self.stack[i];
                let count = Self::elems(&r, inner, view)?.count();
                if r.index + 1 < count {
                    self.stack[i].index += 1;
                    level = Some(i);
                    break;
                }
            }

            // Past the last entry: stay on it so a later `prev` still works.
            let Some(level) = level else {
                if let Some(&r) = self.stack.last() {
                    let count = Self::elems(&r, inner, view)?.count();
                    if let Some(top) = self.stack.last_mut() {
                        top.index = count;
                    }
                }
                return Ok(None);
            };

            self.stack.truncate(level + 1);
            self.go_first(inner, view)?;
            if self.top_count(inner, view)? == 0 {
                continue;
            }
            return self.current(inner, view);
        }
    }

    pub fn prev(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        loop {
            while let Some(&r) = self.stack.last() {
                if r.index > 0 {
                    let count = Self::elems(&r, inner, view)?.count();
                    if let Some(top) = self.stack.last_mut() {
                        top.index = r.index.min(count) - 1;
                    }
                    break;
                }
                self.stack.pop();
            }
            if self.stack.is_empty() {
                return Ok(None);
            }

            self.go_last(inner, view)?;
            if self.top_count(inner, view)? == 0 {
                continue;
            }
            return self.current(inner, view);
        }
    }

    /// Position at the first key `>= key` without leaving the leaf
    ///
    /// Returns `None` when the position is past the end of that leaf; this is
    /// the leaf an insert of `key` belongs in.
    pub fn seek_raw(
        &mut self,
        key: &[u8],
        inner: &TxInner,
        view: &PageView<'_>,
    ) -> Result<Option<RawEntry>> {
        self.reset(inner, view)?;
        loop {
            let r = self.top()?;
            let elems = Self::elems(&r, inner, view)?;
            let (mut index, exact) = elems.search(key);
            if elems.is_leaf() {
                if let Some(top) = self.stack.last_mut() {
                    top.index = index;
                }
                return self.current(inner, view);
            }
            if !exact && index > 0 {
                index -= 1;
            }
            let pgid = elems.child(index);
            if let Some(top) = self.stack.last_mut() {
                top.index = index;
            }
            self.push(pgid, inner, view)?;
        }
    }

    /// Position at the first key `>= key`, moving on to the next leaf if needed
    pub fn seek(&mut self, key: &[u8], inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        match self.seek_raw(key, inner, view)? {
            Some(entry) => Ok(Some(entry)),
            None => self.next(inner, view),
        }
    }

    /// Current entry, or the next one if the position is past a leaf's end
    pub fn resume(&mut self, inner: &TxInner, view: &PageView<'_>) -> Result<Option<RawEntry>> {
        match self.current(inner, view)? {
            Some(entry) => Ok(Some(entry)),
            None => self.next(inner, view),
        }
    }

    /// Materialize the path to the current leaf and return the leaf node
    pub fn node(&mut self, inner: &mut TxInner, view: &PageView<'_>) -> Result<NodeId> {
        let top = self.top()?;
        if let Some(id) = top.node {
            if inner.nodes[id].is_leaf {
                return Ok(id);
            }
        }

        let root = self.stack[0];
        let mut id = match root.node {
            Some(id) => id,
            None => inner.node(self.bucket, root.pgid, None, view)?,
        };
        self.stack[0].node = Some(id);

        for level in 0..self.stack.len() - 1 {
            id = inner.child_at(id, self.stack[level].index, view)?;
            self.stack[level + 1].node = Some(id);
        }

        if !inner.nodes[id].is_leaf {
            return Err(BoltError::Corrupted(
                "cursor path does not end at a leaf".to_string(),
            ));
        }
        Ok(id)
    }
}

// =============================================================================
// Public Cursor
// =============================================================================

/// Iterator-like handle over one bucket, in key order
///
/// Positioning methods return the `(key, value)` pair under the cursor, or
/// `None` when there is nothing in that direction. Nested buckets appear with
/// an empty value; `is_bucket()` tells them apart.
///
/// ```no_run
/// # fn main() -> boltkv::Result<()> {
/// let db = boltkv::Db::open("app.db", boltkv::Options::default())?;
/// db.view(|tx| -> boltkv::Result<()> {
///     let bucket = tx.bucket(b"users")?;
///     let mut cursor = bucket.cursor();
///     let mut item = cursor.first()?;
///     while let Some((key, value)) = item {
///         println!("{:?} = {:?}", key, value);
///         item = cursor.next()?;
///     }
///     Ok(())
/// })
/// # }
/// ```
pub struct Cursor<'tx> {
    tx: &'tx Tx,
    core: CursorCore,
    /// Flags of the last entry returned
    flags: u32,
    /// A delete left the position on the successor; `next` returns it as is
    after_delete: bool,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(tx: &'tx Tx, bucket: BucketId) -> Self {
        Self {
            tx,
            core: CursorCore::new(bucket),
            flags: 0,
            after_delete: false,
        }
    }

    /// Bucket this cursor walks
    pub fn bucket(&self) -> Bucket<'tx> {
        Bucket::new(self.tx, self.core.bucket())
    }

    fn step<F>(&mut self, f: F) -> Result<Option<(Vec<u8>, Vec<u8>)>>
    where
        F: FnOnce(&mut CursorCore, &TxInner, &PageView<'_>) -> Result<Option<RawEntry>>,
    {
        let inner = self.tx.inner.borrow();
        if inner.buckets[self.core.bucket()].deleted {
            return Err(BoltError::CursorExpired);
        }
        let view = self.tx.view();
        let entry = f(&mut self.core, &inner, &view)?;
        self.after_delete = false;

        Ok(entry.map(|entry| {
            self.flags = entry.flags;
            if entry.is_bucket() {
                (entry.key, Vec::new())
            } else {
                (entry.key, entry.value)
            }
        }))
    }

    /// Move to the first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(|core, inner, view| core.first(inner, view))
    }

    /// Move to the last entry
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(|core, inner, view| core.last(inner, view))
    }

    /// Move to the next entry
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.after_delete {
            return self.step(|core, inner, view| core.resume(inner, view));
        }
        self.step(|core, inner, view| core.next(inner, view))
    }

    /// Move to the previous entry
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(|core, inner, view| core.prev(inner, view))
    }

    /// Move to the first entry with key `>= key`
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(|core, inner, view| core.seek(key, inner, view))
    }

    /// True if the last entry returned is a nested bucket
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }

    /// Remove the entry under the cursor
    ///
    /// The next call to `next` returns the entry that followed it.
    /// Nested buckets must be removed with `delete_bucket`.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.ensure_writable()?;

        let mut inner = self.tx.inner.borrow_mut();
        if inner.buckets[self.core.bucket()].deleted {
            return Err(BoltError::CursorExpired);
        }
        let view = self.tx.view();

        let entry = self
            .core
            .current(&inner, &view)?
            .ok_or(BoltError::KeyNotFound)?;
        if entry.is_bucket() {
            return Err(BoltError::IncompatibleValue);
        }

        let leaf = self.core.node(&mut inner, &view)?;
        inner.nodes[leaf].del(&entry.key);

        self.core.seek_raw(&entry.key, &inner, &view)?;
        self.after_delete = true;
        Ok(())
    }
}
