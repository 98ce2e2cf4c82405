//! Buckets
//!
//! A bucket is a named B+tree. The root bucket hangs off the meta page; every
//! other bucket is an entry of its parent flagged as a bucket, whose value is
//! a 16-byte header (root page id + sequence).
//!
//! ```text
//! meta.root ──► root bucket tree
//!                 ├─ "users"  [bucket] ──► users tree
//!                 │                          ├─ "alice" = ...
//!                 │                          └─ "admins" [bucket] ──► ...
//!                 └─ "events" [bucket] ──► events tree
//! ```
//!
//! Bucket state lives in the transaction (`TxInner::buckets`); `Bucket` is a
//! cheap handle borrowing the transaction.

use std::collections::{BTreeMap, HashMap};

use crate::btree::node::{BucketId, Node, NodeId};
use crate::btree::tree::PageNode;
use crate::btree::{Cursor, CursorCore};
use crate::error::{BoltError, Result};
use crate::page::{
    BucketHeader, PageView, Pgid, BUCKET_LEAF_FLAG, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use crate::tx::{Tx, TxInner};

/// Id of the root bucket in every transaction
pub(crate) const ROOT_BUCKET: BucketId = 0;

/// Per-transaction state of one opened bucket
#[derive(Debug, Clone)]
pub(crate) struct BucketState {
    pub header: BucketHeader,
    pub name: Vec<u8>,
    /// Materialized root node, once the bucket has been written to
    pub root_node: Option<NodeId>,
    /// Materialized nodes by the page they were read from
    pub nodes: HashMap<Pgid, NodeId>,
    /// Opened child buckets by name (sorted, so spill order is stable)
    pub children: BTreeMap<Vec<u8>, BucketId>,
    /// Removed by `delete_bucket` in this transaction
    pub deleted: bool,
}

impl BucketState {
    fn new(name: &[u8], header: BucketHeader) -> Self {
        Self {
            header,
            name: name.to_vec(),
            root_node: None,
            nodes: HashMap::new(),
            children: BTreeMap::new(),
            deleted: false,
        }
    }

    pub(crate) fn root(header: BucketHeader) -> Self {
        Self::new(b"", header)
    }
}

/// Page and key counts for a bucket and everything nested in it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    /// Plain key/value pairs
    pub key_count: usize,
    /// Nested buckets (at any depth)
    pub bucket_count: usize,
    /// Levels of the deepest tree
    pub depth: usize,
}

impl BucketStats {
    fn add(&mut self, other: &BucketStats) {
        self.branch_pages += other.branch_pages;
        self.leaf_pages += other.leaf_pages;
        self.overflow_pages += other.overflow_pages;
        self.key_count += other.key_count;
        self.bucket_count += other.bucket_count;
        self.depth = self.depth.max(other.depth);
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(BoltError::BucketNameRequired);
    }
    if name.len() > MAX_KEY_SIZE {
        return Err(BoltError::KeyTooLarge {
            size: name.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

// =============================================================================
// Bucket Operations (transaction side)
// =============================================================================

impl TxInner {
    fn check_live(&self, bucket: BucketId) -> Result<()> {
        if self.buckets[bucket].deleted {
            return Err(BoltError::BucketNotFound);
        }
        Ok(())
    }

    fn add_bucket(&mut self, parent: BucketId, name: &[u8], header: BucketHeader) -> BucketId {
        let id = self.buckets.len();
        self.buckets.push(BucketState::new(name, header));
        if header.root == 0 {
            let root = self.nodes.len();
            self.nodes.push(Node::new(id, true, None));
            self.buckets[id].root_node = Some(root);
        }
        self.buckets[parent].children.insert(name.to_vec(), id);
        id
    }

    /// Open a nested bucket of `parent`
    pub(crate) fn open_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        view: &PageView<'_>,
    ) -> Result<BucketId> {
        self.check_live(parent)?;
        if let Some(&id) = self.buckets[parent].children.get(name) {
            return Ok(id);
        }

        let mut c = CursorCore::new(parent);
        let header = match c.seek_raw(name, self, view)? {
            Some(entry) if entry.key == name && entry.is_bucket() => {
                BucketHeader::decode(&entry.value)?
            }
            _ => return Err(BoltError::BucketNotFound),
        };

        Ok(self.add_bucket(parent, name, header))
    }

    /// Create an empty nested bucket under `parent`
    pub(crate) fn create_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        view: &PageView<'_>,
    ) -> Result<BucketId> {
        self.check_live(parent)?;
        validate_name(name)?;

        let mut c = CursorCore::new(parent);
        if let Some(entry) = c.seek_raw(name, self, view)? {
            if entry.key == name {
                return Err(if entry.is_bucket() {
                    BoltError::BucketExists
                } else {
                    BoltError::IncompatibleValue
                });
            }
        }

        let header = BucketHeader::default();
        let leaf = c.node(self, view)?;
        self.nodes[leaf].put(name, name, header.encode(), 0, BUCKET_LEAF_FLAG);

        Ok(self.add_bucket(parent, name, header))
    }

    /// Remove a nested bucket, its descendants and all their pages
    pub(crate) fn delete_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        view: &PageView<'_>,
    ) -> Result<()> {
        self.check_live(parent)?;

        let mut c = CursorCore::new(parent);
        match c.seek_raw(name, self, view)? {
            Some(entry) if entry.key == name => {
                if !entry.is_bucket() {
                    return Err(BoltError::IncompatibleValue);
                }
            }
            _ => return Err(BoltError::BucketNotFound),
        }

        let child = self.open_bucket(parent, name, view)?;
        for nested in self.bucket_names(child, view)? {
            self.delete_bucket(child, &nested, view)?;
        }

        self.buckets[parent].children.remove(name);
        self.free_bucket(child, view)?;
        self.buckets[child].deleted = true;

        let mut c = CursorCore::new(parent);
        c.seek_raw(name, self, view)?;
        let leaf = c.node(self, view)?;
        self.nodes[leaf].del(name);
        Ok(())
    }

    /// Names of the buckets nested directly in `bucket`
    pub(crate) fn bucket_names(&self, bucket: BucketId, view: &PageView<'_>) -> Result<Vec<Vec<u8>>> {
        let mut names = Vec::new();
        let mut c = CursorCore::new(bucket);
        let mut item = c.first(self, view)?;
        while let Some(entry) = item {
            if entry.is_bucket() {
                names.push(entry.key);
            }
            item = c.next(self, view)?;
        }
        Ok(names)
    }

    /// Free every page of a bucket's tree
    fn free_bucket(&mut self, bucket: BucketId, view: &PageView<'_>) -> Result<()> {
        let mut pages = Vec::new();
        let mut nodes = Vec::new();
        let mut stack = vec![self.buckets[bucket].header.root];

        while let Some(pgid) = stack.pop() {
            match self.page_node(bucket, pgid, view)? {
                PageNode::Page(page) => {
                    page.check_bounds()?;
                    pages.push(pgid);
                    if page.is_branch() {
                        stack.extend((0..page.count()).map(|i| page.branch_element(i).pgid));
                    }
                }
                PageNode::Node(id) => {
                    nodes.push(id);
                    let node = &self.nodes[id];
                    if !node.is_leaf {
                        stack.extend(node.inodes.iter().map(|inode| inode.pgid));
                    }
                }
            }
        }

        for pgid in pages {
            self.free(pgid, view)?;
        }
        for id in nodes {
            self.free_node(id, view)?;
        }
        Ok(())
    }

    /// Set the sequence, materializing the root so the header is rewritten
    pub(crate) fn set_sequence(&mut self, bucket: BucketId, value: u64, view: &PageView<'_>) -> Result<()> {
        self.check_live(bucket)?;
        if self.buckets[bucket].root_node.is_none() {
            let root = self.buckets[bucket].header.root;
            self.node(bucket, root, None, view)?;
        }
        self.buckets[bucket].header.sequence = value;
        Ok(())
    }

    // =========================================================================
    // Commit Support
    // =========================================================================

    /// Rebalance every node touched in this bucket and its children
    pub(crate) fn rebalance_bucket(&mut self, bucket: BucketId, view: &PageView<'_>) -> Result<()> {
        let mut nodes: Vec<NodeId> = self.buckets[bucket].nodes.values().copied().collect();
        nodes.sort_unstable();
        for id in nodes {
            self.rebalance_node(id, view)?;
        }

        let children: Vec<BucketId> = self.buckets[bucket].children.values().copied().collect();
        for child in children {
            self.rebalance_bucket(child, view)?;
        }
        Ok(())
    }

    /// Write a bucket's nodes (children first) and refresh its header
    pub(crate) fn spill_bucket(&mut self, bucket: BucketId, view: &PageView<'_>) -> Result<()> {
        let children: Vec<(Vec<u8>, BucketId)> = self.buckets[bucket]
            .children
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .collect();

        for (name, child) in children {
            self.spill_bucket(child, view)?;
            if self.buckets[child].root_node.is_none() {
                continue;
            }

            let value = self.buckets[child].header.encode();
            let mut c = CursorCore::new(bucket);
            match c.seek_raw(&name, self, view)? {
                Some(entry) if entry.key == name && entry.is_bucket() => {}
                _ => {
                    return Err(BoltError::Corrupted(format!(
                        "bucket {:?} missing from its parent",
                        String::from_utf8_lossy(&name)
                    )))
                }
            }
            let leaf = c.node(self, view)?;
            self.nodes[leaf].put(&name, &name, value, 0, BUCKET_LEAF_FLAG);
        }

        let Some(root) = self.buckets[bucket].root_node else {
            return Ok(());
        };
        self.spill_node(root, view)?;

        let root = self.root_of(root);
        self.buckets[bucket].root_node = Some(root);
        self.buckets[bucket].header.root = self.nodes[root].pgid;
        Ok(())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub(crate) fn bucket_stats(&self, bucket: BucketId, view: &PageView<'_>) -> Result<BucketStats> {
        self.check_live(bucket)?;
        let mut stats = BucketStats::default();
        let root = self.buckets[bucket].header.root;
        if root != 0 {
            Self::page_stats(view, root, 1, &mut stats)?;
        }
        Ok(stats)
    }

    fn page_stats(view: &PageView<'_>, pgid: Pgid, depth: usize, stats: &mut BucketStats) -> Result<()> {
        let page = view.page(pgid)?;
        page.check_bounds()?;
        stats.depth = stats.depth.max(depth);
        stats.overflow_pages += page.overflow() as usize;

        if page.is_leaf() {
            stats.leaf_pages += 1;
            for i in 0..page.count() {
                let elem = page.leaf_element(i);
                if elem.flags & BUCKET_LEAF_FLAG == 0 {
                    stats.key_count += 1;
                    continue;
                }
                stats.bucket_count += 1;
                let header = BucketHeader::decode(elem.value)?;
                if header.root != 0 {
                    let mut nested = BucketStats::default();
                    Self::page_stats(view, header.root, 1, &mut nested)?;
                    stats.add(&nested);
                }
            }
        } else {
            stats.branch_pages += 1;
            for i in 0..page.count() {
                Self::page_stats(view, page.branch_element(i).pgid, depth + 1, stats)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Bucket Handle
// =============================================================================

/// Handle to a bucket within a transaction
#[derive(Clone, Copy)]
pub struct Bucket<'tx> {
    tx: &'tx Tx,
    id: BucketId,
}

impl<'tx> Bucket<'tx> {
    pub(crate) fn new(tx: &'tx Tx, id: BucketId) -> Self {
        Self { tx, id }
    }

    /// Transaction this bucket belongs to
    pub fn tx(&self) -> &'tx Tx {
        self.tx
    }

    pub fn name(&self) -> Vec<u8> {
        self.tx.inner.borrow().buckets[self.id].name.clone()
    }

    /// Root page id as of the last commit (0 for buckets created in this transaction)
    pub fn root(&self) -> Pgid {
        self.tx.inner.borrow().buckets[self.id].header.root
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    /// Cursor over this bucket's entries
    pub fn cursor(&self) -> Cursor<'tx> {
        Cursor::new(self.tx, self.id)
    }

    // -------------------------------------------------------------------------
    // Key/Value
    // -------------------------------------------------------------------------

    /// Value stored under `key`, or `None` if absent or a nested bucket
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.tx.inner.borrow();
        inner.check_live(self.id)?;
        let view = self.tx.view();

        let mut c = CursorCore::new(self.id);
        match c.seek_raw(key, &inner, &view)? {
            Some(entry) if entry.key == key && !entry.is_bucket() => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    /// Insert or overwrite a value
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        if key.is_empty() {
            return Err(BoltError::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(BoltError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(BoltError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let mut inner = self.tx.inner.borrow_mut();
        inner.check_live(self.id)?;
        let view = self.tx.view();

        let mut c = CursorCore::new(self.id);
        if let Some(entry) = c.seek_raw(key, &inner, &view)? {
            if entry.key == key && entry.is_bucket() {
                return Err(BoltError::IncompatibleValue);
            }
        }

        let leaf = c.node(&mut inner, &view)?;
        inner.nodes[leaf].put(key, key, value.to_vec(), 0, 0);
        Ok(())
    }

    /// Remove a key
    ///
    /// Fails with `KeyNotFound` if the key is absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;

        let mut inner = self.tx.inner.borrow_mut();
        inner.check_live(self.id)?;
        let view = self.tx.view();

        let mut c = CursorCore::new(self.id);
        match c.seek_raw(key, &inner, &view)? {
            Some(entry) if entry.key == key => {
                if entry.is_bucket() {
                    return Err(BoltError::IncompatibleValue);
                }
            }
            _ => return Err(BoltError::KeyNotFound),
        }

        let leaf = c.node(&mut inner, &view)?;
        inner.nodes[leaf].del(key);
        Ok(())
    }

    /// Call `f` for every key/value pair, in key order (nested buckets skipped)
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            if !cursor.is_bucket() {
                f(&key, &value)?;
            }
            item = cursor.next()?;
        }
        Ok(())
    }

    /// Call `f` with the name of every directly nested bucket
    pub fn for_each_bucket<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, _)) = item {
            if cursor.is_bucket() {
                f(&key)?;
            }
            item = cursor.next()?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Nested Buckets
    // -------------------------------------------------------------------------

    /// Open a nested bucket
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        let view = self.tx.view();
        let id = self.tx.inner.borrow_mut().open_bucket(self.id, name, &view)?;
        Ok(Bucket::new(self.tx, id))
    }

    /// Create a nested bucket; fails with `BucketExists` if it is already there
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.ensure_writable()?;
        let view = self.tx.view();
        let id = self.tx.inner.borrow_mut().create_bucket(self.id, name, &view)?;
        Ok(Bucket::new(self.tx, id))
    }

    /// Open a nested bucket, creating it if needed
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket(name) {
            Err(BoltError::BucketExists) => self.bucket(name),
            other => other,
        }
    }

    /// Delete a nested bucket and everything in it
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let view = self.tx.view();
        self.tx.inner.borrow_mut().delete_bucket(self.id, name, &view)
    }

    // -------------------------------------------------------------------------
    // Sequence
    // -------------------------------------------------------------------------

    /// Current value of the bucket's sequence counter
    pub fn sequence(&self) -> u64 {
        self.tx.inner.borrow().buckets[self.id].header.sequence
    }

    pub fn set_sequence(&self, value: u64) -> Result<()> {
        self.tx.ensure_writable()?;
        let view = self.tx.view();
        self.tx.inner.borrow_mut().set_sequence(self.id, value, &view)
    }

    /// Increment the sequence and return the new value (wraps at `u64::MAX`)
    pub fn next_sequence(&self) -> Result<u64> {
        let next = self.sequence().wrapping_add(1);
        self.set_sequence(next)?;
        Ok(next)
    }

    /// Page and key counts of the committed tree
    pub fn stats(&self) -> Result<BucketStats> {
        let view = self.tx.view();
        self.tx.inner.borrow().bucket_stats(self.id, &view)
    }
}

impl std::fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &String::from_utf8_lossy(&self.name()))
            .field("root", &self.root())
            .finish()
    }
}
