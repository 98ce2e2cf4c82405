//! Copy-on-write tree maintenance
//!
//! Operations over the node arena of a write transaction:
//! - Materialize pages into nodes on first write
//! - Rebalance underfull nodes on commit (merge below 25% fill)
//! - Spill nodes to freshly allocated pages, splitting oversized ones
//!
//! Old pages are only ever freed (into the pending list), never rewritten.

use crate::error::{BoltError, Result};
use crate::page::{write_header, Page, PageView, Pgid, MIN_KEYS_PER_PAGE};
use crate::storage::MAX_MMAP_SIZE;
use crate::tx::TxInner;

use super::node::{BucketId, Node, NodeId};

/// Either an untouched page or its materialized node
pub(crate) enum PageNode<'a> {
    Page(Page<'a>),
    Node(NodeId),
}

impl TxInner {
    // =========================================================================
    // Materialization
    // =========================================================================

    /// Resolve a page id to its node if the bucket has materialized it
    pub(crate) fn page_node<'a>(
        &self,
        bucket: BucketId,
        pgid: Pgid,
        view: &PageView<'a>,
    ) -> Result<PageNode<'a>> {
        let state = &self.buckets[bucket];
        if let Some(root) = state.root_node {
            if pgid == state.header.root {
                return Ok(PageNode::Node(root));
            }
        }
        if let Some(&id) = state.nodes.get(&pgid) {
            return Ok(PageNode::Node(id));
        }
        Ok(PageNode::Page(view.page(pgid)?))
    }

    /// Materialize a page into a node, reusing an existing one
    pub(crate) fn node(
        &mut self,
        bucket: BucketId,
        pgid: Pgid,
        parent: Option<NodeId>,
        view: &PageView<'_>,
    ) -> Result<NodeId> {
        if parent.is_none() {
            let state = &self.buckets[bucket];
            if let Some(root) = state.root_node {
                if state.header.root == pgid {
                    return Ok(root);
                }
            }
        }
        if let Some(&id) = self.buckets[bucket].nodes.get(&pgid) {
            return Ok(id);
        }

        let page = view.page(pgid)?;
        if !page.is_leaf() && !page.is_branch() {
            return Err(BoltError::Corrupted(format!(
                "page {} is not a branch or leaf (flags 0x{:02x})",
                pgid,
                page.flags()
            )));
        }
        page.check_bounds()?;

        let id = self.nodes.len();
        self.nodes.push(Node::from_page(bucket, &page, parent));
        match parent {
            None => self.buckets[bucket].root_node = Some(id),
            Some(parent) => self.nodes[parent].children.push(id),
        }
        self.buckets[bucket].nodes.insert(pgid, id);
        self.stats.node_count += 1;
        Ok(id)
    }

    /// Materialize the child at `index` of a branch node
    pub(crate) fn child_at(&mut self, id: NodeId, index: usize, view: &PageView<'_>) -> Result<NodeId> {
        let node = &self.nodes[id];
        if node.is_leaf {
            return Err(BoltError::Corrupted(format!(
                "child requested from leaf node (page {})",
                node.pgid
            )));
        }
        let bucket = node.bucket;
        let pgid = node.inodes[index].pgid;
        self.node(bucket, pgid, Some(id), view)
    }

    /// Position of `child` within its parent's entries
    fn child_index(&self, parent: NodeId, child: NodeId) -> usize {
        self.nodes[parent].search(&self.nodes[child].key).0
    }

    /// Topmost ancestor of a node
    pub(crate) fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.nodes[id].parent {
            id = parent;
        }
        id
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.retain(|&c| c != child);
    }

    // =========================================================================
    // Page Allocation
    // =========================================================================

    /// Allocate `count` contiguous pages backed by a dirty buffer
    ///
    /// Free pages are reused first; otherwise the high-water mark moves.
    pub(crate) fn allocate(&mut self, count: usize) -> Result<Pgid> {
        let pgid = match self.freelist.allocate(count) {
            Some(pgid) => pgid,
            None => {
                let pgid = self.meta.pgid;
                let end = pgid + count as u64;
                if end.saturating_mul(self.page_size as u64) > MAX_MMAP_SIZE {
                    return Err(BoltError::OutOfSpace(format!(
                        "allocating {} pages at {} exceeds the maximum file size",
                        count, pgid
                    )));
                }
                self.meta.pgid = end;
                pgid
            }
        };

        let mut buf = vec![0u8; count * self.page_size];
        write_header(&mut buf, pgid, 0, 0, (count - 1) as u32);
        self.pages.insert(pgid, buf);

        self.stats.page_count += count;
        self.stats.page_alloc += count * self.page_size;
        Ok(pgid)
    }

    /// Release a committed page (and its overflow) to the pending list
    pub(crate) fn free(&mut self, pgid: Pgid, view: &PageView<'_>) -> Result<()> {
        let overflow = view.page(pgid)?.overflow();
        self.freelist.free(self.txid, pgid, overflow)
    }

    /// Free the page a node was read from, if any
    pub(crate) fn free_node(&mut self, id: NodeId, view: &PageView<'_>) -> Result<()> {
        let pgid = self.nodes[id].pgid;
        if pgid != 0 {
            self.free(pgid, view)?;
            self.nodes[id].pgid = 0;
        }
        Ok(())
    }

    /// Drop a node from its bucket's cache and free its page
    fn discard_node(&mut self, id: NodeId, view: &PageView<'_>) -> Result<()> {
        let (bucket, pgid) = (self.nodes[id].bucket, self.nodes[id].pgid);
        self.buckets[bucket].nodes.remove(&pgid);
        self.nodes[id].dead = true;
        self.nodes[id].parent = None;
        self.free_node(id, view)
    }

    // =========================================================================
    // Rebalance
    // =========================================================================

    /// Merge an underfull node with a sibling, then rebalance its parent
    pub(crate) fn rebalance_node(&mut self, id: NodeId, view: &PageView<'_>) -> Result<()> {
        {
            let node = &mut self.nodes[id];
            if node.dead || !node.unbalanced {
                return Ok(());
            }
            node.unbalanced = false;
        }
        self.stats.rebalance += 1;

        let threshold = self.page_size / 4;
        let node = &self.nodes[id];
        if node.size() > threshold && node.inodes.len() > node.min_keys() {
            return Ok(());
        }

        let Some(parent) = node.parent else {
            // A root branch with a single child collapses into that child.
            if !node.is_leaf && node.inodes.len() == 1 {
                let child = self.child_at(id, 0, view)?;
                let (is_leaf, inodes, children) = {
                    let c = &mut self.nodes[child];
                    (
                        c.is_leaf,
                        std::mem::take(&mut c.inodes),
                        std::mem::take(&mut c.children),
                    )
                };
                for &grandchild in &children {
                    self.nodes[grandchild].parent = Some(id);
                }
                let root = &mut self.nodes[id];
                root.is_leaf = is_leaf;
                root.inodes = inodes;
                root.children = children;
                self.discard_node(child, view)?;
            }
            return Ok(());
        };

        if self.nodes[id].inodes.is_empty() {
            let key = self.nodes[id].key.clone();
            self.nodes[parent].del(&key);
            self.remove_child(parent, id);
            self.discard_node(id, view)?;
            return self.rebalance_node(parent, view);
        }

        if self.nodes[parent].inodes.len() < 2 {
            return Ok(());
        }

        if self.child_index(parent, id) == 0 {
            let target = self.child_at(parent, 1, view)?;
            self.merge(id, target, view)?;
        } else {
            let index = self.child_index(parent, id);
            let target = self.child_at(parent, index - 1, view)?;
            self.merge(target, id, view)?;
        }

        self.rebalance_node(parent, view)
    }

    /// Append `from` to `into` (its right neighbour's contents) and drop `from`
    fn merge(&mut self, into: NodeId, from: NodeId, view: &PageView<'_>) -> Result<()> {
        let moved = std::mem::take(&mut self.nodes[from].children);
        for &child in &moved {
            self.nodes[child].parent = Some(into);
        }
        self.nodes[into].children.extend(moved);

        let inodes = std::mem::take(&mut self.nodes[from].inodes);
        self.nodes[into].inodes.extend(inodes);

        if let Some(parent) = self.nodes[from].parent {
            let key = self.nodes[from].key.clone();
            self.nodes[parent].del(&key);
            self.remove_child(parent, from);
        }
        self.discard_node(from, view)
    }

    // =========================================================================
    // Spill
    // =========================================================================

    /// Write a node (children first) to new pages, splitting as needed
    pub(crate) fn spill_node(&mut self, id: NodeId, view: &PageView<'_>) -> Result<()> {
        if self.nodes[id].spilled {
            return Ok(());
        }

        let mut children = self.nodes[id].children.clone();
        children.sort_by(|&a, &b| {
            let first = |n: NodeId| self.nodes[n].inodes.first().map(|i| i.key.clone());
            first(a).cmp(&first(b))
        });
        for child in children {
            self.spill_node(child, view)?;
        }
        // Only used to drive the spill above.
        self.nodes[id].children.clear();

        for piece in self.split_node(id) {
            self.free_node(piece, view)?;

            let count = self.nodes[piece].size().div_ceil(self.page_size);
            let pgid = self.allocate(count)?;
            {
                let buf = self.pages.get_mut(&pgid).ok_or_else(|| {
                    BoltError::Corrupted(format!("allocated page {} has no buffer", pgid))
                })?;
                self.nodes[piece].write(buf, pgid, (count - 1) as u32);
            }

            let node = &mut self.nodes[piece];
            node.pgid = pgid;
            node.spilled = true;

            if let Some(parent) = node.parent {
                let first = node.inodes.first().map(|i| i.key.clone()).unwrap_or_default();
                let old_key = if node.key.is_empty() {
                    first.clone()
                } else {
                    std::mem::take(&mut node.key)
                };
                node.key = first.clone();
                self.nodes[parent].put(&old_key, &first, Vec::new(), pgid, 0);
            }

            self.stats.spill += 1;
        }

        // A split root gained a fresh parent; write it too.
        if let Some(parent) = self.nodes[id].parent {
            if self.nodes[parent].pgid == 0 && !self.nodes[parent].spilled {
                return self.spill_node(parent, view);
            }
        }

        Ok(())
    }

    /// Break a node into page-sized pieces; the first piece is `id` itself
    fn split_node(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut pieces = vec![id];
        let mut current = id;
        while let Some(next) = self.split_two(current) {
            pieces.push(next);
            current = next;
        }
        pieces
    }

    fn split_two(&mut self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id];
        if node.inodes.len() <= MIN_KEYS_PER_PAGE * 2 || node.size_less_than(self.page_size) {
            return None;
        }

        let threshold = (self.page_size as f64 * self.fill_percent) as usize;
        let index = node.split_index(threshold);
        let (bucket, is_leaf) = (node.bucket, node.is_leaf);

        let parent = match node.parent {
            Some(parent) => parent,
            None => {
                let parent = self.nodes.len();
                let mut root = Node::new(bucket, false, None);
                root.children.push(id);
                self.nodes.push(root);
                self.nodes[id].parent = Some(parent);
                parent
            }
        };

        let mut next = Node::new(bucket, is_leaf, Some(parent));
        next.inodes = self.nodes[id].inodes.split_off(index);
        let next_id = self.nodes.len();
        self.nodes.push(next);
        self.nodes[parent].children.push(next_id);

        self.stats.split += 1;
        Some(next_id)
    }
}
