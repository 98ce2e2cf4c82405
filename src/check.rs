//! Consistency check
//!
//! Walks every tree reachable from the transaction's meta page and verifies:
//! - every page id is below the high-water mark
//! - no page is both reachable and free, or reachable twice
//! - every page below the high-water mark is reachable or free
//! - keys are strictly ascending and within the bounds set by the parent

use std::collections::HashSet;

use crate::error::{BoltError, Result};
use crate::page::{BucketHeader, FreeList, Page, PageKind, PageView, Pgid, BUCKET_LEAF_FLAG};
use crate::tx::Tx;

/// Accumulated state of one check run
struct Checker<'a> {
    view: PageView<'a>,
    high_water: Pgid,
    freelist: FreeList,
    reachable: HashSet<Pgid>,
    problems: Vec<String>,
}

impl<'a> Checker<'a> {
    /// Mark a page and its overflow pages as in use
    ///
    /// Returns false if any of them was already marked or lies beyond the
    /// high-water mark.
    fn mark(&mut self, pgid: Pgid, overflow: u32) -> bool {
        let last = pgid.saturating_add(overflow as u64);
        let mut fresh = true;
        if last >= self.high_water {
            self.problems.push(format!(
                "page {}: ends at page {}, beyond high-water mark {}",
                pgid, last, self.high_water
            ));
            fresh = false;
        }

        for id in pgid..=last.min(self.high_water.saturating_sub(1)) {
            if self.freelist.is_free(id) {
                self.problems.push(format!("page {}: reachable but free", id));
            }
            if !self.reachable.insert(id) {
                self.problems.push(format!("page {}: referenced more than once", id));
                fresh = false;
            }
        }
        fresh
    }

    fn page(&mut self, pgid: Pgid) -> Option<Page<'a>> {
        match self.view.page(pgid) {
            Ok(page) => Some(page),
            Err(e) => {
                self.problems.push(format!("page {}: {}", pgid, e));
                None
            }
        }
    }

    /// Check one bucket tree; `lower` is the separator pointing at this page
    fn tree(&mut self, pgid: Pgid, lower: Option<&[u8]>, upper: Option<&[u8]>) {
        let Some(page) = self.page(pgid) else {
            return;
        };
        // Do not descend twice into a shared or cyclic subtree.
        if !self.mark(pgid, page.overflow()) {
            return;
        }

        let kind = page.kind();
        if !matches!(kind, Some(PageKind::Branch) | Some(PageKind::Leaf)) {
            self.problems.push(format!(
                "page {}: expected branch or leaf, found flags 0x{:02x}",
                pgid,
                page.flags()
            ));
            return;
        }
        if let Err(e) = page.check_bounds() {
            self.problems.push(e.to_string());
            return;
        }

        let count = page.count();
        if count == 0 && kind == Some(PageKind::Branch) {
            self.problems.push(format!("page {}: empty branch", pgid));
            return;
        }

        for i in 0..count {
            let key = page.key_at(i);
            if i > 0 && page.key_at(i - 1) >= key {
                self.problems.push(format!("page {}: keys out of order at {}", pgid, i));
            }
            if lower.is_some_and(|lower| key < lower) {
                self.problems
                    .push(format!("page {}: key {} below parent separator", pgid, i));
            }
            if upper.is_some_and(|upper| key >= upper) {
                self.problems
                    .push(format!("page {}: key {} above next separator", pgid, i));
            }
        }

        if page.is_branch() {
            for i in 0..count {
                let elem = page.branch_element(i);
                let next = (i + 1 < count).then(|| page.key_at(i + 1)).or(upper);
                self.tree(elem.pgid, Some(elem.key), next);
            }
            return;
        }

        for i in 0..count {
            let elem = page.leaf_element(i);
            if elem.flags & BUCKET_LEAF_FLAG == 0 {
                continue;
            }
            match BucketHeader::decode(elem.value) {
                Ok(header) if header.root != 0 => self.tree(header.root, None, None),
                Ok(_) => self
                    .problems
                    .push(format!("page {}: bucket {} has no root page", pgid, i)),
                Err(e) => self.problems.push(format!("page {}: {}", pgid, e)),
            }
        }
    }
}

impl Tx {
    /// Verify the structure of this transaction's snapshot
    ///
    /// Returns `Corrupted` listing every problem found.
    pub fn check(&self) -> Result<()> {
        let view = self.view();
        let meta = self.inner.borrow().meta;

        let freelist_page = view.page(meta.freelist)?;
        let freelist = FreeList::read(&freelist_page)?;

        let mut checker = Checker {
            view,
            high_water: meta.pgid,
            freelist,
            reachable: HashSet::new(),
            problems: Vec::new(),
        };

        for id in checker.freelist.all_ids() {
            if id >= meta.pgid {
                checker
                    .problems
                    .push(format!("page {}: free but beyond high-water mark", id));
            }
        }

        checker.reachable.insert(0);
        checker.reachable.insert(1);
        checker.mark(meta.freelist, freelist_page.overflow());
        checker.tree(meta.root.root, None, None);

        for id in 2..meta.pgid {
            if !checker.reachable.contains(&id) && !checker.freelist.is_free(id) {
                checker.problems.push(format!("page {}: unreachable and not free", id));
            }
        }

        if checker.problems.is_empty() {
            Ok(())
        } else {
            Err(BoltError::Corrupted(checker.problems.join("; ")))
        }
    }
}
