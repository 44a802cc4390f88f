use std::cmp::Ordering;

use anyhow::Result;

use super::BPlusTree;
use crate::buffer_pool::PageGuard;
use crate::indexes::generic_key::GenericKey;
use crate::pages::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::pages::INVALID_PAGE_ID;
use crate::tuple::Rid;

/// Range scan positioned on a read-latched leaf. Advancing to a sibling
/// uses try-latch: a splitter moving right-to-left against us would
/// deadlock with a blocking acquire, so on failure the current leaf is
/// released and the scan re-seeks from the root past the highest key
/// already returned. Keys consumed by the scan are strictly increasing.
pub struct BPlusTreeIterator<'a, const N: usize> {
    tree: &'a BPlusTree<N>,
    /// Current leaf, read-latched. `None` once exhausted.
    guard: Option<PageGuard>,
    index: usize,
    /// Re-seek bound: the last consumed key (exclusive), or the scan's
    /// start key (inclusive) before anything was consumed.
    bound: GenericKey<N>,
    bound_inclusive: bool,
}

impl<'a, const N: usize> BPlusTreeIterator<'a, N> {
    pub(super) fn begin(tree: &'a BPlusTree<N>) -> Result<Self> {
        let Some(guard) = tree.find_leftmost_leaf()? else {
            return Ok(Self::exhausted(tree));
        };
        let leaf = BPlusTreeLeafPage::<N>::new(guard.page());
        if leaf.header().size() == 0 {
            guard.latch().runlock();
            return Ok(Self::exhausted(tree));
        }
        let bound = leaf.key_at(0);
        Ok(Self {
            tree,
            guard: Some(guard),
            index: 0,
            bound,
            bound_inclusive: true,
        })
    }

    pub(super) fn begin_from(tree: &'a BPlusTree<N>, key: &GenericKey<N>) -> Result<Self> {
        let Some((guard, index)) = tree.find_leaf(key)? else {
            return Ok(Self::exhausted(tree));
        };
        let mut iter = Self {
            tree,
            guard: Some(guard),
            index,
            bound: *key,
            bound_inclusive: true,
        };
        // the start position may sit past the leaf's last entry
        iter.fix_position();
        Ok(iter)
    }

    fn exhausted(tree: &'a BPlusTree<N>) -> Self {
        Self {
            tree,
            guard: None,
            index: 0,
            bound: GenericKey::default(),
            bound_inclusive: false,
        }
    }

    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.latch().runlock();
        }
    }

    /// Settle on the next entry past the bound, walking leaves rightward
    /// and falling back to a root re-seek when the sibling latch is
    /// contended.
    fn fix_position(&mut self) {
        loop {
            let Some(guard) = self.guard.as_ref() else {
                return;
            };
            let leaf = BPlusTreeLeafPage::<N>::new(guard.page());
            let size = leaf.header().size() as usize;

            if self.index < size {
                let order = self
                    .tree
                    .comparator
                    .compare(&leaf.key_at(self.index), &self.bound);
                if order == Ordering::Greater || (self.bound_inclusive && order == Ordering::Equal)
                {
                    return;
                }
                self.index += 1;
                continue;
            }

            let next_page_id = leaf.next_page_id();
            if next_page_id == INVALID_PAGE_ID {
                self.release();
                return;
            }

            let Ok(next_guard) = self.tree.bpm.fetch_page(next_page_id) else {
                self.release();
                return;
            };
            if next_guard.latch().try_rlock() {
                self.release();
                self.guard = Some(next_guard);
                self.index = 0;
                continue;
            }

            // contended sibling: start over from the root, bounded by the
            // highest key observed so far
            drop(next_guard);
            self.release();
            match self.tree.find_leaf(&self.bound) {
                Ok(Some((guard, index))) => {
                    self.guard = Some(guard);
                    self.index = index;
                }
                _ => return,
            }
        }
    }
}

impl<const N: usize> Iterator for BPlusTreeIterator<'_, N> {
    type Item = (GenericKey<N>, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        let guard = self.guard.as_ref()?;
        let leaf = BPlusTreeLeafPage::<N>::new(guard.page());
        let key = leaf.key_at(self.index);
        let rid = leaf.value_at(self.index);

        self.bound = key;
        self.bound_inclusive = false;
        self.index += 1;
        self.fix_position();

        Some((key, rid))
    }
}

impl<const N: usize> Drop for BPlusTreeIterator<'_, N> {
    fn drop(&mut self) {
        self.release();
    }
}
