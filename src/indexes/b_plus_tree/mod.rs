pub mod iterator;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::warn;

use crate::buffer_pool::{BufferPoolManager, PageGuard};
use crate::indexes::generic_key::{GenericKey, KeyComparator};
use crate::latch::Latch;
use crate::pages::b_plus_tree_internal_page::BPlusTreeInternalPage;
use crate::pages::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::pages::b_plus_tree_page::BPlusTreePage;
use crate::pages::{PageId, INVALID_PAGE_ID};
use crate::tuple::Rid;
use iterator::BPlusTreeIterator;

/// Concurrent B+tree over fixed-width keys mapping to RIDs.
///
/// Latch protocol: the root id is guarded by a dedicated latch taken at
/// descent entry; page latches are acquired strictly top-down (crabbing)
/// and ancestors are released as soon as the newly latched child proves
/// safe. Nothing ever latches bottom-up, which gives a total order and
/// rules out writer deadlock; the iterator's sideways step uses try-latch
/// plus re-seek instead (see [`iterator`]).
pub struct BPlusTree<const N: usize> {
    root_page_id: AtomicI32,
    root_latch: Latch,
    bpm: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    leaf_max_size: u32,
    internal_max_size: u32,
}

/// Latched ancestors of the current descent (top-down order) plus pages
/// queued for deallocation once every latch is dropped.
struct Context {
    pages: VecDeque<PageGuard>,
    deleted: Vec<PageId>,
}

impl Context {
    fn new() -> Self {
        Self {
            pages: VecDeque::new(),
            deleted: Vec::new(),
        }
    }
}

fn is_safe_for_insert(page: &BPlusTreePage) -> bool {
    page.is_safe_for_insert()
}

fn is_safe_for_remove(page: &BPlusTreePage) -> bool {
    page.is_safe_for_remove()
}

impl<const N: usize> BPlusTree<N> {
    pub fn new(bpm: Arc<BufferPoolManager>, comparator: KeyComparator) -> Self {
        // internal nodes overfill by one entry before splitting
        let internal_max_size = BPlusTreeInternalPage::<N>::max_size() - 1;
        let leaf_max_size = BPlusTreeLeafPage::<N>::max_size();
        Self::with_max_sizes(bpm, comparator, leaf_max_size, internal_max_size)
    }

    /// Explicit fan-out, mainly to force deep trees in tests.
    pub fn with_max_sizes(
        bpm: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        assert!(leaf_max_size <= BPlusTreeLeafPage::<N>::max_size());
        assert!(internal_max_size < BPlusTreeInternalPage::<N>::max_size());
        Self {
            root_page_id: AtomicI32::new(INVALID_PAGE_ID),
            root_latch: Latch::new(),
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn comparator(&self) -> &KeyComparator {
        &self.comparator
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::Acquire) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::Acquire)
    }

    /// Point lookup with read-latch crabbing.
    pub fn get_value(&self, key: &GenericKey<N>) -> Result<Option<Rid>> {
        self.root_latch.wlock();
        if self.is_empty() {
            self.root_latch.wunlock();
            return Ok(None);
        }
        let mut root_locked = true;

        let mut guard = match self.bpm.fetch_page(self.root_page_id()) {
            Ok(guard) => guard,
            Err(e) => {
                self.root_latch.wunlock();
                return Err(e);
            }
        };
        guard.latch().rlock();

        loop {
            let header = BPlusTreePage::new(guard.page());
            if header.is_leaf() {
                break;
            }
            let child_id =
                BPlusTreeInternalPage::<N>::new(guard.page()).lookup(key, &self.comparator);
            let child = match self.bpm.fetch_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    if root_locked {
                        self.root_latch.wunlock();
                    }
                    guard.latch().runlock();
                    return Err(e);
                }
            };
            child.latch().rlock();
            if root_locked && header.is_root() {
                self.root_latch.wunlock();
                root_locked = false;
            }
            guard.latch().runlock();
            guard = child;
        }

        let result = BPlusTreeLeafPage::<N>::new(guard.page()).lookup(key, &self.comparator);
        if root_locked {
            self.root_latch.wunlock();
        }
        guard.latch().runlock();
        Ok(result)
    }

    /// Insert a key. Returns `false` on a duplicate.
    pub fn insert(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        self.root_latch.wlock();
        if self.is_empty() {
            let result = self.start_new_tree(key, rid);
            self.root_latch.wunlock();
            return result.map(|_| true);
        }
        self.insert_into_leaf(key, rid)
    }

    fn start_new_tree(&self, key: &GenericKey<N>, rid: Rid) -> Result<()> {
        let guard = self.bpm.new_page()?;
        let leaf = BPlusTreeLeafPage::<N>::new(guard.page());
        leaf.init(guard.page_id(), INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, rid, &self.comparator)?;
        guard.mark_dirty();
        self.root_page_id.store(guard.page_id(), Ordering::Release);
        Ok(())
    }

    /// Release every latched ancestor, top-down, dropping the root latch
    /// when the root page itself is among them.
    fn release_ancestors(&self, ctx: &mut Context, root_locked: &mut bool, dirty: bool) {
        while let Some(guard) = ctx.pages.pop_front() {
            if *root_locked && guard.page_id() == self.root_page_id() {
                self.root_latch.wunlock();
                *root_locked = false;
            }
            guard.latch().wunlock();
            if dirty {
                guard.mark_dirty();
            }
        }
    }

    /// Write-latch crabbing descent shared by insert and remove. `safe`
    /// decides when a just-latched child lets us release all ancestors.
    fn descend_for_write(
        &self,
        key: &GenericKey<N>,
        ctx: &mut Context,
        root_locked: &mut bool,
        safe: fn(&BPlusTreePage) -> bool,
    ) -> Result<()> {
        let guard = match self.bpm.fetch_page(self.root_page_id()) {
            Ok(guard) => guard,
            Err(e) => {
                self.root_latch.wunlock();
                *root_locked = false;
                return Err(e);
            }
        };
        guard.latch().wlock();
        ctx.pages.push_back(guard);

        loop {
            let current = ctx.pages.back().unwrap();
            let header = BPlusTreePage::new(current.page());
            if header.is_leaf() {
                return Ok(());
            }
            let child_id =
                BPlusTreeInternalPage::<N>::new(current.page()).lookup(key, &self.comparator);
            let child = match self.bpm.fetch_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    self.release_ancestors(ctx, root_locked, false);
                    if *root_locked {
                        self.root_latch.wunlock();
                        *root_locked = false;
                    }
                    return Err(e);
                }
            };
            child.latch().wlock();
            if safe(&BPlusTreePage::new(child.page())) {
                self.release_ancestors(ctx, root_locked, false);
            }
            ctx.pages.push_back(child);
        }
    }

    fn insert_into_leaf(&self, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        let mut ctx = Context::new();
        let mut root_locked = true;

        self.descend_for_write(key, &mut ctx, &mut root_locked, is_safe_for_insert)?;

        let result = {
            let leaf_guard = ctx.pages.back().unwrap();
            self.leaf_insert(leaf_guard, key, rid)
        };

        let inserted = match result {
            Ok(inserted) => inserted,
            Err(e) => {
                self.release_ancestors(&mut ctx, &mut root_locked, true);
                if root_locked {
                    self.root_latch.wunlock();
                }
                return Err(e);
            }
        };

        self.release_ancestors(&mut ctx, &mut root_locked, inserted);
        if root_locked {
            self.root_latch.wunlock();
        }
        Ok(inserted)
    }

    fn leaf_insert(&self, leaf_guard: &PageGuard, key: &GenericKey<N>, rid: Rid) -> Result<bool> {
        let leaf = BPlusTreeLeafPage::<N>::new(leaf_guard.page());
        if leaf.lookup(key, &self.comparator).is_some() {
            return Ok(false);
        }
        leaf.insert(key, rid, &self.comparator)?;

        if leaf.header().size() >= self.leaf_max_size {
            let new_guard = self.bpm.new_page()?;
            let new_leaf = BPlusTreeLeafPage::<N>::new(new_guard.page());
            new_leaf.init(
                new_guard.page_id(),
                leaf.header().parent_page_id(),
                self.leaf_max_size,
            );
            leaf.move_half_to(&new_leaf);

            let separator = new_leaf.key_at(0);
            self.insert_into_parent(leaf_guard, &separator, &new_guard)?;

            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_guard.page_id());
            new_guard.mark_dirty();
        }
        Ok(true)
    }

    /// Hook a freshly split `new_guard` into `old_guard`'s parent,
    /// splitting upward as needed. Every page touched here is either
    /// already write-latched by this descent or invisible to other
    /// threads.
    fn insert_into_parent(
        &self,
        old_guard: &PageGuard,
        separator: &GenericKey<N>,
        new_guard: &PageGuard,
    ) -> Result<()> {
        let old_header = BPlusTreePage::new(old_guard.page());
        if old_header.is_root() {
            let root_guard = self.bpm.new_page()?;
            let root = BPlusTreeInternalPage::<N>::new(root_guard.page());
            root.init(root_guard.page_id(), INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(old_guard.page_id(), separator, new_guard.page_id());

            old_header.set_parent_page_id(root_guard.page_id());
            BPlusTreePage::new(new_guard.page()).set_parent_page_id(root_guard.page_id());
            self.root_page_id.store(root_guard.page_id(), Ordering::Release);
            root_guard.mark_dirty();
            return Ok(());
        }

        let parent_guard = self.bpm.fetch_page(old_header.parent_page_id())?;
        let parent = BPlusTreeInternalPage::<N>::new(parent_guard.page());
        parent.insert_node_after(old_guard.page_id(), separator, new_guard.page_id());

        if parent.header().size() > self.internal_max_size {
            let new_parent_guard = self.bpm.new_page()?;
            let new_parent = BPlusTreeInternalPage::<N>::new(new_parent_guard.page());
            new_parent.init(
                new_parent_guard.page_id(),
                parent.header().parent_page_id(),
                self.internal_max_size,
            );
            parent.move_half_to(&new_parent, &self.bpm)?;

            let separator = new_parent.key_at(0);
            self.insert_into_parent(&parent_guard, &separator, &new_parent_guard)?;
            new_parent_guard.mark_dirty();
        }
        parent_guard.mark_dirty();
        Ok(())
    }

    /// Remove a key. Returns `false` when it was not present.
    pub fn remove(&self, key: &GenericKey<N>) -> Result<bool> {
        self.root_latch.wlock();
        if self.is_empty() {
            self.root_latch.wunlock();
            return Ok(false);
        }
        let mut ctx = Context::new();
        let mut root_locked = true;

        self.descend_for_write(key, &mut ctx, &mut root_locked, is_safe_for_remove)?;

        let leaf_guard = ctx.pages.pop_back().unwrap();
        let removed = BPlusTreeLeafPage::<N>::new(leaf_guard.page())
            .remove_and_delete_record(key, &self.comparator);

        let mut result = Ok(removed);
        if removed {
            let leaf = BPlusTreeLeafPage::<N>::new(leaf_guard.page());
            if leaf.header().size() < leaf.header().min_size() {
                result = self
                    .coalesce_or_redistribute(&leaf_guard, &mut ctx)
                    .map(|_| removed);
            }
        }
        ctx.pages.push_back(leaf_guard);

        self.release_ancestors(&mut ctx, &mut root_locked, removed);
        if root_locked {
            self.root_latch.wunlock();
        }

        // deallocation waits until every latch above is gone
        for page_id in ctx.deleted {
            if let Err(e) = self.bpm.delete_page(page_id) {
                warn!("failed to delete emptied index page {page_id}: {e}");
            }
        }
        result
    }

    /// Fix an underflowing node by merging with or borrowing from a
    /// sibling, recursing up when the parent underflows in turn.
    fn coalesce_or_redistribute(&self, node_guard: &PageGuard, ctx: &mut Context) -> Result<()> {
        let header = BPlusTreePage::new(node_guard.page());
        if header.is_root() {
            if self.adjust_root(node_guard)? {
                ctx.deleted.push(node_guard.page_id());
            }
            return Ok(());
        }

        // the parent is already write-latched by this descent; fetching it
        // again just adds a pin
        let parent_guard = self.bpm.fetch_page(header.parent_page_id())?;
        let parent = BPlusTreeInternalPage::<N>::new(parent_guard.page());
        let index = parent
            .value_index(node_guard.page_id())
            .expect("underflowing node missing from its parent");
        let sibling_index = if index == 0 { 1 } else { index - 1 };

        let sibling_guard = self.bpm.fetch_page(parent.value_at(sibling_index))?;
        sibling_guard.latch().wlock();

        let is_leaf = header.is_leaf();
        let combined = header.size() + BPlusTreePage::new(sibling_guard.page()).size();
        let fits = if is_leaf {
            combined < header.max_size()
        } else {
            combined <= header.max_size()
        };

        if fits {
            // merge the right-hand node into the left-hand one
            let (left, right, right_index) = if index == 0 {
                (node_guard, &sibling_guard, 1)
            } else {
                (&sibling_guard, node_guard, index)
            };
            if is_leaf {
                BPlusTreeLeafPage::<N>::new(right.page())
                    .move_all_to(&BPlusTreeLeafPage::<N>::new(left.page()));
            } else {
                let middle_key = parent.key_at(right_index);
                BPlusTreeInternalPage::<N>::new(right.page()).move_all_to(
                    &BPlusTreeInternalPage::<N>::new(left.page()),
                    &middle_key,
                    &self.bpm,
                )?;
            }
            parent.remove(right_index);
            ctx.deleted.push(right.page_id());
            left.mark_dirty();
            parent_guard.mark_dirty();

            if parent.header().size() < parent.header().min_size() {
                self.coalesce_or_redistribute(&parent_guard, ctx)?;
            }
        } else {
            // borrow a single entry from the sibling
            let sibling_page = sibling_guard.page();
            if index == 0 {
                if is_leaf {
                    let sibling = BPlusTreeLeafPage::<N>::new(sibling_page);
                    sibling.move_first_to_end_of(&BPlusTreeLeafPage::<N>::new(node_guard.page()));
                    parent.set_key_at(1, &sibling.key_at(0));
                } else {
                    let sibling = BPlusTreeInternalPage::<N>::new(sibling_page);
                    let middle_key = parent.key_at(1);
                    sibling.move_first_to_end_of(
                        &BPlusTreeInternalPage::<N>::new(node_guard.page()),
                        &middle_key,
                        &self.bpm,
                    )?;
                    parent.set_key_at(1, &sibling.key_at(0));
                }
            } else if is_leaf {
                let sibling = BPlusTreeLeafPage::<N>::new(sibling_page);
                let node = BPlusTreeLeafPage::<N>::new(node_guard.page());
                sibling.move_last_to_front_of(&node);
                parent.set_key_at(index, &node.key_at(0));
            } else {
                let sibling = BPlusTreeInternalPage::<N>::new(sibling_page);
                let node = BPlusTreeInternalPage::<N>::new(node_guard.page());
                let middle_key = parent.key_at(index);
                sibling.move_last_to_front_of(&node, &middle_key, &self.bpm)?;
                parent.set_key_at(index, &node.key_at(0));
            }
            node_guard.mark_dirty();
            sibling_guard.mark_dirty();
            parent_guard.mark_dirty();
        }

        // the sibling stays latched until the whole removal completes
        ctx.pages.push_back(sibling_guard);
        Ok(())
    }

    /// Root collapse: an internal root with one child hands the tree to
    /// that child; an empty leaf root empties the tree.
    fn adjust_root(&self, root_guard: &PageGuard) -> Result<bool> {
        let header = BPlusTreePage::new(root_guard.page());
        if !header.is_leaf() && header.size() == 1 {
            let child_id =
                BPlusTreeInternalPage::<N>::new(root_guard.page()).remove_and_return_only_child();
            let child_guard = self.bpm.fetch_page(child_id)?;
            BPlusTreePage::new(child_guard.page()).set_parent_page_id(INVALID_PAGE_ID);
            child_guard.mark_dirty();
            self.root_page_id.store(child_id, Ordering::Release);
            root_guard.mark_dirty();
            return Ok(true);
        }
        if header.is_leaf() && header.size() == 0 {
            self.root_page_id.store(INVALID_PAGE_ID, Ordering::Release);
            root_guard.mark_dirty();
            return Ok(true);
        }
        Ok(false)
    }

    /// Read-latched leaf covering `key`, plus the index of the first entry
    /// not below it. Used by lookups from the iterator's re-seek path.
    fn find_leaf(&self, key: &GenericKey<N>) -> Result<Option<(PageGuard, usize)>> {
        self.root_latch.wlock();
        if self.is_empty() {
            self.root_latch.wunlock();
            return Ok(None);
        }
        let mut root_locked = true;

        let mut guard = match self.bpm.fetch_page(self.root_page_id()) {
            Ok(guard) => guard,
            Err(e) => {
                self.root_latch.wunlock();
                return Err(e);
            }
        };
        guard.latch().rlock();

        loop {
            let header = BPlusTreePage::new(guard.page());
            if header.is_leaf() {
                break;
            }
            let child_id =
                BPlusTreeInternalPage::<N>::new(guard.page()).lookup(key, &self.comparator);
            let child = match self.bpm.fetch_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    if root_locked {
                        self.root_latch.wunlock();
                    }
                    guard.latch().runlock();
                    return Err(e);
                }
            };
            child.latch().rlock();
            if root_locked && header.is_root() {
                self.root_latch.wunlock();
                root_locked = false;
            }
            guard.latch().runlock();
            guard = child;
        }

        if root_locked {
            self.root_latch.wunlock();
        }
        let index = BPlusTreeLeafPage::<N>::new(guard.page()).key_index(key, &self.comparator);
        Ok(Some((guard, index)))
    }

    /// Read-latched leftmost leaf, for full scans.
    fn find_leftmost_leaf(&self) -> Result<Option<PageGuard>> {
        self.root_latch.wlock();
        if self.is_empty() {
            self.root_latch.wunlock();
            return Ok(None);
        }
        let mut root_locked = true;

        let mut guard = match self.bpm.fetch_page(self.root_page_id()) {
            Ok(guard) => guard,
            Err(e) => {
                self.root_latch.wunlock();
                return Err(e);
            }
        };
        guard.latch().rlock();

        loop {
            let header = BPlusTreePage::new(guard.page());
            if header.is_leaf() {
                break;
            }
            let child_id = BPlusTreeInternalPage::<N>::new(guard.page()).value_at(0);
            let child = match self.bpm.fetch_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    if root_locked {
                        self.root_latch.wunlock();
                    }
                    guard.latch().runlock();
                    return Err(e);
                }
            };
            child.latch().rlock();
            if root_locked && header.is_root() {
                self.root_latch.wunlock();
                root_locked = false;
            }
            guard.latch().runlock();
            guard = child;
        }

        if root_locked {
            self.root_latch.wunlock();
        }
        Ok(Some(guard))
    }

    /// Scan from the smallest key.
    pub fn iter(&self) -> Result<BPlusTreeIterator<'_, N>> {
        BPlusTreeIterator::begin(self)
    }

    /// Scan from the first key not below `key`.
    pub fn iter_from(&self, key: &GenericKey<N>) -> Result<BPlusTreeIterator<'_, N>> {
        BPlusTreeIterator::begin_from(self, key)
    }
}
