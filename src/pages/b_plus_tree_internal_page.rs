use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;

use super::b_plus_tree_page::{BPlusTreePage, IndexPageType, SIZE_TREE_PAGE_HEADER};
use super::{Page, PageId};
use crate::buffer_pool::BufferPoolManager;
use crate::indexes::generic_key::{GenericKey, KeyComparator};

/// Internal node: `size` (key, child page id) pairs behind the shared
/// header. The key at index 0 is unused; children partition the key space
/// by `key[i] <= k < key[i+1]`.
pub struct BPlusTreeInternalPage<'a, const N: usize> {
    page: &'a Page,
}

impl<'a, const N: usize> BPlusTreeInternalPage<'a, N> {
    const PAIR_SIZE: usize = N + 4;

    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    pub fn max_size() -> u32 {
        ((super::PAGE_SIZE - SIZE_TREE_PAGE_HEADER) / Self::PAIR_SIZE) as u32
    }

    pub fn header(&self) -> BPlusTreePage<'a> {
        BPlusTreePage::new(self.page)
    }

    pub fn init(&self, page_id: PageId, parent_id: PageId, max_size: u32) {
        let header = self.header();
        self.page.set_page_id(page_id);
        header.set_page_type(IndexPageType::Internal);
        header.set_parent_page_id(parent_id);
        header.set_max_size(max_size);
        header.set_size(0);
    }

    fn pair_offset(index: usize) -> usize {
        SIZE_TREE_PAGE_HEADER + index * Self::PAIR_SIZE
    }

    pub fn key_at(&self, index: usize) -> GenericKey<N> {
        let offset = Self::pair_offset(index);
        GenericKey::from_bytes(&self.page.data()[offset..offset + N])
    }

    pub fn set_key_at(&self, index: usize, key: &GenericKey<N>) {
        let offset = Self::pair_offset(index);
        self.page.data_mut()[offset..offset + N].copy_from_slice(key.as_bytes());
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.page.read_i32(Self::pair_offset(index) + N)
    }

    pub fn set_value_at(&self, index: usize, value: PageId) {
        self.page.write_i32(Self::pair_offset(index) + N, value);
    }

    /// Index of the child pointer equal to `value`, if present.
    pub fn value_index(&self, value: PageId) -> Option<usize> {
        (0..self.header().size() as usize).find(|&i| self.value_at(i) == value)
    }

    /// Child page that covers `key`.
    pub fn lookup(&self, key: &GenericKey<N>, comparator: &KeyComparator) -> PageId {
        let mut lb = 0usize;
        let mut ub = self.header().size() as usize;
        while ub - lb > 1 {
            let mid = (ub + lb) / 2;
            if comparator.compare(key, &self.key_at(mid)) != Ordering::Less {
                lb = mid;
            } else {
                ub = mid;
            }
        }
        self.value_at(lb)
    }

    /// Turn an empty page into a root with two children separated by
    /// `new_key`.
    pub fn populate_new_root(&self, old_value: PageId, new_key: &GenericKey<N>, new_value: PageId) {
        self.set_value_at(0, old_value);
        self.set_key_at(1, new_key);
        self.set_value_at(1, new_value);
        self.header().set_size(2);
    }

    /// Insert `(new_key, new_value)` right after the pair whose child is
    /// `old_value`.
    pub fn insert_node_after(&self, old_value: PageId, new_key: &GenericKey<N>, new_value: PageId) {
        let size = self.header().size() as usize;
        let mut index = size;
        for i in (0..size).rev() {
            if self.value_at(i) == old_value {
                index = i + 1;
                break;
            }
            // shift the pair right to open the gap
            let key = self.key_at(i);
            let value = self.value_at(i);
            self.set_key_at(i + 1, &key);
            self.set_value_at(i + 1, value);
        }
        assert!(index <= size, "old child not found in internal page");
        self.set_key_at(index, new_key);
        self.set_value_at(index, new_value);
        self.header().increase_size(1);
    }

    pub fn remove(&self, index: usize) {
        let size = self.header().size() as usize;
        for i in index..size - 1 {
            let key = self.key_at(i + 1);
            let value = self.value_at(i + 1);
            self.set_key_at(i, &key);
            self.set_value_at(i, value);
        }
        self.header().increase_size(-1);
    }

    /// Root collapse: drop to size 0 and hand back the only child.
    pub fn remove_and_return_only_child(&self) -> PageId {
        self.header().set_size(0);
        self.value_at(0)
    }

    /// Give everything to the left sibling, stitching `middle_key` (the
    /// parent separator) in as the first moved key.
    pub fn move_all_to(
        &self,
        recipient: &BPlusTreeInternalPage<'_, N>,
        middle_key: &GenericKey<N>,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        self.set_key_at(0, middle_key);
        let size = self.header().size() as usize;
        recipient.copy_n_from(self, 0, size, bpm)?;
        self.header().set_size(0);
        Ok(())
    }

    /// Split: move the upper half into `recipient`.
    pub fn move_half_to(
        &self,
        recipient: &BPlusTreeInternalPage<'_, N>,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        let size = self.header().size() as usize;
        let half = (size + 1) / 2;
        recipient.copy_n_from(self, half, size - half, bpm)?;
        self.header().set_size(half as u32);
        Ok(())
    }

    pub fn move_first_to_end_of(
        &self,
        recipient: &BPlusTreeInternalPage<'_, N>,
        middle_key: &GenericKey<N>,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        recipient.copy_last_from(middle_key, self.value_at(0), bpm)?;
        self.remove(0);
        Ok(())
    }

    pub fn move_last_to_front_of(
        &self,
        recipient: &BPlusTreeInternalPage<'_, N>,
        middle_key: &GenericKey<N>,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        recipient.set_key_at(0, middle_key);
        let last = self.header().size() as usize - 1;
        let key = self.key_at(last);
        let value = self.value_at(last);
        recipient.copy_first_from(&key, value, bpm)?;
        self.header().increase_size(-1);
        Ok(())
    }

    /// Append `count` pairs from `source` starting at `start`, adopting each
    /// moved child by rewriting its parent pointer.
    fn copy_n_from(
        &self,
        source: &BPlusTreeInternalPage<'_, N>,
        start: usize,
        count: usize,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        let size = self.header().size() as usize;
        for i in 0..count {
            let key = source.key_at(start + i);
            let value = source.value_at(start + i);
            self.set_key_at(size + i, &key);
            self.set_value_at(size + i, value);
            self.adopt_child(value, bpm)?;
        }
        self.header().increase_size(count as i32);
        Ok(())
    }

    fn copy_last_from(
        &self,
        key: &GenericKey<N>,
        value: PageId,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        let size = self.header().size() as usize;
        self.set_key_at(size, key);
        self.set_value_at(size, value);
        self.adopt_child(value, bpm)?;
        self.header().increase_size(1);
        Ok(())
    }

    fn copy_first_from(
        &self,
        key: &GenericKey<N>,
        value: PageId,
        bpm: &Arc<BufferPoolManager>,
    ) -> Result<()> {
        let size = self.header().size() as usize;
        for i in (0..size).rev() {
            let k = self.key_at(i);
            let v = self.value_at(i);
            self.set_key_at(i + 1, &k);
            self.set_value_at(i + 1, v);
        }
        self.set_key_at(0, key);
        self.set_value_at(0, value);
        self.adopt_child(value, bpm)?;
        self.header().increase_size(1);
        Ok(())
    }

    fn adopt_child(&self, child_id: PageId, bpm: &Arc<BufferPoolManager>) -> Result<()> {
        let guard = bpm.fetch_page(child_id)?;
        BPlusTreePage::new(guard.page()).set_parent_page_id(self.page.page_id());
        guard.mark_dirty();
        Ok(())
    }
}
