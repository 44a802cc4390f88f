use std::cmp::Ordering;

use anyhow::{bail, Result};

use super::b_plus_tree_page::{BPlusTreePage, IndexPageType, SIZE_TREE_PAGE_HEADER};
use super::{Page, PageId, INVALID_PAGE_ID};
use crate::errors::Error;
use crate::indexes::generic_key::{GenericKey, KeyComparator};
use crate::tuple::{Rid, RidExt, RID_SIZE};

/// Leaf node: `size` (key, RID) pairs behind the shared header plus a
/// `next_page_id` forming the singly-linked sibling list in key order.
pub struct BPlusTreeLeafPage<'a, const N: usize> {
    page: &'a Page,
}

const OFFSET_NEXT_PAGE_ID: usize = SIZE_TREE_PAGE_HEADER;
const LEAF_HEADER: usize = SIZE_TREE_PAGE_HEADER + 4;

impl<'a, const N: usize> BPlusTreeLeafPage<'a, N> {
    const PAIR_SIZE: usize = N + RID_SIZE;

    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    pub fn max_size() -> u32 {
        ((super::PAGE_SIZE - LEAF_HEADER) / Self::PAIR_SIZE) as u32
    }

    pub fn header(&self) -> BPlusTreePage<'a> {
        BPlusTreePage::new(self.page)
    }

    pub fn init(&self, page_id: PageId, parent_id: PageId, max_size: u32) {
        let header = self.header();
        self.page.set_page_id(page_id);
        header.set_page_type(IndexPageType::Leaf);
        header.set_parent_page_id(parent_id);
        header.set_max_size(max_size);
        header.set_size(0);
        self.set_next_page_id(INVALID_PAGE_ID);
    }

    pub fn next_page_id(&self) -> PageId {
        self.page.read_i32(OFFSET_NEXT_PAGE_ID)
    }

    pub fn set_next_page_id(&self, next: PageId) {
        self.page.write_i32(OFFSET_NEXT_PAGE_ID, next);
    }

    fn pair_offset(index: usize) -> usize {
        LEAF_HEADER + index * Self::PAIR_SIZE
    }

    pub fn key_at(&self, index: usize) -> GenericKey<N> {
        let offset = Self::pair_offset(index);
        GenericKey::from_bytes(&self.page.data()[offset..offset + N])
    }

    fn set_key_at(&self, index: usize, key: &GenericKey<N>) {
        let offset = Self::pair_offset(index);
        self.page.data_mut()[offset..offset + N].copy_from_slice(key.as_bytes());
    }

    pub fn value_at(&self, index: usize) -> Rid {
        let offset = Self::pair_offset(index) + N;
        Rid::from_bytes(&self.page.data()[offset..offset + RID_SIZE])
    }

    fn set_value_at(&self, index: usize, value: Rid) {
        let offset = Self::pair_offset(index) + N;
        self.page.data_mut()[offset..offset + RID_SIZE].copy_from_slice(&value.to_bytes());
    }

    /// First index whose key is >= `key`; `size` when every key is smaller.
    pub fn key_index(&self, key: &GenericKey<N>, comparator: &KeyComparator) -> usize {
        let mut lb = 0usize;
        let mut ub = self.header().size() as usize;
        while lb < ub {
            let mid = (lb + ub) / 2;
            if comparator.compare(&self.key_at(mid), key) == Ordering::Less {
                lb = mid + 1;
            } else {
                ub = mid;
            }
        }
        lb
    }

    pub fn lookup(&self, key: &GenericKey<N>, comparator: &KeyComparator) -> Option<Rid> {
        let index = self.key_index(key, comparator);
        if index < self.header().size() as usize
            && comparator.compare(&self.key_at(index), key) == Ordering::Equal
        {
            Some(self.value_at(index))
        } else {
            None
        }
    }

    pub fn insert(&self, key: &GenericKey<N>, value: Rid, comparator: &KeyComparator) -> Result<()> {
        let size = self.header().size() as usize;
        let index = self.key_index(key, comparator);
        if index < size && comparator.compare(&self.key_at(index), key) == Ordering::Equal {
            bail!(Error::DuplicateKey);
        }

        for i in (index..size).rev() {
            let k = self.key_at(i);
            let v = self.value_at(i);
            self.set_key_at(i + 1, &k);
            self.set_value_at(i + 1, v);
        }
        self.set_key_at(index, key);
        self.set_value_at(index, value);
        self.header().increase_size(1);
        Ok(())
    }

    /// Remove the entry for `key` if present; returns whether it existed.
    pub fn remove_and_delete_record(&self, key: &GenericKey<N>, comparator: &KeyComparator) -> bool {
        let size = self.header().size() as usize;
        let index = self.key_index(key, comparator);
        if index >= size || comparator.compare(&self.key_at(index), key) != Ordering::Equal {
            return false;
        }
        for i in index..size - 1 {
            let k = self.key_at(i + 1);
            let v = self.value_at(i + 1);
            self.set_key_at(i, &k);
            self.set_value_at(i, v);
        }
        self.header().increase_size(-1);
        true
    }

    /// Split: keep the lower half, move the rest into the fresh `recipient`.
    pub fn move_half_to(&self, recipient: &BPlusTreeLeafPage<'_, N>) {
        let size = self.header().size() as usize;
        let half = (size + 1) / 2;
        recipient.copy_n_from(self, half, size - half);
        self.header().set_size(half as u32);
    }

    /// Coalesce: append everything into the left sibling, which also takes
    /// over our sibling pointer.
    pub fn move_all_to(&self, recipient: &BPlusTreeLeafPage<'_, N>) {
        let size = self.header().size() as usize;
        recipient.copy_n_from(self, 0, size);
        recipient.set_next_page_id(self.next_page_id());
        self.header().set_size(0);
    }

    pub fn move_first_to_end_of(&self, recipient: &BPlusTreeLeafPage<'_, N>) {
        let key = self.key_at(0);
        let value = self.value_at(0);
        let size = recipient.header().size() as usize;
        recipient.set_key_at(size, &key);
        recipient.set_value_at(size, value);
        recipient.header().increase_size(1);

        let size = self.header().size() as usize;
        for i in 0..size - 1 {
            let k = self.key_at(i + 1);
            let v = self.value_at(i + 1);
            self.set_key_at(i, &k);
            self.set_value_at(i, v);
        }
        self.header().increase_size(-1);
    }

    pub fn move_last_to_front_of(&self, recipient: &BPlusTreeLeafPage<'_, N>) {
        let last = self.header().size() as usize - 1;
        let key = self.key_at(last);
        let value = self.value_at(last);
        self.header().increase_size(-1);

        let size = recipient.header().size() as usize;
        for i in (0..size).rev() {
            let k = recipient.key_at(i);
            let v = recipient.value_at(i);
            recipient.set_key_at(i + 1, &k);
            recipient.set_value_at(i + 1, v);
        }
        recipient.set_key_at(0, &key);
        recipient.set_value_at(0, value);
        recipient.header().increase_size(1);
    }

    fn copy_n_from(&self, source: &BPlusTreeLeafPage<'_, N>, start: usize, count: usize) {
        let size = self.header().size() as usize;
        for i in 0..count {
            let key = source.key_at(start + i);
            let value = source.value_at(start + i);
            self.set_key_at(size + i, &key);
            self.set_value_at(size + i, value);
        }
        self.header().increase_size(count as i32);
    }
}
