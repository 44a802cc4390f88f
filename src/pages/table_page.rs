use anyhow::{bail, Result};

use super::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::errors::Error;
use crate::tuple::{Rid, SlotId, Tuple};

/// Slotted page layout:
///
/// ```text
/// | page_id(4) | lsn(4) | prev_page_id(4) | next_page_id(4) |
/// | free_space_pointer(4) | tuple_count(4) | slot_0 | slot_1 | ... free ...
///                                  ... | tuple_1 data | tuple_0 data |
/// ```
///
/// Each slot is `(offset u32, size u32)`. Slot metadata grows down from the
/// header, tuple data grows up from the end of the page. A slot with size 0
/// is free; the high bit of the size marks a mark-deleted tuple.
pub struct TablePage<'a> {
    page: &'a Page,
}

pub const SIZE_TABLE_PAGE_HEADER: usize = 24;
pub const SIZE_SLOT: usize = 8;

const OFFSET_PREV_PAGE_ID: usize = 8;
const OFFSET_NEXT_PAGE_ID: usize = 12;
const OFFSET_FREE_SPACE_PTR: usize = 16;
const OFFSET_TUPLE_COUNT: usize = 20;

/// High bit of a 32-bit slot size.
const DELETE_MASK: u32 = 1 << 31;

/// Lock acquisition hook invoked with the chosen RID before the tuple bytes
/// are installed, so no other transaction can observe the slot unlocked.
pub type RidCallback<'a> = dyn FnMut(Rid) -> Result<()> + 'a;

impl<'a> TablePage<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    /// Set up an empty slotted page at the tail of the heap's page list.
    pub fn init(&self, page_id: PageId, prev_page_id: PageId) {
        self.page.set_page_id(page_id);
        self.set_prev_page_id(prev_page_id);
        self.set_next_page_id(INVALID_PAGE_ID);
        self.set_free_space_pointer(PAGE_SIZE as u32);
        self.set_tuple_count(0);
    }

    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }

    pub fn prev_page_id(&self) -> PageId {
        self.page.read_i32(OFFSET_PREV_PAGE_ID)
    }

    pub fn set_prev_page_id(&self, prev: PageId) {
        self.page.write_i32(OFFSET_PREV_PAGE_ID, prev);
    }

    pub fn next_page_id(&self) -> PageId {
        self.page.read_i32(OFFSET_NEXT_PAGE_ID)
    }

    pub fn set_next_page_id(&self, next: PageId) {
        self.page.write_i32(OFFSET_NEXT_PAGE_ID, next);
    }

    fn free_space_pointer(&self) -> u32 {
        self.page.read_u32(OFFSET_FREE_SPACE_PTR)
    }

    fn set_free_space_pointer(&self, ptr: u32) {
        self.page.write_u32(OFFSET_FREE_SPACE_PTR, ptr);
    }

    pub fn tuple_count(&self) -> u32 {
        self.page.read_u32(OFFSET_TUPLE_COUNT)
    }

    fn set_tuple_count(&self, count: u32) {
        self.page.write_u32(OFFSET_TUPLE_COUNT, count);
    }

    fn free_space_remaining(&self) -> usize {
        self.free_space_pointer() as usize
            - SIZE_TABLE_PAGE_HEADER
            - SIZE_SLOT * self.tuple_count() as usize
    }

    fn tuple_offset_at(&self, slot_id: SlotId) -> u32 {
        self.page
            .read_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot_id as usize)
    }

    fn set_tuple_offset_at(&self, slot_id: SlotId, offset: u32) {
        self.page
            .write_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot_id as usize, offset);
    }

    fn tuple_size_at(&self, slot_id: SlotId) -> u32 {
        self.page
            .read_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot_id as usize + 4)
    }

    fn set_tuple_size_at(&self, slot_id: SlotId, size: u32) {
        self.page
            .write_u32(SIZE_TABLE_PAGE_HEADER + SIZE_SLOT * slot_id as usize + 4, size);
    }

    fn is_deleted(size: u32) -> bool {
        size & DELETE_MASK != 0 || size == 0
    }

    /// Insert a tuple, reusing a free slot if one exists. Returns `Ok(None)`
    /// when the page has no room, so the heap can move to the next page.
    /// `on_rid` runs after the slot is chosen but before any byte changes.
    pub fn insert_tuple(
        &self,
        tuple: &Tuple,
        mut on_rid: Option<&mut RidCallback<'_>>,
    ) -> Result<Option<Rid>> {
        assert!(tuple.size() > 0, "cannot insert an empty tuple");

        if self.free_space_remaining() < tuple.size() {
            return Ok(None);
        }

        let tuple_count = self.tuple_count();
        let mut slot_id = tuple_count;
        for i in 0..tuple_count {
            if self.tuple_size_at(i) == 0 {
                slot_id = i;
                break;
            }
        }

        // a fresh slot additionally needs room for its own metadata
        if slot_id == tuple_count && self.free_space_remaining() < tuple.size() + SIZE_SLOT {
            return Ok(None);
        }

        let rid = (self.page_id(), slot_id);
        if let Some(callback) = on_rid.as_deref_mut() {
            callback(rid)?;
        }

        let free_space_ptr = self.free_space_pointer() - tuple.size() as u32;
        self.set_free_space_pointer(free_space_ptr);
        self.page.data_mut()[free_space_ptr as usize..free_space_ptr as usize + tuple.size()]
            .copy_from_slice(tuple.data());

        self.set_tuple_offset_at(slot_id, free_space_ptr);
        self.set_tuple_size_at(slot_id, tuple.size() as u32);
        if slot_id == tuple_count {
            self.set_tuple_count(tuple_count + 1);
        }

        Ok(Some(rid))
    }

    /// Set the deletion flag. Returns `false` when the tuple is already
    /// deleted or the slot is empty, which callers treat as a skip.
    pub fn mark_delete(&self, rid: Rid) -> bool {
        let slot_id = rid.1;
        if slot_id >= self.tuple_count() {
            return false;
        }
        let size = self.tuple_size_at(slot_id);
        if Self::is_deleted(size) {
            return false;
        }
        self.set_tuple_size_at(slot_id, size | DELETE_MASK);
        true
    }

    /// Reverse a mark-delete on abort.
    pub fn rollback_delete(&self, rid: Rid) {
        let slot_id = rid.1;
        assert!(slot_id < self.tuple_count(), "rollback of an unknown slot");
        let size = self.tuple_size_at(slot_id);
        self.set_tuple_size_at(slot_id, size & !DELETE_MASK);
    }

    /// Physically remove the tuple and compact the data region. Returns the
    /// removed tuple so the caller can log it.
    pub fn apply_delete(&self, rid: Rid) -> Result<Tuple> {
        let slot_id = rid.1;
        if slot_id >= self.tuple_count() {
            bail!(Error::TupleNotFound);
        }
        let raw_size = self.tuple_size_at(slot_id);
        if raw_size == 0 {
            bail!(Error::TupleNotFound);
        }
        let size = raw_size & !DELETE_MASK;
        let offset = self.tuple_offset_at(slot_id);

        let mut tuple = Tuple::from_bytes(
            &self.page.data()[offset as usize..(offset + size) as usize],
        );
        tuple.set_rid(rid);

        // shift everything physically below the freed tuple up by its size
        let free_space_ptr = self.free_space_pointer();
        self.page.data_mut().copy_within(
            free_space_ptr as usize..offset as usize,
            (free_space_ptr + size) as usize,
        );
        self.set_free_space_pointer(free_space_ptr + size);

        for i in 0..self.tuple_count() {
            let offset_i = self.tuple_offset_at(i);
            if self.tuple_size_at(i) != 0 && offset_i < offset {
                self.set_tuple_offset_at(i, offset_i + size);
            }
        }

        self.set_tuple_offset_at(slot_id, 0);
        self.set_tuple_size_at(slot_id, 0);

        Ok(tuple)
    }

    /// In-place update. Returns the old tuple for undo logging. Fails on a
    /// deleted tuple or when the page cannot fit the new size.
    pub fn update_tuple(&self, new_tuple: &Tuple, rid: Rid) -> Result<Tuple> {
        assert!(new_tuple.size() > 0, "cannot update to an empty tuple");
        let slot_id = rid.1;
        if slot_id >= self.tuple_count() {
            bail!(Error::TupleNotFound);
        }
        let size = self.tuple_size_at(slot_id);
        if Self::is_deleted(size) {
            bail!(Error::TupleNotFound);
        }
        if self.free_space_remaining() + (size as usize) < new_tuple.size() {
            bail!(Error::TupleTooLarge(
                self.free_space_remaining() + size as usize,
                new_tuple.size()
            ));
        }

        let offset = self.tuple_offset_at(slot_id);
        let mut old_tuple =
            Tuple::from_bytes(&self.page.data()[offset as usize..(offset + size) as usize]);
        old_tuple.set_rid(rid);

        // move the data physically below us so the new size fits in place
        let free_space_ptr = self.free_space_pointer();
        let delta = size as i64 - new_tuple.size() as i64;
        let dst = (free_space_ptr as i64 + delta) as usize;
        self.page
            .data_mut()
            .copy_within(free_space_ptr as usize..offset as usize, dst);

        let new_offset = (offset as i64 + delta) as usize;
        self.page.data_mut()[new_offset..new_offset + new_tuple.size()]
            .copy_from_slice(new_tuple.data());
        self.set_tuple_size_at(slot_id, new_tuple.size() as u32);
        self.set_free_space_pointer((free_space_ptr as i64 + delta) as u32);

        // offsets have no correlation with slot order: rewrite every slot
        // that pointed at or below the moved region, including our own
        for i in 0..self.tuple_count() {
            let offset_i = self.tuple_offset_at(i);
            if self.tuple_size_at(i) != 0 && offset_i < offset + size {
                self.set_tuple_offset_at(i, (offset_i as i64 + delta) as u32);
            }
        }

        Ok(old_tuple)
    }

    /// Read a tuple. `None` means the slot is empty or mark-deleted and the
    /// caller should skip it.
    pub fn get_tuple(&self, rid: Rid) -> Option<Tuple> {
        let slot_id = rid.1;
        if slot_id >= self.tuple_count() {
            return None;
        }
        let size = self.tuple_size_at(slot_id);
        if Self::is_deleted(size) {
            return None;
        }
        let offset = self.tuple_offset_at(slot_id);
        let mut tuple =
            Tuple::from_bytes(&self.page.data()[offset as usize..(offset + size) as usize]);
        tuple.set_rid(rid);
        Some(tuple)
    }

    pub fn first_tuple_rid(&self) -> Option<Rid> {
        (0..self.tuple_count())
            .find(|&i| !Self::is_deleted(self.tuple_size_at(i)))
            .map(|i| (self.page_id(), i))
    }

    /// Next live rid on this page after `rid`, if any.
    pub fn next_tuple_rid(&self, rid: Rid) -> Option<Rid> {
        (rid.1 + 1..self.tuple_count())
            .find(|&i| !Self::is_deleted(self.tuple_size_at(i)))
            .map(|i| (self.page_id(), i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::schema::{Column, Schema};
    use crate::types::{TypeId, Value};

    fn int_schema() -> Schema {
        Schema::new(vec![Column::new("v", TypeId::Integer)])
    }

    fn int_tuple(v: i32) -> Tuple {
        Tuple::new(vec![Value::Integer(v)], &int_schema())
    }

    fn fresh_page() -> Page {
        let page = Page::new();
        TablePage::new(&page).init(1, INVALID_PAGE_ID);
        page
    }

    #[test]
    fn test_insert_then_read() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let rid = view.insert_tuple(&int_tuple(7), None)?.unwrap();
        assert_eq!(rid, (1, 0));

        let tuple = view.get_tuple(rid).unwrap();
        assert_eq!(tuple.value_at(&int_schema(), 0), Value::Integer(7));
        assert_eq!(tuple.rid(), rid);
        Ok(())
    }

    #[test]
    fn test_fill_page() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let mut inserted = 0;
        while view.insert_tuple(&int_tuple(inserted), None)?.is_some() {
            inserted += 1;
        }
        // 4 data bytes + 8 slot bytes per tuple after the header
        assert_eq!(
            inserted as usize,
            (PAGE_SIZE - SIZE_TABLE_PAGE_HEADER) / (4 + SIZE_SLOT)
        );
        Ok(())
    }

    #[test]
    fn test_mark_then_rollback() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let rid = view.insert_tuple(&int_tuple(3), None)?.unwrap();
        assert!(view.mark_delete(rid));
        assert!(view.get_tuple(rid).is_none());
        // double mark fails
        assert!(!view.mark_delete(rid));

        view.rollback_delete(rid);
        let tuple = view.get_tuple(rid).unwrap();
        assert_eq!(tuple.value_at(&int_schema(), 0), Value::Integer(3));
        Ok(())
    }

    #[test]
    fn test_apply_delete_compacts() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let r0 = view.insert_tuple(&int_tuple(10), None)?.unwrap();
        let r1 = view.insert_tuple(&int_tuple(11), None)?.unwrap();
        let r2 = view.insert_tuple(&int_tuple(12), None)?.unwrap();

        let removed = view.apply_delete(r1)?;
        assert_eq!(removed.value_at(&int_schema(), 0), Value::Integer(11));

        // survivors unaffected by the data-region shift
        assert_eq!(
            view.get_tuple(r0).unwrap().value_at(&int_schema(), 0),
            Value::Integer(10)
        );
        assert_eq!(
            view.get_tuple(r2).unwrap().value_at(&int_schema(), 0),
            Value::Integer(12)
        );
        assert!(view.get_tuple(r1).is_none());

        // the freed slot is reused by the next insertion
        let r3 = view.insert_tuple(&int_tuple(13), None)?.unwrap();
        assert_eq!(r3, r1);
        Ok(())
    }

    #[test]
    fn test_update_resizes_in_place() -> Result<()> {
        let schema = Schema::new(vec![Column::new("s", TypeId::Varchar)]);
        let page = fresh_page();
        let view = TablePage::new(&page);

        let make = |s: &str| Tuple::new(vec![Value::Varchar(s.into())], &schema);

        let r0 = view.insert_tuple(&make("aaaa"), None)?.unwrap();
        let r1 = view.insert_tuple(&make("bbbb"), None)?.unwrap();

        // grow r0; r1 must stay readable through its slot
        let old = view.update_tuple(&make("aaaaaaaaaa"), r0)?;
        assert_eq!(old.value_at(&schema, 0), Value::Varchar("aaaa".into()));
        assert_eq!(
            view.get_tuple(r0).unwrap().value_at(&schema, 0),
            Value::Varchar("aaaaaaaaaa".into())
        );
        assert_eq!(
            view.get_tuple(r1).unwrap().value_at(&schema, 0),
            Value::Varchar("bbbb".into())
        );

        // shrink back
        view.update_tuple(&make("aa"), r0)?;
        assert_eq!(
            view.get_tuple(r0).unwrap().value_at(&schema, 0),
            Value::Varchar("aa".into())
        );
        assert_eq!(
            view.get_tuple(r1).unwrap().value_at(&schema, 0),
            Value::Varchar("bbbb".into())
        );
        Ok(())
    }

    #[test]
    fn test_rid_iteration_skips_deleted() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let r0 = view.insert_tuple(&int_tuple(0), None)?.unwrap();
        let r1 = view.insert_tuple(&int_tuple(1), None)?.unwrap();
        let r2 = view.insert_tuple(&int_tuple(2), None)?.unwrap();

        assert!(view.mark_delete(r0));
        assert_eq!(view.first_tuple_rid(), Some(r1));
        assert_eq!(view.next_tuple_rid(r1), Some(r2));
        assert_eq!(view.next_tuple_rid(r2), None);
        Ok(())
    }

    #[test]
    fn test_callback_failure_leaves_page_untouched() -> Result<()> {
        let page = fresh_page();
        let view = TablePage::new(&page);

        let mut cb = |_rid: Rid| -> Result<()> { bail!(Error::Internal("lock refused".into())) };
        assert!(view.insert_tuple(&int_tuple(5), Some(&mut cb)).is_err());
        assert_eq!(view.tuple_count(), 0);
        assert_eq!(view.first_tuple_rid(), None);
        Ok(())
    }
}
