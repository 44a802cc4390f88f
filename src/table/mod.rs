pub mod table_iterator;

use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;

use crate::buffer_pool::BufferPoolManager;
use crate::errors::Error;
use crate::indexes::BPlusTreeIndex;
use crate::pages::table_page::{TablePage, SIZE_SLOT, SIZE_TABLE_PAGE_HEADER};
use crate::pages::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogPayload, LogRecord};
use crate::tuple::schema::Schema;
use crate::tuple::{Rid, Tuple, INVALID_RID};
use crate::txn_manager::lock_manager::LockManager;
use crate::txn_manager::transaction::Transaction;
use crate::txn_manager::INVALID_TXN_ID;
use table_iterator::TableIterator;

/// The unit the transaction manager operates on: a heap plus the secondary
/// indexes maintained over it. The catalog proper lives above this crate.
pub struct TableInfo {
    pub name: String,
    pub schema: Schema,
    pub table: Arc<TableHeap>,
    pub indexes: Vec<Arc<BPlusTreeIndex>>,
}

/// Doubly-linked list of slotted table pages. The heap owns page latching,
/// WAL emission and page-LSN stamping for every mutating operation; it
/// never holds more than one page latch at a time except while linking a
/// freshly allocated page behind its predecessor.
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    log: Option<Arc<LogManager>>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Create a heap with one empty page. The page birth is logged outside
    /// any transaction.
    pub fn new(bpm: Arc<BufferPoolManager>, log: Option<Arc<LogManager>>) -> Result<Arc<Self>> {
        let guard = bpm.new_page()?;
        let first_page_id = guard.page_id();

        guard.latch().wlock();
        TablePage::new(guard.page()).init(first_page_id, INVALID_PAGE_ID);
        if let Some(log) = &log {
            let mut record = LogRecord::new(
                INVALID_TXN_ID,
                crate::pages::INVALID_LSN,
                LogPayload::InitPage {
                    page_id: first_page_id,
                    prev_page_id: INVALID_PAGE_ID,
                },
            );
            let lsn = log.append_record(&mut record);
            guard.page().set_lsn(lsn);
        }
        guard.mark_dirty();
        guard.latch().wunlock();
        drop(guard);

        debug!("created table heap rooted at page {first_page_id}");
        Ok(Arc::new(Self {
            bpm,
            log,
            first_page_id,
        }))
    }

    /// Reattach to an existing heap, e.g. after recovery.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
        first_page_id: PageId,
    ) -> Arc<Self> {
        assert_ne!(first_page_id, INVALID_PAGE_ID);
        Arc::new(Self {
            bpm,
            log,
            first_page_id,
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    fn append_log(&self, txn: &mut Transaction, payload: LogPayload) -> Option<i32> {
        let log = self.log.as_ref()?;
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), payload);
        let lsn = log.append_record(&mut record);
        txn.set_prev_lsn(lsn);
        Some(lsn)
    }

    /// Walk the page list until a page accepts the tuple, growing the list
    /// by one page when every page is full. The exclusive row lock is taken
    /// through `lock_manager` before the tuple bytes land on the page.
    pub fn insert_tuple(
        &self,
        tuple: &Tuple,
        txn: &mut Transaction,
        lock_manager: Option<&LockManager>,
    ) -> Result<Rid> {
        if tuple.size() + SIZE_TABLE_PAGE_HEADER + SIZE_SLOT > PAGE_SIZE {
            bail!(Error::TupleTooLarge(
                PAGE_SIZE - SIZE_TABLE_PAGE_HEADER - SIZE_SLOT,
                tuple.size()
            ));
        }

        let mut page_id = self.first_page_id;
        loop {
            let guard = self.bpm.fetch_page(page_id)?;
            guard.latch().wlock();
            let view = TablePage::new(guard.page());

            let inserted = {
                let mut callback = |rid: Rid| match lock_manager {
                    Some(lm) => lm.lock_exclusive(txn, rid),
                    None => Ok(()),
                };
                view.insert_tuple(tuple, Some(&mut callback))
            };

            match inserted {
                Err(e) => {
                    guard.latch().wunlock();
                    return Err(e);
                }
                Ok(Some(rid)) => {
                    if let Some(lsn) = self.append_log(
                        txn,
                        LogPayload::Insert {
                            rid,
                            tuple: tuple.clone(),
                        },
                    ) {
                        guard.page().set_lsn(lsn);
                    }
                    guard.mark_dirty();
                    guard.latch().wunlock();
                    return Ok(rid);
                }
                Ok(None) => {
                    let next_page_id = view.next_page_id();
                    if next_page_id != INVALID_PAGE_ID {
                        guard.latch().wunlock();
                        page_id = next_page_id;
                        continue;
                    }

                    // out of pages: extend the list, linking the new page
                    // behind us while we still hold our write latch
                    let new_guard = match self.bpm.new_page() {
                        Ok(g) => g,
                        Err(e) => {
                            guard.latch().wunlock();
                            return Err(e);
                        }
                    };
                    let new_page_id = new_guard.page_id();
                    new_guard.latch().wlock();

                    view.set_next_page_id(new_page_id);
                    guard.mark_dirty();

                    TablePage::new(new_guard.page()).init(new_page_id, page_id);
                    if let Some(lsn) = self.append_log(
                        txn,
                        LogPayload::InitPage {
                            page_id: new_page_id,
                            prev_page_id: page_id,
                        },
                    ) {
                        new_guard.page().set_lsn(lsn);
                    }
                    new_guard.mark_dirty();

                    new_guard.latch().wunlock();
                    guard.latch().wunlock();
                    page_id = new_page_id;
                }
            }
        }
    }

    /// Flag the tuple deleted without destroying it. `false` means the
    /// tuple is already deleted or gone and the caller should skip it.
    pub fn mark_delete(&self, rid: Rid, txn: &mut Transaction) -> Result<bool> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().wlock();
        let view = TablePage::new(guard.page());

        let Some(tuple) = view.get_tuple(rid) else {
            guard.latch().wunlock();
            return Ok(false);
        };
        if !view.mark_delete(rid) {
            guard.latch().wunlock();
            return Ok(false);
        }

        if let Some(lsn) = self.append_log(txn, LogPayload::MarkDelete { rid, tuple }) {
            guard.page().set_lsn(lsn);
        }
        guard.mark_dirty();
        guard.latch().wunlock();
        Ok(true)
    }

    /// Destroy a tuple and compact its page. Runs at commit time, or while
    /// rolling back an insertion.
    pub fn apply_delete(&self, rid: Rid, txn: &mut Transaction) -> Result<()> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().wlock();
        let view = TablePage::new(guard.page());

        let tuple = match view.apply_delete(rid) {
            Ok(tuple) => tuple,
            Err(e) => {
                guard.latch().wunlock();
                return Err(e);
            }
        };

        if let Some(lsn) = self.append_log(txn, LogPayload::ApplyDelete { rid, tuple }) {
            guard.page().set_lsn(lsn);
        }
        guard.mark_dirty();
        guard.latch().wunlock();
        Ok(())
    }

    /// Clear a deletion flag while rolling back.
    pub fn rollback_delete(&self, rid: Rid, txn: &mut Transaction) -> Result<()> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().wlock();
        let view = TablePage::new(guard.page());

        view.rollback_delete(rid);
        let tuple = view
            .get_tuple(rid)
            .expect("rolled-back tuple must be readable");

        if let Some(lsn) = self.append_log(txn, LogPayload::RollbackDelete { rid, tuple }) {
            guard.page().set_lsn(lsn);
        }
        guard.mark_dirty();
        guard.latch().wunlock();
        Ok(())
    }

    /// In-place update; returns the old tuple for rollback. Fails when the
    /// page cannot fit the new size, which the caller turns into an abort.
    pub fn update_tuple(&self, new_tuple: &Tuple, rid: Rid, txn: &mut Transaction) -> Result<Tuple> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().wlock();
        let view = TablePage::new(guard.page());

        let old_tuple = match view.update_tuple(new_tuple, rid) {
            Ok(old) => old,
            Err(e) => {
                guard.latch().wunlock();
                return Err(e);
            }
        };

        if let Some(lsn) = self.append_log(
            txn,
            LogPayload::Update {
                rid,
                old_tuple: old_tuple.clone(),
                new_tuple: new_tuple.clone(),
            },
        ) {
            guard.page().set_lsn(lsn);
        }
        guard.mark_dirty();
        guard.latch().wunlock();
        Ok(old_tuple)
    }

    /// Read a tuple under the page's read latch. `None` means deleted.
    pub fn get_tuple(&self, rid: Rid) -> Result<Option<Tuple>> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().rlock();
        let tuple = TablePage::new(guard.page()).get_tuple(rid);
        guard.latch().runlock();
        Ok(tuple)
    }

    /// First live rid in the heap, or the invalid sentinel.
    pub(crate) fn first_rid(&self) -> Result<Rid> {
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(page_id)?;
            guard.latch().rlock();
            let view = TablePage::new(guard.page());
            let found = view.first_tuple_rid();
            let next = view.next_page_id();
            guard.latch().runlock();
            if let Some(rid) = found {
                return Ok(rid);
            }
            page_id = next;
        }
        Ok(INVALID_RID)
    }

    /// Next live rid after `rid`, crossing page boundaries.
    pub(crate) fn next_rid(&self, rid: Rid) -> Result<Rid> {
        let guard = self.bpm.fetch_page(rid.0)?;
        guard.latch().rlock();
        let view = TablePage::new(guard.page());
        let found = view.next_tuple_rid(rid);
        let mut page_id = view.next_page_id();
        guard.latch().runlock();
        drop(guard);

        if let Some(next) = found {
            return Ok(next);
        }
        while page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page(page_id)?;
            guard.latch().rlock();
            let view = TablePage::new(guard.page());
            let found = view.first_tuple_rid();
            let next = view.next_page_id();
            guard.latch().runlock();
            if let Some(next_rid) = found {
                return Ok(next_rid);
            }
            page_id = next;
        }
        Ok(INVALID_RID)
    }

    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator::new(self.clone())
    }
}
