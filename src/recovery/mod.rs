pub mod log_manager;
pub mod log_record;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::buffer_pool::BufferPoolManager;
use crate::disk_manager::DiskManager;
use crate::pages::table_page::TablePage;
use crate::pages::{Lsn, INVALID_LSN, INVALID_PAGE_ID};
use crate::txn_manager::TxnId;
use log_manager::default_log_buffer_size;
use log_record::{LogPayload, LogRecord, LOG_HEADER_SIZE};

/// ARIES over an empty buffer pool after restart: analysis scans the whole
/// log (there are no checkpoints), redo re-applies physiological operations
/// gated by each page's LSN, and undo rolls the losers back along their
/// prev-LSN chains. Recovery is single-threaded and owns the pool, so page
/// latches are not taken here.
pub struct RecoveryManager {
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    /// Losers found by analysis: transaction id to its last LSN.
    active_txn: HashMap<TxnId, Lsn>,
    /// Random access for undo: LSN to (file offset, record size).
    lsn_mapping: HashMap<Lsn, (u64, u32)>,
    buffer_size: usize,
}

impl RecoveryManager {
    pub fn new(disk: Arc<DiskManager>, bpm: Arc<BufferPoolManager>) -> Self {
        let buffer_size = default_log_buffer_size(bpm.pool_size());
        Self {
            disk,
            bpm,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
            buffer_size,
        }
    }

    pub fn recover(&mut self) -> Result<()> {
        self.analyze()?;
        self.redo()?;
        self.undo()?;
        info!(
            "recovery complete: {} loser transaction(s) rolled back",
            self.active_txn.len()
        );
        Ok(())
    }

    /// Walk every record in the log file in order.
    fn scan_log(
        disk: &DiskManager,
        buffer_size: usize,
        mut visit: impl FnMut(u64, LogRecord) -> Result<()>,
    ) -> Result<()> {
        let mut buffer = vec![0u8; buffer_size];
        let mut offset = 0u64;
        while disk.read_log(&mut buffer, offset)? {
            let mut inner = 0usize;
            loop {
                if inner + LOG_HEADER_SIZE > buffer.len() {
                    break;
                }
                let size =
                    u32::from_le_bytes(buffer[inner..inner + 4].try_into().unwrap()) as usize;
                // a zero size is the end of the written log; a record that
                // does not fit is re-read at the next outer iteration
                if size == 0 || inner + size > buffer.len() {
                    break;
                }
                let record = LogRecord::from_bytes(&buffer[inner..inner + size])
                    .context("corrupt log record")?;
                visit(offset + inner as u64, record)?;
                inner += size;
            }
            if inner == 0 {
                break;
            }
            offset += inner as u64;
        }
        Ok(())
    }

    /// Build the loser set and the LSN-to-offset mapping.
    fn analyze(&mut self) -> Result<()> {
        let active_txn = &mut self.active_txn;
        let lsn_mapping = &mut self.lsn_mapping;
        Self::scan_log(&self.disk, self.buffer_size, |offset, record| {
            lsn_mapping.insert(record.lsn, (offset, record.size()));
            match record.payload {
                LogPayload::Commit | LogPayload::Abort => {
                    active_txn.remove(&record.txn_id);
                }
                _ => {
                    if record.txn_id != crate::txn_manager::INVALID_TXN_ID {
                        active_txn.insert(record.txn_id, record.lsn);
                    }
                }
            }
            Ok(())
        })?;
        debug!(
            "analysis: {} record(s), {} loser(s)",
            self.lsn_mapping.len(),
            self.active_txn.len()
        );
        Ok(())
    }

    /// Re-apply every operation whose effect is not yet on its page.
    fn redo(&mut self) -> Result<()> {
        let bpm = self.bpm.clone();
        Self::scan_log(&self.disk, self.buffer_size, |_, record| {
            Self::redo_record(&bpm, &record)
        })
    }

    fn redo_record(bpm: &Arc<BufferPoolManager>, record: &LogRecord) -> Result<()> {
        let page_id = match &record.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => return Ok(()),
            LogPayload::Insert { rid, .. }
            | LogPayload::MarkDelete { rid, .. }
            | LogPayload::ApplyDelete { rid, .. }
            | LogPayload::RollbackDelete { rid, .. }
            | LogPayload::Update { rid, .. } => rid.0,
            LogPayload::InitPage { page_id, .. } => *page_id,
        };

        let guard = bpm.fetch_page(page_id)?;
        if guard.page().lsn() >= record.lsn {
            // already reflected on disk before the crash
            return Ok(());
        }
        let view = TablePage::new(guard.page());

        match &record.payload {
            LogPayload::Insert { rid, tuple } => {
                let inserted = view
                    .insert_tuple(tuple, None)?
                    .context("page rejected a logged insertion")?;
                assert_eq!(inserted, *rid, "slot choice diverged during redo");
            }
            LogPayload::MarkDelete { rid, .. } => {
                assert!(view.mark_delete(*rid), "mark-delete diverged during redo");
            }
            LogPayload::ApplyDelete { rid, .. } => {
                view.apply_delete(*rid)?;
            }
            LogPayload::RollbackDelete { rid, .. } => {
                view.rollback_delete(*rid);
            }
            LogPayload::Update { rid, new_tuple, .. } => {
                view.update_tuple(new_tuple, *rid)?;
            }
            LogPayload::InitPage {
                page_id,
                prev_page_id,
            } => {
                view.init(*page_id, *prev_page_id);
                if *prev_page_id != INVALID_PAGE_ID {
                    let prev_guard = bpm.fetch_page(*prev_page_id)?;
                    TablePage::new(prev_guard.page()).set_next_page_id(*page_id);
                    prev_guard.mark_dirty();
                }
            }
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => unreachable!(),
        }

        guard.page().set_lsn(record.lsn);
        guard.mark_dirty();
        Ok(())
    }

    fn fetch_record(&self, lsn: Lsn) -> Result<LogRecord> {
        let (offset, size) = *self
            .lsn_mapping
            .get(&lsn)
            .with_context(|| format!("no log record at lsn {lsn}"))?;
        let mut buffer = vec![0u8; size as usize];
        self.disk.read_log(&mut buffer, offset)?;
        LogRecord::from_bytes(&buffer).context("corrupt log record")
    }

    /// Roll every loser back along its prev-LSN chain, applying physical
    /// compensations. Compensations are tolerant of re-execution so that
    /// running recovery twice converges on the same state.
    fn undo(&mut self) -> Result<()> {
        let losers: Vec<(TxnId, Lsn)> = self.active_txn.iter().map(|(&t, &l)| (t, l)).collect();
        for (txn_id, last_lsn) in losers {
            debug!("undoing transaction {txn_id} from lsn {last_lsn}");
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let record = self.fetch_record(lsn)?;
                self.undo_record(&record)?;
                lsn = record.prev_lsn;
            }
        }
        Ok(())
    }

    fn undo_record(&self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Begin => {}
            LogPayload::Insert { rid, .. } => {
                let guard = self.bpm.fetch_page(rid.0)?;
                if TablePage::new(guard.page()).apply_delete(*rid).is_ok() {
                    guard.mark_dirty();
                }
            }
            LogPayload::MarkDelete { rid, .. } => {
                let guard = self.bpm.fetch_page(rid.0)?;
                TablePage::new(guard.page()).rollback_delete(*rid);
                guard.mark_dirty();
            }
            LogPayload::RollbackDelete { rid, .. } => {
                let guard = self.bpm.fetch_page(rid.0)?;
                TablePage::new(guard.page()).mark_delete(*rid);
                guard.mark_dirty();
            }
            LogPayload::Update { rid, old_tuple, .. } => {
                let guard = self.bpm.fetch_page(rid.0)?;
                if TablePage::new(guard.page())
                    .update_tuple(old_tuple, *rid)
                    .is_ok()
                {
                    guard.mark_dirty();
                }
            }
            // apply-delete only happens on the commit path, after the
            // COMMIT record; a loser cannot have one
            LogPayload::ApplyDelete { rid, .. } => {
                warn!(
                    "apply-delete found while undoing transaction {} at {:?}",
                    record.txn_id, rid
                );
            }
            // pages are never reclaimed during undo
            LogPayload::InitPage { .. } => {}
            LogPayload::Commit | LogPayload::Abort => {
                unreachable!("finished transaction in the loser set")
            }
        }
        Ok(())
    }
}
