pub mod lock_manager;
pub mod transaction;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;

use crate::errors::Error;
use crate::pages::INVALID_LSN;
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogPayload, LogRecord};
use crate::table::TableInfo;
use crate::tuple::{Rid, Tuple};
use lock_manager::LockManager;
use transaction::{IsolationLevel, Transaction};

pub use transaction::{TransactionState, TxnId, INVALID_TXN_ID};

/// Strict two-phase locking driver. Every transactional operation runs
/// through here: it takes the row locks, delegates to the heap, maintains
/// secondary indexes, and queues the commit/abort actions that finish the
/// job at transaction end.
///
/// Transactional failures surface as [`Error::TransactionAborted`]; the
/// caller's one obligation is to hand the context back to [`abort`] so the
/// rollback chain runs.
///
/// [`abort`]: TransactionManager::abort
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    next_txn_id: AtomicI32,
    txn_map: Mutex<HashSet<TxnId>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Arc<Self> {
        Arc::new(Self {
            lock_manager,
            log_manager,
            next_txn_id: AtomicI32::new(0),
            txn_map: Mutex::new(HashSet::new()),
        })
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let mut txn = Transaction::new(id, isolation_level);
        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(id, INVALID_LSN, LogPayload::Begin);
            let lsn = log.append_record(&mut record);
            txn.set_prev_lsn(lsn);
        }
        self.txn_map.lock().insert(id);
        txn
    }

    pub fn is_transaction_alive(&self, id: TxnId) -> bool {
        self.txn_map.lock().contains(&id)
    }

    /// Read a tuple under the isolation level's locking rules. `Ok(None)`
    /// means skip: the tuple is gone or the predicate rejected it. A
    /// shared lock taken by this call is released again on skip, and
    /// eagerly after the read under READ_COMMITTED; locks held from
    /// earlier statements are never touched.
    pub fn read(
        &self,
        txn: &mut Transaction,
        rid: Rid,
        table_info: &TableInfo,
        predicate: Option<&dyn Fn(&Tuple) -> bool>,
    ) -> Result<Option<Tuple>> {
        assert!(!txn.is_aborted(), "operation on an aborted transaction");

        let already_locked = txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid);
        if txn.isolation_level() != IsolationLevel::ReadUncommitted && !already_locked {
            self.lock_manager.lock_shared(txn, rid)?;
        }

        let tuple = table_info.table.get_tuple(rid)?;

        let skip = match &tuple {
            None => true,
            Some(tuple) => predicate.is_some_and(|p| !p(tuple)),
        };
        if skip {
            if !already_locked && txn.is_shared_locked(rid) {
                self.lock_manager.unlock(txn, rid);
            }
            return Ok(None);
        }

        if txn.isolation_level() == IsolationLevel::ReadCommitted
            && !already_locked
            && txn.is_shared_locked(rid)
        {
            self.lock_manager.unlock(txn, rid);
        }
        Ok(tuple)
    }

    /// Insert a tuple. The exclusive lock on the fresh RID is taken inside
    /// the page layer, before any other transaction can see the slot.
    /// Index entries go in eagerly; abort undoes both.
    pub fn insert(&self, txn: &mut Transaction, tuple: &Tuple, table_info: &TableInfo) -> Result<Rid> {
        assert!(!txn.is_aborted(), "operation on an aborted transaction");

        let rid = match table_info
            .table
            .insert_tuple(tuple, txn, Some(self.lock_manager.as_ref()))
        {
            Ok(rid) => rid,
            Err(e) if Error::is_abort(&e) => return Err(e),
            Err(e) => bail!(Error::TransactionAborted(
                txn.id(),
                format!("tuple insert failed: {e}")
            )),
        };
        assert!(
            txn.is_exclusive_locked(rid),
            "insert must leave the new tuple exclusively locked"
        );

        {
            let table = table_info.table.clone();
            txn.register_abort_action(Box::new(move |txn| {
                let _ = table.apply_delete(rid, txn);
            }));
        }

        for index in &table_info.indexes {
            let inserted = index.insert_entry(tuple, rid).map_err(|e| {
                anyhow!(Error::TransactionAborted(
                    txn.id(),
                    format!("index insert failed: {e}")
                ))
            })?;
            if !inserted {
                bail!(Error::TransactionAborted(
                    txn.id(),
                    format!("duplicate key in index {}", index.metadata().name)
                ));
            }
            let index = index.clone();
            let tuple = tuple.clone();
            txn.register_abort_action(Box::new(move |_| {
                let _ = index.delete_entry(&tuple);
            }));
        }
        Ok(rid)
    }

    /// Mark a tuple deleted. The destructive apply-delete and the index
    /// removals run at commit; abort just clears the mark.
    pub fn delete(&self, txn: &mut Transaction, rid: Rid, table_info: &TableInfo) -> Result<()> {
        assert!(!txn.is_aborted(), "operation on an aborted transaction");

        if txn.is_shared_locked(rid) {
            self.lock_manager.lock_upgrade(txn, rid)?;
        } else if !txn.is_exclusive_locked(rid) {
            self.lock_manager.lock_exclusive(txn, rid)?;
        }

        let Some(old_tuple) = table_info.table.get_tuple(rid)? else {
            // deleted under us before the lock was granted
            return Ok(());
        };
        if !table_info.table.mark_delete(rid, txn)? {
            return Ok(());
        }

        for index in &table_info.indexes {
            let index = index.clone();
            let old_tuple = old_tuple.clone();
            txn.register_commit_action(Box::new(move |_| {
                let _ = index.delete_entry(&old_tuple);
            }));
        }
        {
            let table = table_info.table.clone();
            txn.register_commit_action(Box::new(move |txn| {
                let _ = table.apply_delete(rid, txn);
            }));
        }
        {
            let table = table_info.table.clone();
            txn.register_abort_action(Box::new(move |txn| {
                let _ = table.rollback_delete(rid, txn);
            }));
        }
        Ok(())
    }

    /// In-place update. The new index entry goes in immediately; the old
    /// one leaves at commit; abort removes the new entry and restores the
    /// old tuple bytes. Indexes whose key did not change are left alone.
    pub fn update(
        &self,
        txn: &mut Transaction,
        new_tuple: &Tuple,
        rid: Rid,
        table_info: &TableInfo,
    ) -> Result<()> {
        assert!(!txn.is_aborted(), "operation on an aborted transaction");

        if txn.is_shared_locked(rid) {
            self.lock_manager.lock_upgrade(txn, rid)?;
        } else if !txn.is_exclusive_locked(rid) {
            self.lock_manager.lock_exclusive(txn, rid)?;
        }

        let old_tuple = match table_info.table.update_tuple(new_tuple, rid, txn) {
            Ok(old) => old,
            Err(e) => bail!(Error::TransactionAborted(
                txn.id(),
                format!("update failed: {e}")
            )),
        };

        for index in &table_info.indexes {
            if index.key_of(&old_tuple) == index.key_of(new_tuple) {
                continue;
            }
            let inserted = index.insert_entry(new_tuple, rid).map_err(|e| {
                anyhow!(Error::TransactionAborted(
                    txn.id(),
                    format!("index insert failed: {e}")
                ))
            })?;
            if !inserted {
                bail!(Error::TransactionAborted(
                    txn.id(),
                    format!("duplicate key in index {}", index.metadata().name)
                ));
            }

            let drop_old = {
                let index = index.clone();
                let old_tuple = old_tuple.clone();
                Box::new(move |_: &mut Transaction| {
                    let _ = index.delete_entry(&old_tuple);
                })
            };
            txn.register_commit_action(drop_old);

            let drop_new = {
                let index = index.clone();
                let new_tuple = new_tuple.clone();
                Box::new(move |_: &mut Transaction| {
                    let _ = index.delete_entry(&new_tuple);
                })
            };
            txn.register_abort_action(drop_new);
        }

        {
            let table = table_info.table.clone();
            let old_tuple = old_tuple.clone();
            txn.register_abort_action(Box::new(move |txn| {
                let _ = table.update_tuple(&old_tuple, rid, txn);
            }));
        }
        Ok(())
    }

    /// Run the commit actions, force the COMMIT record out, then release
    /// the locks, strictly in that order: nothing committed may become
    /// visible before it is durable.
    pub fn commit(&self, mut txn: Transaction) {
        txn.set_committed();

        for action in txn.take_commit_actions() {
            action(&mut txn);
        }

        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
            let lsn = log.append_record(&mut record);
            txn.set_prev_lsn(lsn);
            log.flush(lsn, false);
        }

        self.release_all_locks(&mut txn);
        self.txn_map.lock().remove(&txn.id());
    }

    /// Roll back: abort actions run newest-first, the ABORT record is
    /// appended without forcing, and the locks drop last.
    pub fn abort(&self, mut txn: Transaction) {
        if !txn.is_aborted() {
            txn.set_aborted();
        }

        for action in txn.take_abort_actions().into_iter().rev() {
            action(&mut txn);
        }

        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
            let lsn = log.append_record(&mut record);
            txn.set_prev_lsn(lsn);
        }

        self.release_all_locks(&mut txn);
        self.txn_map.lock().remove(&txn.id());
    }

    fn release_all_locks(&self, txn: &mut Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::lock_manager::DEFAULT_CYCLE_DETECTION_INTERVAL;
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use crate::disk_manager::DiskManager;
    use crate::indexes::{BPlusTreeIndex, IndexMetadata};
    use crate::table::TableHeap;
    use crate::test_utils::test_path;
    use crate::tuple::schema::{Column, Schema};
    use crate::types::{TypeId, Value};
    use std::time::Duration;

    fn account_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Integer),
            Column::new("balance", TypeId::Integer),
        ])
    }

    fn account(id: i32, balance: i32) -> Tuple {
        Tuple::new(
            vec![Value::Integer(id), Value::Integer(balance)],
            &account_schema(),
        )
    }

    fn balance_of(tuple: &Tuple) -> i32 {
        match tuple.value_at(&account_schema(), 1) {
            Value::Integer(v) => v,
            _ => unreachable!(),
        }
    }

    struct Harness {
        tm: Arc<TransactionManager>,
        info: TableInfo,
        path: String,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn setup(pool_size: usize, with_index: bool) -> Harness {
        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let bpm = BufferPoolManager::new(pool_size, disk, None);
        let table = TableHeap::new(bpm.clone(), None).unwrap();
        let lock_manager = LockManager::new(DEFAULT_CYCLE_DETECTION_INTERVAL);
        let tm = TransactionManager::new(lock_manager, None);

        let indexes = if with_index {
            let metadata = IndexMetadata::new("pk_id", account_schema(), vec![0]);
            vec![Arc::new(BPlusTreeIndex::new(metadata, bpm))]
        } else {
            vec![]
        };

        let info = TableInfo {
            name: "accounts".into(),
            schema: account_schema(),
            table,
            indexes,
        };
        Harness { tm, info, path }
    }

    #[test]
    fn test_insert_commit_then_read() -> Result<()> {
        let h = setup(8, true);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 100), &h.info)?;
        let id = t1.id();
        h.tm.commit(t1);
        assert!(!h.tm.is_transaction_alive(id));

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        let tuple = h.tm.read(&mut t2, rid, &h.info, None)?.unwrap();
        assert_eq!(balance_of(&tuple), 100);

        // the index got the entry too
        let key = h.info.indexes[0].key_of(&tuple);
        assert_eq!(h.info.indexes[0].scan_key(&key)?, Some(rid));
        h.tm.commit(t2);
        Ok(())
    }

    #[test]
    fn test_insert_abort_rolls_back() -> Result<()> {
        let h = setup(8, true);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 100), &h.info)?;
        h.tm.abort(t1);

        // tuple and index entry are both gone
        assert!(h.info.table.get_tuple(rid)?.is_none());
        let key = account(1, 100).key_from_tuple(
            &account_schema(),
            &h.info.indexes[0].metadata().key_schema,
            &[0],
        );
        assert_eq!(h.info.indexes[0].scan_key(&key)?, None);
        Ok(())
    }

    #[test]
    fn test_delete_commit_applies() -> Result<()> {
        let h = setup(8, true);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 50), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        h.tm.delete(&mut t2, rid, &h.info)?;
        h.tm.commit(t2);

        assert!(h.info.table.get_tuple(rid)?.is_none());
        let key = account(1, 50).key_from_tuple(
            &account_schema(),
            &h.info.indexes[0].metadata().key_schema,
            &[0],
        );
        assert_eq!(h.info.indexes[0].scan_key(&key)?, None);

        // the slot is reusable: the rid was invalidated by apply-delete
        let mut t3 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid2 = h.tm.insert(&mut t3, &account(2, 70), &h.info)?;
        assert_eq!(rid2, rid);
        h.tm.commit(t3);
        Ok(())
    }

    #[test]
    fn test_delete_abort_restores() -> Result<()> {
        let h = setup(8, false);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 50), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        h.tm.delete(&mut t2, rid, &h.info)?;
        assert!(h.info.table.get_tuple(rid)?.is_none());
        h.tm.abort(t2);

        let tuple = h.info.table.get_tuple(rid)?.unwrap();
        assert_eq!(balance_of(&tuple), 50);
        Ok(())
    }

    #[test]
    fn test_update_abort_restores_old_value() -> Result<()> {
        let h = setup(8, false);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 10), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        h.tm.update(&mut t2, &account(1, 99), rid, &h.info)?;
        assert_eq!(balance_of(&h.info.table.get_tuple(rid)?.unwrap()), 99);
        h.tm.abort(t2);

        assert_eq!(balance_of(&h.info.table.get_tuple(rid)?.unwrap()), 10);
        Ok(())
    }

    #[test]
    fn test_read_predicate_skip_releases_lock() -> Result<()> {
        let h = setup(8, false);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 10), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rejecting = |t: &Tuple| balance_of(t) > 100;
        let got = h.tm.read(&mut t2, rid, &h.info, Some(&rejecting))?;
        assert!(got.is_none());
        // the shared lock acquired for the rejected read is gone again
        assert!(!t2.is_shared_locked(rid));
        h.tm.commit(t2);
        Ok(())
    }

    #[test]
    fn test_read_committed_releases_after_read() -> Result<()> {
        let h = setup(8, false);

        let mut t1 = h.tm.begin(IsolationLevel::ReadCommitted);
        let rid = h.tm.insert(&mut t1, &account(1, 10), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::ReadCommitted);
        h.tm.read(&mut t2, rid, &h.info, None)?.unwrap();
        assert!(!t2.is_shared_locked(rid));
        // and the growing phase survived the release
        h.tm.read(&mut t2, rid, &h.info, None)?.unwrap();
        h.tm.commit(t2);
        Ok(())
    }

    #[test]
    fn test_repeatable_read_holds_lock() -> Result<()> {
        let h = setup(8, false);

        let mut t1 = h.tm.begin(IsolationLevel::RepeatableRead);
        let rid = h.tm.insert(&mut t1, &account(1, 10), &h.info)?;
        h.tm.commit(t1);

        let mut t2 = h.tm.begin(IsolationLevel::RepeatableRead);
        h.tm.read(&mut t2, rid, &h.info, None)?.unwrap();
        assert!(t2.is_shared_locked(rid));
        h.tm.commit(t2);
        Ok(())
    }

    #[test]
    fn test_deadlock_victim_aborts_other_commits() -> Result<()> {
        use std::sync::Barrier;
        use std::thread;

        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let bpm = BufferPoolManager::new(8, disk, None);
        let table = TableHeap::new(bpm, None).unwrap();
        let lock_manager = LockManager::new(Duration::from_millis(10));
        let tm = TransactionManager::new(lock_manager, None);
        let info = Arc::new(TableInfo {
            name: "accounts".into(),
            schema: account_schema(),
            table,
            indexes: vec![],
        });

        let mut t0 = tm.begin(IsolationLevel::Serializable);
        let rid_a = tm.insert(&mut t0, &account(1, 10), &info)?;
        let rid_b = tm.insert(&mut t0, &account(2, 20), &info)?;
        tm.commit(t0);

        // both take their shared lock before either tries the delete, so
        // the exclusive requests cross and form a cycle
        let barrier = Arc::new(Barrier::new(2));
        let spawn_crosser = |own: Rid, other: Rid| {
            let tm = tm.clone();
            let info = info.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> bool {
                let mut txn = tm.begin(IsolationLevel::Serializable);
                tm.read(&mut txn, own, &info, None).unwrap();
                barrier.wait();
                match tm.delete(&mut txn, other, &info) {
                    Ok(()) => {
                        tm.commit(txn);
                        true
                    }
                    Err(e) => {
                        assert!(Error::is_abort(&e));
                        tm.abort(txn);
                        false
                    }
                }
            })
        };

        let h1 = spawn_crosser(rid_a, rid_b);
        let h2 = spawn_crosser(rid_b, rid_a);

        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();
        // exactly one was picked as the victim; the other committed
        assert!(r1 ^ r2, "expected one survivor, got {r1} and {r2}");

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_bank_transfers_preserve_total() -> Result<()> {
        use rand::Rng;
        use std::thread;

        crate::test_utils::init_logging();

        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let bpm = BufferPoolManager::new(32, disk, None);
        let table = TableHeap::new(bpm, None).unwrap();
        let lock_manager = LockManager::new(Duration::from_millis(10));
        let tm = TransactionManager::new(lock_manager, None);
        let info = Arc::new(TableInfo {
            name: "accounts".into(),
            schema: account_schema(),
            table,
            indexes: vec![],
        });

        const ACCOUNTS: usize = 20;
        const WRITERS: usize = 4;
        const TRANSFERS: usize = 10;

        let mut rng = rand::thread_rng();
        let mut total = 0i32;
        let mut rids = Vec::new();
        {
            let mut txn = tm.begin(IsolationLevel::Serializable);
            for i in 0..ACCOUNTS {
                let balance = rng.gen_range(100..1000);
                total += balance;
                rids.push(tm.insert(&mut txn, &account(i as i32, balance), &info)?);
            }
            tm.commit(txn);
        }
        let rids = Arc::new(rids);

        fn read_account(
            tm: &TransactionManager,
            txn: &mut Transaction,
            info: &TableInfo,
            rid: Rid,
        ) -> Result<(i32, i32)> {
            let tuple = tm.read(txn, rid, info, None)?.unwrap();
            let id = match tuple.value_at(&account_schema(), 0) {
                Value::Integer(v) => v,
                _ => unreachable!(),
            };
            Ok((id, balance_of(&tuple)))
        }

        let mut writers = Vec::new();
        for w in 0..WRITERS {
            let tm = tm.clone();
            let info = info.clone();
            let rids = rids.clone();
            writers.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut done = 0;
                while done < TRANSFERS {
                    let from = rids[rng.gen_range(0..ACCOUNTS)];
                    let to = rids[(rng.gen_range(0..ACCOUNTS) + w) % ACCOUNTS];
                    if from == to {
                        continue;
                    }

                    let mut txn = tm.begin(IsolationLevel::Serializable);
                    let result = (|| -> Result<()> {
                        let (from_id, from_balance) = read_account(&tm, &mut txn, &info, from)?;
                        let (to_id, to_balance) = read_account(&tm, &mut txn, &info, to)?;
                        tm.update(&mut txn, &account(from_id, from_balance - 7), from, &info)?;
                        tm.update(&mut txn, &account(to_id, to_balance + 7), to, &info)?;
                        Ok(())
                    })();

                    match result {
                        Ok(()) => {
                            tm.commit(txn);
                            done += 1;
                        }
                        Err(e) => {
                            // deadlock victims retry
                            assert!(Error::is_abort(&e), "unexpected error: {e}");
                            tm.abort(txn);
                        }
                    }
                }
            }));
        }

        // concurrent readers must always see the conserved total
        let mut readers = Vec::new();
        for _ in 0..2 {
            let tm = tm.clone();
            let info = info.clone();
            let rids = rids.clone();
            readers.push(thread::spawn(move || {
                for _ in 0..5 {
                    let mut txn = tm.begin(IsolationLevel::Serializable);
                    let result = (|| -> Result<i32> {
                        let mut sum = 0;
                        for rid in rids.iter() {
                            sum += read_account(&tm, &mut txn, &info, *rid)?.1;
                        }
                        Ok(sum)
                    })();
                    match result {
                        Ok(sum) => {
                            tm.commit(txn);
                            assert_eq!(sum, total, "reader saw an inconsistent total");
                        }
                        Err(e) => {
                            assert!(Error::is_abort(&e), "unexpected error: {e}");
                            tm.abort(txn);
                        }
                    }
                }
            }));
        }

        for handle in writers {
            handle.join().unwrap();
        }
        for handle in readers {
            handle.join().unwrap();
        }

        let mut txn = tm.begin(IsolationLevel::Serializable);
        let mut sum = 0;
        for rid in rids.iter() {
            sum += read_account(&tm, &mut txn, &info, *rid)?.1;
        }
        tm.commit(txn);
        assert_eq!(sum, total);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}
