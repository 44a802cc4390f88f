use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::transaction::{IsolationLevel, LockStage, Transaction};
use super::TxnId;
use crate::errors::Error;
use crate::tuple::Rid;

pub const DEFAULT_CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
    /// Set by the deadlock detector; the waiter observes it in its wake
    /// predicate and aborts itself.
    should_abort: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
            should_abort: false,
        }
    }
}

#[derive(Default)]
struct LockRequestQueue {
    requests: Vec<LockRequest>,
    cv: Arc<Condvar>,
    /// A granted exclusive holder exists.
    writing: bool,
    /// At most one waiter may be upgrading at a time.
    upgrading: bool,
    shared_count: u32,
}

/// Row-level shared/exclusive locks with per-RID request queues and a
/// background wait-for-graph deadlock detector. All operations take the
/// global latch and wait on the queue's condition variable.
pub struct LockManager {
    core: Arc<LockManagerCore>,
    detection_thread: Option<JoinHandle<()>>,
}

struct LockManagerCore {
    latch: Mutex<HashMap<Rid, LockRequestQueue>>,
    enable_cycle_detection: AtomicBool,
    interval: Duration,
}

impl LockManager {
    pub fn new(interval: Duration) -> Arc<Self> {
        let core = Arc::new(LockManagerCore {
            latch: Mutex::new(HashMap::new()),
            enable_cycle_detection: AtomicBool::new(true),
            interval,
        });

        let detection_thread = {
            let core = core.clone();
            std::thread::spawn(move || core.run_cycle_detection())
        };
        debug!("deadlock detection thread started");

        Arc::new(Self {
            core,
            detection_thread: Some(detection_thread),
        })
    }

    pub fn lock_shared(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        assert_ne!(txn.stage(), LockStage::Shrinking, "lock acquired while shrinking");
        assert_ne!(
            txn.isolation_level(),
            IsolationLevel::ReadUncommitted,
            "shared lock under READ_UNCOMMITTED"
        );

        let core = &self.core;
        let mut table = core.latch.lock();
        let queue = table.entry(rid).or_default();
        queue.requests.push(LockRequest::new(txn.id(), LockMode::Shared));
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            let pos = position_of(queue, txn.id());
            if queue.requests[pos].should_abort || txn.is_aborted() {
                queue.requests.remove(pos);
                txn.set_aborted();
                drop(table);
                bail!(Error::TransactionAborted(txn.id(), "deadlock".into()));
            }
            if !queue.writing {
                queue.requests[pos].granted = true;
                queue.shared_count += 1;
                txn.shared_lock_set().insert(rid);
                return Ok(());
            }
            cv.wait(&mut table);
        }
    }

    pub fn lock_exclusive(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        assert_ne!(txn.stage(), LockStage::Shrinking, "lock acquired while shrinking");

        let core = &self.core;
        let mut table = core.latch.lock();
        let queue = table.entry(rid).or_default();
        queue
            .requests
            .push(LockRequest::new(txn.id(), LockMode::Exclusive));
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            let pos = position_of(queue, txn.id());
            if queue.requests[pos].should_abort || txn.is_aborted() {
                queue.requests.remove(pos);
                txn.set_aborted();
                drop(table);
                bail!(Error::TransactionAborted(txn.id(), "deadlock".into()));
            }
            if !queue.writing && queue.shared_count == 0 {
                queue.requests[pos].granted = true;
                queue.writing = true;
                txn.exclusive_lock_set().insert(rid);
                return Ok(());
            }
            cv.wait(&mut table);
        }
    }

    /// Atomically turn a held shared lock into an exclusive one. The first
    /// upgrader on a queue wins; a second one aborts immediately.
    pub fn lock_upgrade(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        assert_ne!(txn.stage(), LockStage::Shrinking, "lock acquired while shrinking");

        let core = &self.core;
        let mut table = core.latch.lock();
        let queue = table
            .get_mut(&rid)
            .expect("upgrade of a lock that was never requested");

        if queue.upgrading {
            txn.set_aborted();
            drop(table);
            bail!(Error::TransactionAborted(txn.id(), "upgrade conflict".into()));
        }

        let pos = position_of(queue, txn.id());
        {
            let request = &mut queue.requests[pos];
            assert!(
                request.granted && request.mode == LockMode::Shared,
                "upgrade of a lock not held in shared mode"
            );
            request.granted = false;
            request.mode = LockMode::Exclusive;
        }
        queue.shared_count -= 1;
        queue.upgrading = true;
        txn.shared_lock_set().remove(&rid);
        let cv = queue.cv.clone();

        loop {
            let queue = table.get_mut(&rid).unwrap();
            let pos = position_of(queue, txn.id());
            if queue.requests[pos].should_abort || txn.is_aborted() {
                queue.requests.remove(pos);
                queue.upgrading = false;
                txn.set_aborted();
                drop(table);
                bail!(Error::TransactionAborted(txn.id(), "deadlock".into()));
            }
            if !queue.writing && queue.shared_count == 0 {
                queue.requests[pos].granted = true;
                queue.writing = true;
                queue.upgrading = false;
                txn.exclusive_lock_set().insert(rid);
                return Ok(());
            }
            cv.wait(&mut table);
        }
    }

    /// Release one lock and wake waiters that may now be grantable.
    pub fn unlock(&self, txn: &mut Transaction, rid: Rid) {
        let core = &self.core;
        let mut table = core.latch.lock();

        txn.shared_lock_set().remove(&rid);
        txn.exclusive_lock_set().remove(&rid);

        let queue = table.get_mut(&rid).expect("unlock of a lock not held");
        let pos = position_of(queue, txn.id());
        assert!(queue.requests[pos].granted, "unlock of an ungranted request");
        let mode = queue.requests[pos].mode;
        queue.requests.remove(pos);

        let should_notify = match mode {
            LockMode::Exclusive => {
                queue.writing = false;
                if txn.stage() == LockStage::Growing {
                    txn.set_stage(LockStage::Shrinking);
                }
                true
            }
            LockMode::Shared => {
                queue.shared_count -= 1;
                // read committed releases read locks eagerly; that must not
                // end the growing phase
                if txn.isolation_level() != IsolationLevel::ReadCommitted
                    && txn.stage() == LockStage::Growing
                {
                    txn.set_stage(LockStage::Shrinking);
                }
                queue.shared_count == 0
            }
        };

        if should_notify {
            queue.cv.notify_all();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.core
            .enable_cycle_detection
            .store(false, Ordering::Release);
        if let Some(handle) = self.detection_thread.take() {
            let _ = handle.join();
        }
        debug!("deadlock detection thread stopped");
    }
}

fn position_of(queue: &LockRequestQueue, txn_id: TxnId) -> usize {
    queue
        .requests
        .iter()
        .position(|r| r.txn_id == txn_id)
        .expect("no pending request for transaction")
}

impl LockManagerCore {
    fn run_cycle_detection(self: Arc<Self>) {
        while self.enable_cycle_detection.load(Ordering::Acquire) {
            std::thread::sleep(self.interval);

            let mut table = self.latch.lock();

            // wait-for edges: each waiter waits on every granted holder of
            // the same RID; remember which RID each waiter is parked on
            let mut waits_on: HashMap<TxnId, Rid> = HashMap::new();
            let mut waits_for: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
            for (rid, queue) in table.iter() {
                for request in queue.requests.iter().filter(|r| !r.granted) {
                    waits_on.insert(request.txn_id, *rid);
                    let edges = waits_for.entry(request.txn_id).or_default();
                    for granted in queue.requests.iter().filter(|r| r.granted) {
                        edges.push(granted.txn_id);
                    }
                }
            }

            while let Some(victim) = find_cycle_victim(&waits_for) {
                warn!("deadlock detected, aborting transaction {victim}");
                waits_for.remove(&victim);
                for edges in waits_for.values_mut() {
                    edges.retain(|&t| t != victim);
                }

                let rid = waits_on[&victim];
                let queue = table.get_mut(&rid).unwrap();
                for request in queue.requests.iter_mut() {
                    if request.txn_id == victim {
                        request.should_abort = true;
                    }
                }
                queue.cv.notify_all();
            }
        }
    }
}

/// DFS over the wait-for graph; the victim is the target of the first
/// back edge found. Nodes are visited in sorted order so the choice is
/// deterministic for a given snapshot.
fn find_cycle_victim(waits_for: &HashMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
    fn dfs(
        current: TxnId,
        waits_for: &HashMap<TxnId, Vec<TxnId>>,
        stack: &mut Vec<TxnId>,
        finished: &mut std::collections::HashSet<TxnId>,
    ) -> Option<TxnId> {
        if finished.contains(&current) {
            return None;
        }
        stack.push(current);
        if let Some(edges) = waits_for.get(&current) {
            for &to in edges {
                if stack.contains(&to) {
                    return Some(to);
                }
                if let Some(victim) = dfs(to, waits_for, stack, finished) {
                    return Some(victim);
                }
            }
        }
        stack.pop();
        finished.insert(current);
        None
    }

    let mut nodes: Vec<TxnId> = waits_for.keys().copied().collect();
    nodes.sort_unstable();

    let mut finished = std::collections::HashSet::new();
    for node in nodes {
        let mut stack = Vec::new();
        if let Some(victim) = dfs(node, waits_for, &mut stack, &mut finished) {
            return Some(victim);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn_manager::transaction::Transaction;
    use std::thread;

    fn txn(id: TxnId) -> Transaction {
        Transaction::new(id, IsolationLevel::RepeatableRead)
    }

    #[test]
    fn test_shared_locks_coexist() -> Result<()> {
        let lm = LockManager::new(DEFAULT_CYCLE_DETECTION_INTERVAL);
        let rid: Rid = (0, 0);

        let mut t1 = txn(1);
        let mut t2 = txn(2);
        lm.lock_shared(&mut t1, rid)?;
        lm.lock_shared(&mut t2, rid)?;
        assert!(t1.is_shared_locked(rid));
        assert!(t2.is_shared_locked(rid));

        lm.unlock(&mut t1, rid);
        lm.unlock(&mut t2, rid);
        Ok(())
    }

    #[test]
    fn test_exclusive_blocks_until_released() -> Result<()> {
        let lm = LockManager::new(DEFAULT_CYCLE_DETECTION_INTERVAL);
        let rid: Rid = (0, 0);

        let mut t1 = txn(1);
        lm.lock_exclusive(&mut t1, rid)?;

        let lm2 = lm.clone();
        let handle = thread::spawn(move || {
            let mut t2 = txn(2);
            lm2.lock_exclusive(&mut t2, rid).unwrap();
            lm2.unlock(&mut t2, rid);
        });

        thread::sleep(Duration::from_millis(20));
        lm.unlock(&mut t1, rid);
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_upgrade_conflict_aborts_second() -> Result<()> {
        let lm = LockManager::new(DEFAULT_CYCLE_DETECTION_INTERVAL);
        let rid: Rid = (0, 0);

        let mut t1 = txn(1);
        let mut t2 = txn(2);
        lm.lock_shared(&mut t1, rid)?;
        lm.lock_shared(&mut t2, rid)?;

        // t1 starts upgrading (blocks on t2's shared lock)
        let lm2 = lm.clone();
        let handle = thread::spawn(move || {
            lm2.lock_upgrade(&mut t1, rid).unwrap();
            lm2.unlock(&mut t1, rid);
        });
        thread::sleep(Duration::from_millis(20));

        // the second upgrader loses immediately
        let err = lm.lock_upgrade(&mut t2, rid).unwrap_err();
        assert!(Error::is_abort(&err));
        assert!(t2.is_aborted());

        // t2 still holds its shared lock; releasing it unblocks t1
        lm.unlock(&mut t2, rid);
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_deadlock_detection_picks_victim() -> Result<()> {
        let lm = LockManager::new(Duration::from_millis(10));
        let a: Rid = (0, 0);
        let b: Rid = (0, 1);

        let mut t1 = txn(1);
        let mut t2 = txn(2);
        lm.lock_exclusive(&mut t1, a)?;
        lm.lock_exclusive(&mut t2, b)?;

        let lm1 = lm.clone();
        let h1 = thread::spawn(move || {
            let res = lm1.lock_exclusive(&mut t1, b);
            if res.is_ok() {
                lm1.unlock(&mut t1, b);
            }
            lm1.unlock(&mut t1, a);
            res.is_ok()
        });
        let lm2 = lm.clone();
        let h2 = thread::spawn(move || {
            let res = lm2.lock_exclusive(&mut t2, a);
            if res.is_ok() {
                lm2.unlock(&mut t2, a);
            }
            lm2.unlock(&mut t2, b);
            res.is_ok()
        });

        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();
        // exactly one of them was chosen as the victim
        assert!(r1 ^ r2, "expected exactly one survivor, got {r1} and {r2}");
        Ok(())
    }
}
