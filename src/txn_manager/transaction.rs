use std::collections::HashSet;

use crate::pages::{Lsn, INVALID_LSN};
use crate::tuple::Rid;

pub type TxnId = i32;
pub const INVALID_TXN_ID: TxnId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

/// Two-phase locking stage. Releasing any lock (except shared locks under
/// READ_COMMITTED) moves a transaction into SHRINKING, after which
/// acquiring a lock is a coding error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStage {
    Growing,
    Shrinking,
}

/// Deferred work to run at transaction end; receives the context so it can
/// emit log records on the transaction's chain.
pub type EndAction = Box<dyn FnOnce(&mut Transaction) + Send>;

/// Everything a running transaction carries: 2PL lock sets and stage, the
/// prev-LSN chain for the log, and the commit/abort action lists.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: TransactionState,
    stage: LockStage,
    prev_lsn: Lsn,
    shared_lock_set: HashSet<Rid>,
    exclusive_lock_set: HashSet<Rid>,
    commit_actions: Vec<EndAction>,
    abort_actions: Vec<EndAction>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: TransactionState::Running,
            stage: LockStage::Growing,
            prev_lsn: INVALID_LSN,
            shared_lock_set: HashSet::new(),
            exclusive_lock_set: HashSet::new(),
            commit_actions: Vec::new(),
            abort_actions: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TransactionState::Aborted
    }

    pub fn set_aborted(&mut self) {
        assert_ne!(self.state, TransactionState::Committed);
        self.state = TransactionState::Aborted;
    }

    pub fn set_committed(&mut self) {
        assert_eq!(self.state, TransactionState::Running);
        self.state = TransactionState::Committed;
    }

    pub fn stage(&self) -> LockStage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: LockStage) {
        self.stage = stage;
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn set_prev_lsn(&mut self, lsn: Lsn) {
        self.prev_lsn = lsn;
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.contains(&rid)
    }

    pub(crate) fn shared_lock_set(&mut self) -> &mut HashSet<Rid> {
        &mut self.shared_lock_set
    }

    pub(crate) fn exclusive_lock_set(&mut self) -> &mut HashSet<Rid> {
        &mut self.exclusive_lock_set
    }

    /// Every RID this transaction holds a lock on, in either mode.
    pub(crate) fn locked_rids(&self) -> Vec<Rid> {
        self.shared_lock_set
            .iter()
            .chain(self.exclusive_lock_set.iter())
            .copied()
            .collect()
    }

    pub fn register_commit_action(&mut self, action: EndAction) {
        self.commit_actions.push(action);
    }

    pub fn register_abort_action(&mut self, action: EndAction) {
        self.abort_actions.push(action);
    }

    pub(crate) fn take_commit_actions(&mut self) -> Vec<EndAction> {
        std::mem::take(&mut self.commit_actions)
    }

    pub(crate) fn take_abort_actions(&mut self) -> Vec<EndAction> {
        std::mem::take(&mut self.abort_actions)
    }
}
