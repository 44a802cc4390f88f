use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{RwLock, RwLockReadGuard};

/// Reader-writer latch with manual acquire/release, so crabbing code can
/// release latches in traversal order instead of lexical scope.
#[derive(Debug, Default)]
pub struct Latch {
    lock: RwLock<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    pub fn rlock(&self) {
        unsafe { self.lock.raw() }.lock_shared();
    }

    pub fn try_rlock(&self) -> bool {
        unsafe { self.lock.raw() }.try_lock_shared()
    }

    pub fn runlock(&self) {
        unsafe { self.lock.raw().unlock_shared() };
    }

    pub fn wlock(&self) {
        unsafe { self.lock.raw() }.lock_exclusive();
    }

    pub fn try_wlock(&self) -> bool {
        unsafe { self.lock.raw() }.try_lock_exclusive()
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.raw().unlock_exclusive() };
    }

    pub fn rguard(&self) -> RwLockReadGuard<()> {
        self.lock.read()
    }

    #[allow(unused)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
