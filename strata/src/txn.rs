//! Transaction and lock manager stubs.
//!
//! Execution is single-threaded; these types exist so the heap, index and
//! catalog APIs keep their transaction parameters and compile unchanged once
//! real concurrency control lands.

use crate::RowId;

pub type TxnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// A transaction handle. Carried through the storage APIs but not consulted
/// by the single-threaded engine.
#[derive(Debug, Clone)]
pub struct Txn {
    id: TxnId,
    isolation_level: IsolationLevel,
}

impl Txn {
    pub fn new(id: TxnId) -> Self {
        Txn {
            id,
            isolation_level: IsolationLevel::RepeatableRead,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Lock manager interface. Every grant succeeds immediately under the
/// single-threaded execution model.
#[derive(Debug, Default)]
pub struct LockManager;

impl LockManager {
    pub fn new() -> Self {
        LockManager
    }

    pub fn lock_row(&self, _txn: &Txn, _rid: RowId, _mode: LockMode) -> bool {
        true
    }

    pub fn unlock_row(&self, _txn: &Txn, _rid: RowId) -> bool {
        true
    }

    pub fn unlock_all(&self, _txn: &Txn) {}
}

/// Reader/writer page latch. A placeholder until pages are shared between
/// threads; acquiring it is free.
#[derive(Debug, Default)]
pub struct PageLatch;

impl PageLatch {
    pub fn new() -> Self {
        PageLatch
    }

    pub fn rlock(&self) {}

    pub fn runlock(&self) {}

    pub fn wlock(&self) {}

    pub fn wunlock(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_manager_grants_everything() {
        let lm = LockManager::new();
        let txn = Txn::new(1);
        assert!(lm.lock_row(&txn, RowId::new(0, 0), LockMode::Exclusive));
        assert!(lm.unlock_row(&txn, RowId::new(0, 0)));
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }
}
