//! Recovery over the operation log's abstract key/value model.
//!
//! Redo replays every logged mutation from the last checkpoint forward;
//! undo then rolls back the transactions that never committed. The data
//! model is an in-memory map, standing in for the storage layer until
//! page-level logging is wired through.

use std::collections::HashMap;

use crate::log::{LogRecord, Lsn, INVALID_LSN};
use crate::txn::TxnId;

pub type KvDatabase = HashMap<String, i32>;

/// State captured at a checkpoint: the persisted data image plus the
/// transactions still active at that moment.
#[derive(Debug, Default, Clone)]
pub struct Checkpoint {
    pub checkpoint_lsn: Lsn,
    pub active_txns: HashMap<TxnId, Lsn>,
    pub persist_data: KvDatabase,
}

impl Checkpoint {
    pub fn new(checkpoint_lsn: Lsn) -> Checkpoint {
        Checkpoint {
            checkpoint_lsn,
            active_txns: HashMap::new(),
            persist_data: KvDatabase::new(),
        }
    }

    pub fn add_active_txn(&mut self, txn_id: TxnId, last_lsn: Lsn) {
        self.active_txns.insert(txn_id, last_lsn);
    }

    pub fn add_data(&mut self, key: impl Into<String>, value: i32) {
        self.persist_data.insert(key.into(), value);
    }
}

pub struct RecoveryManager {
    persist_lsn: Lsn,
    active_txns: HashMap<TxnId, Lsn>,
    /// Undo journal per live transaction, in apply order.
    txn_records: HashMap<TxnId, Vec<LogRecord>>,
    data: KvDatabase,
}

impl RecoveryManager {
    pub fn new(checkpoint: Checkpoint) -> RecoveryManager {
        RecoveryManager {
            persist_lsn: checkpoint.checkpoint_lsn,
            active_txns: checkpoint.active_txns,
            txn_records: HashMap::new(),
            data: checkpoint.persist_data,
        }
    }

    /// Replays committed history: every record past the checkpoint is
    /// re-applied in log order.
    pub fn redo_phase(&mut self, log: &[(Lsn, LogRecord)]) {
        for (lsn, record) in log {
            if self.persist_lsn != INVALID_LSN && *lsn < self.persist_lsn {
                continue;
            }
            self.active_txns.insert(record.txn_id(), *lsn);
            match record {
                LogRecord::Begin { txn_id } => {
                    self.txn_records.insert(*txn_id, Vec::new());
                }
                LogRecord::Commit { txn_id } | LogRecord::Abort { txn_id } => {
                    self.active_txns.remove(txn_id);
                    self.txn_records.remove(txn_id);
                }
                LogRecord::Insert { txn_id, key, value } => {
                    self.data.insert(key.clone(), *value);
                    self.journal(*txn_id, record.clone());
                }
                LogRecord::Delete { txn_id, key, .. } => {
                    self.data.remove(key);
                    self.journal(*txn_id, record.clone());
                }
                LogRecord::Update {
                    txn_id,
                    key,
                    new_value,
                    ..
                } => {
                    self.data.insert(key.clone(), *new_value);
                    self.journal(*txn_id, record.clone());
                }
            }
        }
    }

    /// Rolls back every transaction still active after redo, newest change
    /// first.
    pub fn undo_phase(&mut self) {
        let live: Vec<TxnId> = self.active_txns.keys().copied().collect();
        for txn_id in live {
            if let Some(records) = self.txn_records.remove(&txn_id) {
                for record in records.iter().rev() {
                    match record {
                        LogRecord::Insert { key, .. } => {
                            self.data.remove(key);
                        }
                        LogRecord::Delete { key, value, .. } => {
                            self.data.insert(key.clone(), *value);
                        }
                        LogRecord::Update {
                            key, old_value, ..
                        } => {
                            self.data.insert(key.clone(), *old_value);
                        }
                        _ => {}
                    }
                }
            }
            self.active_txns.remove(&txn_id);
        }
    }

    pub fn data(&self) -> &KvDatabase {
        &self.data
    }

    fn journal(&mut self, txn_id: TxnId, record: LogRecord) {
        self.txn_records.entry(txn_id).or_default().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_entry(lsn: Lsn, record: LogRecord) -> (Lsn, LogRecord) {
        (lsn, record)
    }

    #[test]
    fn committed_changes_survive_recovery() {
        let mut rm = RecoveryManager::new(Checkpoint::new(0));
        let log = vec![
            log_entry(0, LogRecord::Begin { txn_id: 1 }),
            log_entry(
                10,
                LogRecord::Insert {
                    txn_id: 1,
                    key: "a".into(),
                    value: 5,
                },
            ),
            log_entry(
                20,
                LogRecord::Update {
                    txn_id: 1,
                    key: "a".into(),
                    old_value: 5,
                    new_value: 9,
                },
            ),
            log_entry(30, LogRecord::Commit { txn_id: 1 }),
        ];
        rm.redo_phase(&log);
        rm.undo_phase();
        assert_eq!(rm.data().get("a"), Some(&9));
    }

    #[test]
    fn uncommitted_changes_are_undone() {
        let mut rm = RecoveryManager::new(Checkpoint::new(0));
        let log = vec![
            log_entry(0, LogRecord::Begin { txn_id: 1 }),
            log_entry(
                10,
                LogRecord::Insert {
                    txn_id: 1,
                    key: "a".into(),
                    value: 5,
                },
            ),
            log_entry(20, LogRecord::Begin { txn_id: 2 }),
            log_entry(
                30,
                LogRecord::Delete {
                    txn_id: 2,
                    key: "b".into(),
                    value: 7,
                },
            ),
        ];
        let mut checkpoint = Checkpoint::new(0);
        checkpoint.add_data("b", 7);
        let mut rm2 = RecoveryManager::new(checkpoint);
        rm2.redo_phase(&log);
        rm2.undo_phase();
        // Both transactions were live at the crash: the insert vanishes and
        // the delete is rolled back.
        assert_eq!(rm2.data().get("a"), None);
        assert_eq!(rm2.data().get("b"), Some(&7));

        rm.redo_phase(&log);
        rm.undo_phase();
        assert_eq!(rm.data().get("a"), None);
    }

    #[test]
    fn records_before_the_checkpoint_are_skipped() {
        let mut checkpoint = Checkpoint::new(20);
        checkpoint.add_data("a", 1);
        let mut rm = RecoveryManager::new(checkpoint);
        let log = vec![
            log_entry(
                0,
                LogRecord::Insert {
                    txn_id: 1,
                    key: "a".into(),
                    value: 99,
                },
            ),
            log_entry(20, LogRecord::Begin { txn_id: 2 }),
            log_entry(
                30,
                LogRecord::Insert {
                    txn_id: 2,
                    key: "c".into(),
                    value: 3,
                },
            ),
            log_entry(40, LogRecord::Commit { txn_id: 2 }),
        ];
        rm.redo_phase(&log);
        rm.undo_phase();
        // The pre-checkpoint insert is already reflected in the persisted
        // image and must not be replayed.
        assert_eq!(rm.data().get("a"), Some(&1));
        assert_eq!(rm.data().get("c"), Some(&3));
    }
}
