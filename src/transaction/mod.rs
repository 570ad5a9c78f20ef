pub mod lock_manager;

pub use lock_manager::LockManager;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::warn;
use parking_lot::Mutex;

use crate::record::{Row, RowId};
use crate::recovery::{LogPayload, LogStream};
use crate::table::TableHeap;

pub type TxnId = u32;
pub const INVALID_TXN_ID: TxnId = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Undo information for one heap mutation, replayed by the transaction
/// manager at commit (deferred deletes) or abort (rollback).
pub enum WriteRecord {
    Insert {
        rid: RowId,
        heap: Arc<TableHeap>,
    },
    Delete {
        rid: RowId,
        heap: Arc<TableHeap>,
    },
    Update {
        rid: RowId,
        old_row: Row,
        heap: Arc<TableHeap>,
    },
}

/// State is interior-mutable so the deadlock detector can abort a waiting
/// transaction from its own thread; the waiter observes the flip inside
/// its wait predicate.
pub struct Transaction {
    id: TxnId,
    isolation: IsolationLevel,
    state: Mutex<TxnState>,
    shared_lock_set: Mutex<HashSet<RowId>>,
    exclusive_lock_set: Mutex<HashSet<RowId>>,
    write_records: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Transaction {
            id,
            isolation,
            state: Mutex::new(TxnState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_records: Mutex::new(vec![]),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    pub fn is_shared_locked(&self, rid: RowId) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: RowId) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub(crate) fn add_shared_lock(&self, rid: RowId) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: RowId) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared_lock(&self, rid: RowId) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub(crate) fn remove_exclusive_lock(&self, rid: RowId) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    pub fn locked_rids(&self) -> Vec<RowId> {
        let mut rids: Vec<RowId> = self
            .shared_lock_set
            .lock()
            .iter()
            .chain(self.exclusive_lock_set.lock().iter())
            .copied()
            .collect();
        rids.sort_unstable();
        rids
    }

    pub fn record_write(&self, record: WriteRecord) {
        self.write_records.lock().push(record);
    }

    fn take_write_records(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.write_records.lock())
    }
}

/// Creates transactions and drives their termination protocol: deferred
/// deletes are applied at commit, aborts undo the write set in reverse,
/// and both paths release every lock (strict 2PL releases nothing
/// earlier).
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txns: Mutex<std::collections::HashMap<TxnId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
    log: Arc<LogStream>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log: Arc<LogStream>) -> Self {
        TransactionManager {
            next_txn_id: AtomicU32::new(0),
            txns: Mutex::new(std::collections::HashMap::new()),
            lock_manager,
            log,
        }
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let txn = Arc::new(Transaction::new(id, isolation));
        self.log.append(id, LogPayload::Begin);
        self.txns.lock().insert(id, txn.clone());
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        // deferred deletes become real now
        for record in txn.take_write_records() {
            if let WriteRecord::Delete { rid, heap } = record {
                heap.apply_delete(rid)?;
            }
        }
        self.log.append(txn.id(), LogPayload::Commit);
        self.log.drop_chain(txn.id());
        self.release_locks(txn);
        txn.set_state(TxnState::Committed);
        self.txns.lock().remove(&txn.id());
        Ok(())
    }

    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        // undo the write set newest-first
        for record in txn.take_write_records().into_iter().rev() {
            match record {
                WriteRecord::Insert { rid, heap } => heap.apply_delete(rid)?,
                WriteRecord::Delete { rid, heap } => heap.rollback_delete(rid)?,
                WriteRecord::Update { rid, old_row, heap } => {
                    if !heap.restore_tuple(rid, &old_row)? {
                        warn!("txn {}: could not restore row at {rid:?}", txn.id());
                    }
                }
            }
        }
        self.log.append(txn.id(), LogPayload::Abort);
        self.log.drop_chain(txn.id());
        self.release_locks(txn);
        txn.set_state(TxnState::Aborted);
        self.txns.lock().remove(&txn.id());
        Ok(())
    }

    fn release_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
