use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::record::RowId;
use crate::transaction::TxnId;

pub type Lsn = u32;
pub const INVALID_LSN: Lsn = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: RowId },
    Delete { rid: RowId },
    Update { old_rid: RowId, new_rid: RowId },
}

/// One mutation's log entry. Recovery itself is out of scope; pages stamp
/// the lsn and transactions chain through `prev_lsn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    lsn: Lsn,
    prev_lsn: Lsn,
    txn_id: TxnId,
    payload: LogPayload,
}

impl LogRecord {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn payload(&self) -> &LogPayload {
        &self.payload
    }
}

/// Mints log records: a monotone lsn counter plus the per-transaction
/// chain of previous lsns. One instance per engine, handed to the table
/// heap and the transaction manager.
#[derive(Default)]
pub struct LogStream {
    next_lsn: AtomicU32,
    prev_lsn: Mutex<HashMap<TxnId, Lsn>>,
}

impl LogStream {
    pub fn new() -> Self {
        LogStream::default()
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.fetch_add(1, Ordering::Relaxed)
    }

    /// Last lsn this transaction logged, or [`INVALID_LSN`].
    pub fn prev_lsn_of(&self, txn_id: TxnId) -> Lsn {
        *self.prev_lsn.lock().get(&txn_id).unwrap_or(&INVALID_LSN)
    }

    pub fn append(&self, txn_id: TxnId, payload: LogPayload) -> LogRecord {
        let lsn = self.next_lsn();
        let prev_lsn = self
            .prev_lsn
            .lock()
            .insert(txn_id, lsn)
            .unwrap_or(INVALID_LSN);
        LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            payload,
        }
    }

    /// Forget a finished transaction's chain.
    pub fn drop_chain(&self, txn_id: TxnId) {
        self.prev_lsn.lock().remove(&txn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsns_are_monotone() {
        let log = LogStream::new();
        let a = log.append(1, LogPayload::Begin);
        let b = log.append(2, LogPayload::Begin);
        let c = log.append(1, LogPayload::Commit);
        assert!(a.lsn() < b.lsn());
        assert!(b.lsn() < c.lsn());
    }

    #[test]
    fn test_prev_lsn_chains_per_txn() {
        let log = LogStream::new();
        let begin = log.append(7, LogPayload::Begin);
        assert_eq!(begin.prev_lsn(), INVALID_LSN);

        let insert = log.append(7, LogPayload::Insert { rid: RowId::new(1, 0) });
        assert_eq!(insert.prev_lsn(), begin.lsn());

        // another transaction's chain is independent
        let other = log.append(8, LogPayload::Begin);
        assert_eq!(other.prev_lsn(), INVALID_LSN);

        assert_eq!(log.prev_lsn_of(7), insert.lsn());
        log.drop_chain(7);
        assert_eq!(log.prev_lsn_of(7), INVALID_LSN);
    }
}
