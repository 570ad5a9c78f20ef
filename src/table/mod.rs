pub mod table_iterator;

pub use table_iterator::TableIterator;

use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::buffer_pool::ArcBufferPool;
use crate::pages::table_page::{TablePage, TupleUpdate, MAX_TUPLE_SIZE};
use crate::pages::{PageId, INVALID_PAGE_ID};
use crate::record::{Row, RowId, Schema};
use crate::recovery::{LogPayload, LogStream};
use crate::transaction::{IsolationLevel, LockManager, Transaction, WriteRecord, INVALID_TXN_ID};

/// A table's tuples as a singly linked chain of slotted pages. Row-level
/// isolation comes from the lock manager; page latches only guard the
/// bytes of a single page access and are never held across pages.
pub struct TableHeap {
    bpm: ArcBufferPool,
    lock_manager: Arc<LockManager>,
    log: Arc<LogStream>,
    first_page_id: PageId,
    schema: Schema,
}

impl TableHeap {
    /// Create a heap with one empty page.
    pub fn new(
        bpm: ArcBufferPool,
        lock_manager: Arc<LockManager>,
        log: Arc<LogStream>,
        schema: Schema,
    ) -> Result<Arc<Self>> {
        let page = bpm.lock().new_page()?;
        let first_page_id = page.page_id();
        {
            let mut guard = page.write();
            TablePage::new(&mut *guard).init();
        }
        bpm.lock().unpin_page(first_page_id, true);
        debug!("new table heap rooted at page {first_page_id}");

        Ok(Arc::new(TableHeap {
            bpm,
            lock_manager,
            log,
            first_page_id,
            schema,
        }))
    }

    /// Reopen a persisted heap from its head page.
    pub fn open(
        bpm: ArcBufferPool,
        lock_manager: Arc<LockManager>,
        log: Arc<LogStream>,
        first_page_id: PageId,
        schema: Schema,
    ) -> Arc<Self> {
        Arc::new(TableHeap {
            bpm,
            lock_manager,
            log,
            first_page_id,
            schema,
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Walk the chain looking for space; extend it by one page at the tail
    /// and retry exactly once there. A false return means the tuple cannot
    /// fit any page.
    pub fn insert_tuple(
        self: &Arc<Self>,
        row: &mut Row,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<bool> {
        let mut bytes = vec![];
        row.serialize_to(&mut bytes, &self.schema);
        if bytes.len() > MAX_TUPLE_SIZE {
            return Ok(false);
        }

        let mut page_id = self.first_page_id;
        let mut created_page = false;
        loop {
            let page = self.bpm.lock().fetch_page(page_id)?;
            let (slot, next_page_id) = {
                let mut guard = page.write();
                let mut view = TablePage::new(&mut *guard);
                (view.insert_tuple(&bytes), view.next_page_id())
            };

            if let Some(slot) = slot {
                let rid = RowId::new(page_id, slot);
                let record = self
                    .log
                    .append(txn_id_of(txn), LogPayload::Insert { rid });
                {
                    let mut guard = page.write();
                    TablePage::new(&mut *guard).set_lsn(record.lsn());
                }
                self.bpm.lock().unpin_page(page_id, true);

                row.set_rid(rid);
                if let Some(txn) = txn {
                    self.lock_manager.lock_exclusive(txn, rid)?;
                    txn.record_write(WriteRecord::Insert {
                        rid,
                        heap: self.clone(),
                    });
                }
                return Ok(true);
            }

            if created_page {
                // no fit even on a brand-new page
                self.bpm.lock().unpin_page(page_id, false);
                return Ok(false);
            }

            if next_page_id == INVALID_PAGE_ID {
                let new_page = self.bpm.lock().new_page()?;
                let new_page_id = new_page.page_id();
                {
                    let mut guard = new_page.write();
                    TablePage::new(&mut *guard).init();
                }
                {
                    let mut guard = page.write();
                    TablePage::new(&mut *guard).set_next_page_id(new_page_id);
                }
                let mut bpm = self.bpm.lock();
                bpm.unpin_page(new_page_id, true);
                bpm.unpin_page(page_id, true);
                created_page = true;
                page_id = new_page_id;
            } else {
                self.bpm.lock().unpin_page(page_id, false);
                page_id = next_page_id;
            }
        }
    }

    /// Read a row by rid. Delete-marked and vacated slots read as `None`.
    pub fn get_tuple(
        &self,
        rid: RowId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<Option<Row>> {
        if let Some(txn) = txn {
            if txn.isolation() != IsolationLevel::ReadUncommitted
                && !txn.is_shared_locked(rid)
                && !txn.is_exclusive_locked(rid)
            {
                self.lock_manager.lock_shared(txn, rid)?;
            }
        }

        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        let row = {
            let guard = page.read();
            let view = TablePage::new(&*guard);
            view.tuple(rid.slot()).map(|bytes| {
                let mut row = Row::deserialize_from(bytes, &self.schema);
                row.set_rid(rid);
                row
            })
        };
        self.bpm.lock().unpin_page(rid.page_id(), false);
        Ok(row)
    }

    /// Flag the row deleted; the bytes go away when the transaction
    /// commits (`apply_delete`) or come back on abort (`rollback_delete`).
    pub fn mark_delete(
        self: &Arc<Self>,
        rid: RowId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<bool> {
        if let Some(txn) = txn {
            self.acquire_exclusive(txn, rid)?;
        }

        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        let marked = {
            let mut guard = page.write();
            let mut view = TablePage::new(&mut *guard);
            let marked = view.mark_delete(rid.slot());
            if marked {
                let record = self
                    .log
                    .append(txn_id_of(txn), LogPayload::Delete { rid });
                view.set_lsn(record.lsn());
            }
            marked
        };
        self.bpm.lock().unpin_page(rid.page_id(), marked);

        if marked {
            if let Some(txn) = txn {
                txn.record_write(WriteRecord::Delete {
                    rid,
                    heap: self.clone(),
                });
            }
        }
        Ok(marked)
    }

    /// Physically remove the tuple. Runs at commit time, or at abort time
    /// for a rolled-back insert.
    pub fn apply_delete(&self, rid: RowId) -> Result<()> {
        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        {
            let mut guard = page.write();
            let mut view = TablePage::new(&mut *guard);
            view.apply_delete(rid.slot());
            view.set_lsn(self.log.next_lsn());
        }
        self.bpm.lock().unpin_page(rid.page_id(), true);
        Ok(())
    }

    /// Clear a delete mark on abort.
    pub fn rollback_delete(&self, rid: RowId) -> Result<()> {
        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        {
            let mut guard = page.write();
            let mut view = TablePage::new(&mut *guard);
            view.rollback_delete(rid.slot());
            view.set_lsn(self.log.next_lsn());
        }
        self.bpm.lock().unpin_page(rid.page_id(), true);
        Ok(())
    }

    /// Replace the row in place when it fits; otherwise insert it
    /// elsewhere and mark-delete the original rid. The row's rid reports
    /// where it ended up. False when the original rid holds nothing.
    pub fn update_tuple(
        self: &Arc<Self>,
        row: &mut Row,
        rid: RowId,
        txn: Option<&Arc<Transaction>>,
    ) -> Result<bool> {
        if let Some(txn) = txn {
            self.acquire_exclusive(txn, rid)?;
        }
        let Some(old_row) = self.get_tuple(rid, None)? else {
            return Ok(false);
        };

        let mut bytes = vec![];
        row.serialize_to(&mut bytes, &self.schema);

        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        let outcome = {
            let mut guard = page.write();
            let mut view = TablePage::new(&mut *guard);
            let outcome = view.update_tuple(rid.slot(), &bytes);
            if matches!(outcome, TupleUpdate::Done) {
                let record = self.log.append(
                    txn_id_of(txn),
                    LogPayload::Update {
                        old_rid: rid,
                        new_rid: rid,
                    },
                );
                view.set_lsn(record.lsn());
            }
            outcome
        };
        self.bpm
            .lock()
            .unpin_page(rid.page_id(), matches!(outcome, TupleUpdate::Done));

        match outcome {
            TupleUpdate::Done => {
                row.set_rid(rid);
                if let Some(txn) = txn {
                    txn.record_write(WriteRecord::Update {
                        rid,
                        old_row,
                        heap: self.clone(),
                    });
                }
                Ok(true)
            }
            TupleUpdate::InvalidSlot => Ok(false),
            TupleUpdate::NoSpace => {
                // relocate, then retire the old position
                if !self.insert_tuple(row, txn)? {
                    return Ok(false);
                }
                self.mark_delete(rid, txn)?;
                Ok(true)
            }
        }
    }

    /// Write a row's previous image back in place. Used only to undo an
    /// in-place update during abort.
    pub fn restore_tuple(&self, rid: RowId, old_row: &Row) -> Result<bool> {
        let mut bytes = vec![];
        old_row.serialize_to(&mut bytes, &self.schema);

        let page = self.bpm.lock().fetch_page(rid.page_id())?;
        let restored = {
            let mut guard = page.write();
            matches!(
                TablePage::new(&mut *guard).update_tuple(rid.slot(), &bytes),
                TupleUpdate::Done
            )
        };
        self.bpm.lock().unpin_page(rid.page_id(), restored);
        Ok(restored)
    }

    /// Free every page of the chain.
    pub fn delete_table(&self) -> Result<()> {
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.lock().fetch_page(page_id)?;
            let next = {
                let guard = page.read();
                TablePage::new(&*guard).next_page_id()
            };
            let mut bpm = self.bpm.lock();
            bpm.unpin_page(page_id, false);
            bpm.delete_page(page_id)?;
            drop(bpm);
            page_id = next;
        }
        Ok(())
    }

    pub fn iter(self: &Arc<Self>, txn: Option<Arc<Transaction>>) -> TableIterator {
        TableIterator::new(self.clone(), txn)
    }

    fn acquire_exclusive(&self, txn: &Arc<Transaction>, rid: RowId) -> Result<()> {
        if txn.is_exclusive_locked(rid) {
            return Ok(());
        }
        if txn.is_shared_locked(rid) {
            self.lock_manager.lock_upgrade(txn, rid)
        } else {
            self.lock_manager.lock_exclusive(txn, rid)
        }
    }
}

fn txn_id_of(txn: Option<&Arc<Transaction>>) -> crate::transaction::TxnId {
    txn.map(|t| t.id()).unwrap_or(INVALID_TXN_ID)
}
