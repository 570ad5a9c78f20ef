use std::sync::Arc;

use crate::pages::table_page::TablePage;
use crate::pages::{PageId, INVALID_PAGE_ID};
use crate::record::{Row, RowId};
use crate::transaction::Transaction;

use super::TableHeap;

/// Chain-order scan over a table's live tuples; delete-marked slots are
/// skipped. Pages are pinned only while a tuple is being read, so an
/// iterator may be held across other heap operations.
pub struct TableIterator {
    heap: Arc<TableHeap>,
    txn: Option<Arc<Transaction>>,
    page_id: PageId,
    /// Slot the previous call returned; `None` before the first tuple of
    /// the current page.
    prev_slot: Option<u32>,
}

impl TableIterator {
    pub(super) fn new(heap: Arc<TableHeap>, txn: Option<Arc<Transaction>>) -> Self {
        TableIterator {
            page_id: heap.first_page_id(),
            heap,
            txn,
            prev_slot: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.page_id == INVALID_PAGE_ID
    }
}

impl std::fmt::Debug for TableIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIterator")
            .field("page_id", &self.page_id)
            .field("prev_slot", &self.prev_slot)
            .finish()
    }
}

/// Two iterators are equal when they sit on the same position; exhausted
/// iterators compare equal without touching any row.
impl PartialEq for TableIterator {
    fn eq(&self, other: &Self) -> bool {
        if self.is_end() && other.is_end() {
            return true;
        }
        self.page_id == other.page_id && self.prev_slot == other.prev_slot
    }
}

impl Iterator for TableIterator {
    type Item = (RowId, Row);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }
            let bpm = &self.heap.bpm;
            let page = bpm.lock().fetch_page(self.page_id).unwrap();
            let found = {
                let guard = page.read();
                let view = TablePage::new(&*guard);
                let slot = match self.prev_slot {
                    None => view.first_tuple_slot(),
                    Some(prev) => view.next_tuple_slot(prev),
                };
                match slot {
                    Some(slot) => Some((slot, view.next_page_id())),
                    None => {
                        self.page_id = view.next_page_id();
                        self.prev_slot = None;
                        None
                    }
                }
            };
            bpm.lock().unpin_page(page.page_id(), false);

            if let Some((slot, _)) = found {
                let rid = RowId::new(page.page_id(), slot);
                self.prev_slot = Some(slot);
                // the heap applies the read-locking protocol
                let row = self
                    .heap
                    .get_tuple(rid, self.txn.as_ref())
                    .unwrap()
                    .expect("slot vanished between scan and read");
                return Some((rid, row));
            }
        }
    }
}
