use crate::buffer_pool::ArcBufferPool;
use crate::index::key_manager::KeyManager;
use crate::pages::b_plus_tree_leaf_page::BTreeLeafPage;
use crate::pages::{PageId, INVALID_PAGE_ID};
use crate::record::{Row, RowId};

/// Forward scan over the leaf chain. Holds only `(leaf page id, slot)` and
/// pins a page just long enough to read one pair, so an iterator can be
/// kept across other operations without blocking eviction.
pub struct IndexIterator {
    bpm: ArcBufferPool,
    km: KeyManager,
    page_id: PageId,
    slot: u32,
}

impl IndexIterator {
    pub(crate) fn new(bpm: ArcBufferPool, km: KeyManager, page_id: PageId, slot: u32) -> Self {
        IndexIterator {
            bpm,
            km,
            page_id,
            slot,
        }
    }

    pub(crate) fn end(bpm: ArcBufferPool, km: KeyManager) -> Self {
        Self::new(bpm, km, INVALID_PAGE_ID, 0)
    }

    pub fn is_end(&self) -> bool {
        self.page_id == INVALID_PAGE_ID
    }
}

impl PartialEq for IndexIterator {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.slot == other.slot
    }
}

impl Iterator for IndexIterator {
    type Item = (Row, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }
            let page = self.bpm.lock().fetch_page(self.page_id).unwrap();
            let result = {
                let guard = page.read();
                let leaf = BTreeLeafPage::new(&*guard);
                if self.slot < leaf.size() {
                    Some((
                        self.km.decode(leaf.key_at(self.slot)),
                        leaf.value_at(self.slot),
                    ))
                } else {
                    self.page_id = leaf.next_page_id();
                    self.slot = 0;
                    None
                }
            };
            self.bpm.lock().unpin_page(page.page_id(), false);

            if let Some(pair) = result {
                self.slot += 1;
                return Some(pair);
            }
        }
    }
}
