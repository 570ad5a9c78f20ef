use std::ops::{Deref, DerefMut};

use super::{PageBuf, PageId, INVALID_PAGE_ID, PAGE_SIZE};

const NEXT_PAGE_ID: usize = 0;
const LSN: usize = 4;
const FREE_SPACE_PTR: usize = 8;
const TUPLE_COUNT: usize = 12;
const SLOTS: usize = 16;
const SLOT_SIZE: usize = 8;

/// High bit of the slot size flags a mark-deleted tuple; the bytes stay in
/// place until the delete is applied.
const DELETED_MASK: u32 = 1 << 31;

/// Largest tuple a fresh page can take (one slot plus the payload).
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - SLOTS - SLOT_SIZE;

pub enum TupleUpdate {
    Done,
    /// The new payload does not fit in this page; relocate through the heap.
    NoSpace,
    InvalidSlot,
}

/// Slotted tuple page: the slot array grows up from the header while tuple
/// bytes grow down from the page end. Slot ids are stable for the life of
/// the page; applying a delete empties the slot but never renumbers.
pub struct TablePage<D> {
    buf: D,
}

impl<D: Deref<Target = PageBuf>> TablePage<D> {
    pub fn new(buf: D) -> Self {
        TablePage { buf }
    }

    pub fn next_page_id(&self) -> PageId {
        self.buf.read_i32(NEXT_PAGE_ID)
    }

    pub fn lsn(&self) -> u32 {
        self.buf.read_u32(LSN)
    }

    pub fn tuple_count(&self) -> u32 {
        self.buf.read_u32(TUPLE_COUNT)
    }

    fn free_space_ptr(&self) -> u32 {
        self.buf.read_u32(FREE_SPACE_PTR)
    }

    /// Bytes left between the slot array and the tuple data.
    pub fn free_space(&self) -> usize {
        self.free_space_ptr() as usize - (SLOTS + self.tuple_count() as usize * SLOT_SIZE)
    }

    fn slot(&self, slot_id: u32) -> (u32, u32) {
        let base = SLOTS + slot_id as usize * SLOT_SIZE;
        (self.buf.read_u32(base), self.buf.read_u32(base + 4))
    }

    fn is_live(&self, slot_id: u32) -> bool {
        let (_, size) = self.slot(slot_id);
        size != 0 && size & DELETED_MASK == 0
    }

    /// The raw bytes of a live tuple; `None` for empty or mark-deleted
    /// slots.
    pub fn tuple(&self, slot_id: u32) -> Option<&[u8]> {
        if slot_id >= self.tuple_count() || !self.is_live(slot_id) {
            return None;
        }
        let (offset, size) = self.slot(slot_id);
        Some(self.buf.read_bytes(offset as usize, size as usize))
    }

    pub fn first_tuple_slot(&self) -> Option<u32> {
        (0..self.tuple_count()).find(|&slot| self.is_live(slot))
    }

    pub fn next_tuple_slot(&self, after: u32) -> Option<u32> {
        (after + 1..self.tuple_count()).find(|&slot| self.is_live(slot))
    }
}

impl<D: DerefMut<Target = PageBuf>> TablePage<D> {
    pub fn init(&mut self) {
        self.buf.write_i32(NEXT_PAGE_ID, INVALID_PAGE_ID);
        self.buf.write_u32(LSN, 0);
        self.buf.write_u32(FREE_SPACE_PTR, PAGE_SIZE as u32);
        self.buf.write_u32(TUPLE_COUNT, 0);
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.buf.write_i32(NEXT_PAGE_ID, page_id);
    }

    pub fn set_lsn(&mut self, lsn: u32) {
        self.buf.write_u32(LSN, lsn);
    }

    fn set_slot(&mut self, slot_id: u32, offset: u32, size: u32) {
        let base = SLOTS + slot_id as usize * SLOT_SIZE;
        self.buf.write_u32(base, offset);
        self.buf.write_u32(base + 4, size);
    }

    /// Write the tuple into this page, reusing an emptied slot when one
    /// exists. `None` when the payload does not fit.
    pub fn insert_tuple(&mut self, data: &[u8]) -> Option<u32> {
        assert!(!data.is_empty());
        let recycled = (0..self.tuple_count()).find(|&slot| self.slot(slot).1 == 0);
        let needed = data.len() + if recycled.is_some() { 0 } else { SLOT_SIZE };
        if self.free_space() < needed {
            return None;
        }

        let offset = self.free_space_ptr() - data.len() as u32;
        self.buf.write_bytes(offset as usize, data);
        self.buf.write_u32(FREE_SPACE_PTR, offset);

        let slot_id = recycled.unwrap_or_else(|| {
            let slot_id = self.tuple_count();
            self.buf.write_u32(TUPLE_COUNT, slot_id + 1);
            slot_id
        });
        self.set_slot(slot_id, offset, data.len() as u32);
        Some(slot_id)
    }

    /// Flag the tuple deleted without moving bytes. False for slots that
    /// hold nothing.
    pub fn mark_delete(&mut self, slot_id: u32) -> bool {
        if slot_id >= self.tuple_count() {
            return false;
        }
        let (offset, size) = self.slot(slot_id);
        if size == 0 {
            return false;
        }
        self.set_slot(slot_id, offset, size | DELETED_MASK);
        true
    }

    /// Undo a mark-delete.
    pub fn rollback_delete(&mut self, slot_id: u32) {
        if slot_id >= self.tuple_count() {
            return;
        }
        let (offset, size) = self.slot(slot_id);
        self.set_slot(slot_id, offset, size & !DELETED_MASK);
    }

    /// Physically remove the tuple and compact the data region. The slot
    /// stays allocated (empty) so later slot ids keep their meaning.
    pub fn apply_delete(&mut self, slot_id: u32) {
        if slot_id >= self.tuple_count() {
            return;
        }
        let (offset, size) = self.slot(slot_id);
        let size = size & !DELETED_MASK;
        if size == 0 {
            return;
        }

        let fsp = self.free_space_ptr();
        self.buf
            .shift(fsp as usize + size as usize, fsp as usize, (offset - fsp) as usize);
        self.buf.write_u32(FREE_SPACE_PTR, fsp + size);
        self.set_slot(slot_id, 0, 0);

        for other in 0..self.tuple_count() {
            let (o_offset, o_size) = self.slot(other);
            if o_size != 0 && o_offset < offset {
                self.set_slot(other, o_offset + size, o_size);
            }
        }
    }

    /// Replace the tuple in place when the new payload fits; otherwise
    /// report whether the slot or the space was the problem.
    pub fn update_tuple(&mut self, slot_id: u32, data: &[u8]) -> TupleUpdate {
        if slot_id >= self.tuple_count() {
            return TupleUpdate::InvalidSlot;
        }
        let (offset, raw_size) = self.slot(slot_id);
        if raw_size == 0 || raw_size & DELETED_MASK != 0 {
            return TupleUpdate::InvalidSlot;
        }
        let old_size = raw_size;
        if self.free_space() + (old_size as usize) < data.len() {
            return TupleUpdate::NoSpace;
        }

        // shift everything below this tuple so its end offset is preserved
        let fsp = self.free_space_ptr();
        let delta = old_size as i64 - data.len() as i64;
        let new_fsp = (fsp as i64 + delta) as u32;
        self.buf
            .shift(new_fsp as usize, fsp as usize, (offset - fsp) as usize);

        let new_offset = (offset as i64 + delta) as u32;
        self.buf.write_bytes(new_offset as usize, data);
        self.buf.write_u32(FREE_SPACE_PTR, new_fsp);
        self.set_slot(slot_id, new_offset, data.len() as u32);

        for other in 0..self.tuple_count() {
            if other == slot_id {
                continue;
            }
            let (o_offset, o_size) = self.slot(other);
            if o_size != 0 && o_offset < offset {
                self.set_slot(other, (o_offset as i64 + delta) as u32, o_size);
            }
        }
        TupleUpdate::Done
    }
}
