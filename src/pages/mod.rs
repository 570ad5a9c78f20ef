pub(crate) mod b_plus_tree_internal_page;
pub(crate) mod b_plus_tree_leaf_page;
pub(crate) mod b_plus_tree_page;
pub(crate) mod bitmap_page;
pub(crate) mod disk_meta_page;
pub(crate) mod index_roots_page;
pub(crate) mod table_page;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const PAGE_SIZE: usize = 4096; // 4 KBs

pub type PageId = i32;
pub const INVALID_PAGE_ID: PageId = -1;

/// Logical page 0 holds the catalog meta, page 1 the index-roots registry.
pub const CATALOG_META_PAGE_ID: PageId = 0;
pub const INDEX_ROOTS_PAGE_ID: PageId = 1;

/// Raw page bytes. All access goes through the bounded little-endian
/// accessors; typed page views are layered on top of these.
#[derive(Debug)]
pub struct PageBuf {
    data: [u8; PAGE_SIZE],
}

impl Default for PageBuf {
    fn default() -> Self {
        PageBuf {
            data: [0u8; PAGE_SIZE],
        }
    }
}

impl PageBuf {
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data = [0u8; PAGE_SIZE];
    }

    pub fn copy_from(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len(), PAGE_SIZE);
        self.data.copy_from_slice(bytes);
    }

    pub fn read_bytes(&self, start: usize, len: usize) -> &[u8] {
        &self.data[start..start + len]
    }

    pub fn write_bytes(&mut self, start: usize, bytes: &[u8]) {
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Move `len` bytes from `src` to `dst` within the page, ranges may
    /// overlap.
    pub fn shift(&mut self, dst: usize, src: usize, len: usize) {
        self.data.copy_within(src..src + len, dst);
    }
}

/// A page resident in the buffer pool. The embedded rwlock is the page
/// latch: callers take `read()` or `write()` around every byte-level
/// access, and build at most one typed view per guard.
#[derive(Debug)]
pub struct Page {
    page_id: PageId,
    data: RwLock<PageBuf>,
}

pub type PageRef = Arc<Page>;

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Page::from_buf(page_id, PageBuf::default())
    }

    pub fn from_buf(page_id: PageId, buf: PageBuf) -> Self {
        Page {
            page_id,
            data: RwLock::new(buf),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.data.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_round_trip() {
        let mut buf = PageBuf::default();
        buf.write_u32(0, 0xDEAD_BEEF);
        buf.write_i32(4, -7);
        buf.write_bytes(8, b"minirel");

        assert_eq!(buf.read_u32(0), 0xDEAD_BEEF);
        assert_eq!(buf.read_i32(4), -7);
        assert_eq!(buf.read_bytes(8, 7), b"minirel");
        // fixed little-endian framing
        assert_eq!(buf.as_bytes()[0], 0xEF);
    }

    #[test]
    fn test_shift_overlapping() {
        let mut buf = PageBuf::default();
        buf.write_bytes(0, &[1, 2, 3, 4, 5]);
        buf.shift(1, 0, 4);
        assert_eq!(buf.read_bytes(0, 5), &[1, 1, 2, 3, 4]);
    }
}
