mod frame;
mod replacer;

pub use replacer::ReplacerAlgorithm;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use log::debug;
use parking_lot::Mutex;

use crate::disk_manager::DiskManager;
use crate::errors::Error;
use crate::pages::{Page, PageBuf, PageId, PageRef};
use frame::Frame;

pub type FrameId = usize;
pub type ArcBufferPool = Arc<Mutex<BufferPoolManager>>;

/// Fixed array of frames fronted by a page table. Every disk access of the
/// engine funnels through here; callers pin a page, latch it, and unpin it
/// declaring whether they dirtied it.
///
/// Invariants after every call: a resident page maps to exactly one frame,
/// a frame is in the free list xor the page table, and the replacer holds
/// exactly the resident frames with pin count zero.
pub struct BufferPoolManager {
    disk_manager: Arc<DiskManager>,

    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,

    replacer: Box<dyn replacer::Replacer>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::with_replacer(pool_size, disk_manager, ReplacerAlgorithm::Lru)
    }

    pub fn with_replacer(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        algorithm: ReplacerAlgorithm,
    ) -> Self {
        Self {
            disk_manager,
            frames: (0..pool_size).map(|_| Frame::new()).collect(),
            page_table: HashMap::with_capacity(pool_size),
            free_list: (0..pool_size).collect(),
            replacer: replacer::build(algorithm, pool_size),
        }
    }

    /// Pin the page, reading it from disk if it is not resident. Fails with
    /// [`Error::OutOfMemory`] when every frame is pinned.
    pub fn fetch_page(&mut self, page_id: PageId) -> Result<PageRef> {
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            let frame = &mut self.frames[frame_id];
            frame.pin();
            if frame.pin_count() == 1 {
                self.replacer.pin(frame_id);
            }
            return Ok(frame.page());
        }

        // read before taking a frame so a bad page id cannot leak one
        let mut buf = PageBuf::default();
        self.disk_manager.read_page(page_id, &mut buf)?;
        let frame_id = self.find_free_frame()?;

        let frame = &mut self.frames[frame_id];
        frame.reset(Arc::new(Page::from_buf(page_id, buf)));
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);
        Ok(frame.page())
    }

    /// Allocate a logical page on disk and pin a zeroed frame for it.
    pub fn new_page(&mut self) -> Result<PageRef> {
        let frame_id = self.find_free_frame()?;
        let page_id = match self.disk_manager.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                // hand the frame back, nothing was installed yet
                self.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = &mut self.frames[frame_id];
        frame.reset(Arc::new(Page::new(page_id)));
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        debug!("new page {page_id} pinned in frame {frame_id}");
        Ok(frame.page())
    }

    /// Drop one pin. The dirty flag is monotone: once set it sticks until
    /// the page is flushed. Returns false if the page is not resident or
    /// already unpinned.
    pub fn unpin_page(&mut self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return false;
        };
        let frame = &mut self.frames[frame_id];
        if frame.pin_count() == 0 {
            return false;
        }
        frame.unpin();
        if is_dirty {
            frame.mark_dirty();
        }
        if frame.pin_count() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Evict the page from the pool and return its storage to the disk
    /// manager. Refuses (returns false) while the page is pinned; deleting
    /// a non-resident page only touches the disk bitmap.
    pub fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            let frame = &mut self.frames[frame_id];
            if frame.pin_count() > 0 {
                return Ok(false);
            }
            self.page_table.remove(&page_id);
            self.replacer.pin(frame_id);
            frame.reset(Arc::new(Page::new(crate::pages::INVALID_PAGE_ID)));
            self.free_list.push_back(frame_id);
        }
        self.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Write the page back if dirty, clearing the dirty bit. Returns false
    /// if the page is not resident.
    pub fn flush_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &mut self.frames[frame_id];
        if frame.is_dirty() {
            self.disk_manager.write_page(page_id, &frame.page().read())?;
            frame.clear_dirty();
        }
        Ok(true)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        let resident: Vec<PageId> = self.page_table.keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    pub fn disk_manager(&self) -> Arc<DiskManager> {
        self.disk_manager.clone()
    }

    fn find_free_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.pop_front() {
            return Ok(frame_id);
        }
        let Some(frame_id) = self.replacer.victim() else {
            bail!(Error::OutOfMemory);
        };
        let frame = &mut self.frames[frame_id];
        let old_page_id = frame.page_id();
        if frame.is_dirty() {
            debug!("evicting dirty page {old_page_id} from frame {frame_id}");
            self.disk_manager
                .write_page(old_page_id, &frame.page().read())?;
            frame.clear_dirty();
        }
        self.page_table.remove(&old_page_id);
        Ok(frame_id)
    }

    #[cfg(test)]
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let frame_id = *self.page_table.get(&page_id)?;
        Some(self.frames[frame_id].pin_count())
    }

    #[cfg(test)]
    pub fn resident_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self.page_table.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    #[cfg(test)]
    pub fn all_unpinned(&self) -> bool {
        self.frames.iter().all(|f| f.pin_count() == 0)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::disk_manager::tests::test_disk_manager;
    use tempfile::TempDir;

    pub fn test_arc_bpm(pool_size: usize) -> (TempDir, ArcBufferPool) {
        let (dir, disk) = test_disk_manager();
        let bpm = BufferPoolManager::new(pool_size, Arc::new(disk));
        (dir, Arc::new(Mutex::new(bpm)))
    }

    #[test]
    fn test_lru_eviction_order() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(3);
        let mut bpm = bpm.lock();

        let mut ids = vec![];
        for _ in 0..3 {
            let page = bpm.new_page()?;
            ids.push(page.page_id());
            bpm.unpin_page(page.page_id(), false);
        }

        // all three frames taken; a fourth page must evict ids[0]
        let page = bpm.new_page()?;
        bpm.unpin_page(page.page_id(), false);

        let mut expected = vec![ids[1], ids[2], page.page_id()];
        expected.sort_unstable();
        assert_eq!(bpm.resident_pages(), expected);
        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(2);
        let mut bpm = bpm.lock();

        let p1 = bpm.new_page()?.page_id();
        let p2 = bpm.new_page()?.page_id();

        let err = bpm.new_page().unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::OutOfMemory);

        bpm.unpin_page(p1, false);
        assert!(bpm.new_page().is_ok());

        bpm.unpin_page(p2, false);
        Ok(())
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(1);
        let mut bpm = bpm.lock();

        let page = bpm.new_page()?;
        let page_id = page.page_id();
        page.write().write_u32(0, 1234);
        drop(page);
        bpm.unpin_page(page_id, true);

        // force an eviction, then bring the page back
        let other = bpm.new_page()?;
        bpm.unpin_page(other.page_id(), false);
        drop(other);

        let page = bpm.fetch_page(page_id)?;
        assert_eq!(page.read().read_u32(0), 1234);
        drop(page);
        bpm.unpin_page(page_id, false);
        Ok(())
    }

    #[test]
    fn test_unpin_is_refused_at_zero() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(2);
        let mut bpm = bpm.lock();

        let page_id = bpm.new_page()?.page_id();
        assert!(bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(999, false));
        Ok(())
    }

    #[test]
    fn test_dirty_bit_is_monotone() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(2);
        let mut bpm = bpm.lock();

        let new_page_id = bpm.new_page()?.page_id();
        let page = bpm.fetch_page(new_page_id)?;
        let page_id = page.page_id();
        page.write().write_u32(0, 9);
        drop(page);

        bpm.unpin_page(page_id, true);
        // a later clean unpin must not wash out the dirty bit
        bpm.unpin_page(page_id, false);

        assert!(bpm.flush_page(page_id)?);
        let mut buf = PageBuf::default();
        bpm.disk_manager().read_page(page_id, &mut buf)?;
        assert_eq!(buf.read_u32(0), 9);
        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(2);
        let mut bpm = bpm.lock();

        let page_id = bpm.new_page()?.page_id();
        // still pinned
        assert!(!bpm.delete_page(page_id)?);

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id)?);
        assert!(bpm.disk_manager().is_page_free(page_id)?);

        // not resident: vacuously deleted
        assert!(bpm.delete_page(page_id)?);
        Ok(())
    }

    #[test]
    fn test_fetch_pins_again() -> Result<()> {
        let (_dir, bpm) = test_arc_bpm(2);
        let mut bpm = bpm.lock();

        let page_id = bpm.new_page()?.page_id();
        let _second = bpm.fetch_page(page_id)?;
        assert_eq!(bpm.pin_count(page_id), Some(2));

        bpm.unpin_page(page_id, false);
        bpm.unpin_page(page_id, false);
        assert_eq!(bpm.pin_count(page_id), Some(0));
        Ok(())
    }

    #[test]
    fn test_clock_replacer_pool() -> Result<()> {
        let (_dir, disk) = test_disk_manager();
        let mut bpm =
            BufferPoolManager::with_replacer(2, Arc::new(disk), ReplacerAlgorithm::Clock);

        let p1 = bpm.new_page()?.page_id();
        let p2 = bpm.new_page()?.page_id();
        bpm.unpin_page(p1, false);
        bpm.unpin_page(p2, false);

        let p3 = bpm.new_page()?.page_id();
        bpm.unpin_page(p3, false);
        assert_eq!(bpm.resident_pages(), vec![p2, p3]);
        Ok(())
    }
}
