use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Result};
use log::debug;
use parking_lot::Mutex;

use crate::errors::Error;
use crate::pages::bitmap_page::{BitmapPage, BITMAP_SIZE};
use crate::pages::disk_meta_page::{DiskMetaPage, MAX_VALID_EXTENT_ID};
use crate::pages::{PageBuf, PageId, PAGE_SIZE};

const META_PAGE_ID: PageId = 0;

/// Maps logical pages onto a single database file laid out as
/// `[meta page][bitmap page][BITMAP_SIZE data pages][bitmap page]...`.
/// Allocation walks extent bitmaps; the meta page carries the counters.
pub struct DiskManager {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    /// Cached copy of physical page 0, written back on every counter
    /// change and on close.
    meta: PageBuf,
    /// First extent that might still have a free slot. Optimistic cursor,
    /// the bitmaps are authoritative.
    next_free_extent: u32,
}

impl DiskManager {
    pub fn new(db_file: impl AsRef<Path>) -> Result<Self> {
        let db_file = db_file.as_ref();
        if let Some(parent) = db_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_file)?;

        let mut inner = Inner {
            file,
            meta: PageBuf::default(),
            next_free_extent: 0,
        };
        let mut meta = PageBuf::default();
        inner.read_physical(META_PAGE_ID as u64, &mut meta)?;
        inner.meta = meta;

        let meta_view = DiskMetaPage::new(&inner.meta);
        for extent in 0..meta_view.num_extents() {
            if meta_view.extent_used_page(extent) < BITMAP_SIZE {
                break;
            }
            inner.next_free_extent = extent + 1;
        }

        Ok(DiskManager {
            inner: Mutex::new(inner),
        })
    }

    /// Allocate the first free data page, updating the extent bitmap and the
    /// meta counters. Fails with [`Error::NoFreeExtent`] once every extent is
    /// full.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let extent = inner.next_free_extent;
        if extent >= MAX_VALID_EXTENT_ID {
            bail!(Error::NoFreeExtent);
        }

        let mut bitmap_buf = PageBuf::default();
        inner.read_physical(Self::bitmap_physical_id(extent), &mut bitmap_buf)?;
        let offset = BitmapPage::new(&mut bitmap_buf)
            .allocate_page()
            .ok_or(Error::NoFreeExtent)?;
        inner.write_physical(Self::bitmap_physical_id(extent), &bitmap_buf)?;

        {
            let mut meta = DiskMetaPage::new(&mut inner.meta);
            meta.set_num_allocated_pages(meta.num_allocated_pages() + 1);
            if meta.num_extents() <= extent {
                meta.set_num_extents(extent + 1);
            }
            meta.set_extent_used_page(extent, meta.extent_used_page(extent) + 1);
        }

        // advance the cursor past full extents
        while inner.next_free_extent < MAX_VALID_EXTENT_ID
            && DiskMetaPage::new(&inner.meta).extent_used_page(inner.next_free_extent)
                == BITMAP_SIZE
        {
            inner.next_free_extent += 1;
        }

        let meta = inner.meta.as_bytes().to_vec();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&meta)?;

        let page_id = (extent * BITMAP_SIZE + offset) as PageId;
        debug!("allocated page {page_id} in extent {extent}");
        Ok(page_id)
    }

    /// Clear the page's bit. Freeing an already-free page is a no-op.
    pub fn deallocate_page(&self, logical_page_id: PageId) -> Result<()> {
        let extent = Self::extent_of(logical_page_id)?;
        let mut inner = self.inner.lock();

        let mut bitmap_buf = PageBuf::default();
        inner.read_physical(Self::bitmap_physical_id(extent), &mut bitmap_buf)?;
        let offset = logical_page_id as u32 % BITMAP_SIZE;
        if !BitmapPage::new(&mut bitmap_buf).deallocate_page(offset) {
            return Ok(());
        }
        inner.write_physical(Self::bitmap_physical_id(extent), &bitmap_buf)?;

        {
            let mut meta = DiskMetaPage::new(&mut inner.meta);
            meta.set_num_allocated_pages(meta.num_allocated_pages() - 1);
            meta.set_extent_used_page(extent, meta.extent_used_page(extent) - 1);
        }
        if extent < inner.next_free_extent {
            inner.next_free_extent = extent;
        }
        let meta = inner.meta.as_bytes().to_vec();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&meta)?;

        debug!("deallocated page {logical_page_id}");
        Ok(())
    }

    /// True for every page of an extent that was never materialized,
    /// otherwise whatever the bitmap says.
    pub fn is_page_free(&self, logical_page_id: PageId) -> Result<bool> {
        let extent = Self::extent_of(logical_page_id)?;
        let mut inner = self.inner.lock();
        if extent >= DiskMetaPage::new(&inner.meta).num_extents() {
            return Ok(true);
        }
        let mut bitmap_buf = PageBuf::default();
        inner.read_physical(Self::bitmap_physical_id(extent), &mut bitmap_buf)?;
        Ok(BitmapPage::new(&bitmap_buf).is_page_free(logical_page_id as u32 % BITMAP_SIZE))
    }

    pub fn read_page(&self, logical_page_id: PageId, buf: &mut PageBuf) -> Result<()> {
        if logical_page_id < 0 {
            bail!(Error::InvalidPageId(logical_page_id));
        }
        self.inner
            .lock()
            .read_physical(Self::map_page_id(logical_page_id), buf)
    }

    pub fn write_page(&self, logical_page_id: PageId, buf: &PageBuf) -> Result<()> {
        if logical_page_id < 0 {
            bail!(Error::InvalidPageId(logical_page_id));
        }
        self.inner
            .lock()
            .write_physical(Self::map_page_id(logical_page_id), buf)
    }

    pub fn num_allocated_pages(&self) -> u32 {
        DiskMetaPage::new(&self.inner.lock().meta).num_allocated_pages()
    }

    /// Write the cached meta page back and flush the file.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let meta = inner.meta.as_bytes().to_vec();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&meta)?;
        inner.file.sync_all()?;
        Ok(())
    }

    fn extent_of(logical_page_id: PageId) -> Result<u32> {
        if logical_page_id < 0 {
            bail!(Error::InvalidPageId(logical_page_id));
        }
        let extent = logical_page_id as u32 / BITMAP_SIZE;
        if extent >= MAX_VALID_EXTENT_ID {
            bail!(Error::InvalidPageId(logical_page_id));
        }
        Ok(extent)
    }

    fn bitmap_physical_id(extent: u32) -> u64 {
        (extent * (BITMAP_SIZE + 1) + 1) as u64
    }

    fn map_page_id(logical_page_id: PageId) -> u64 {
        (logical_page_id as u32 / BITMAP_SIZE + logical_page_id as u32 + 2) as u64
    }
}

impl Inner {
    /// Reads past the end of the file zero-fill: pages exist logically as
    /// soon as they are allocated, the file grows on first write.
    fn read_physical(&mut self, physical_page_id: u64, buf: &mut PageBuf) -> Result<()> {
        let offset = physical_page_id * PAGE_SIZE as u64;
        if offset >= self.file.metadata()?.len() {
            buf.reset();
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = [0u8; PAGE_SIZE];
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut bytes[read..])?;
            if n == 0 {
                break; // file ends mid-page, keep the zero fill
            }
            read += n;
        }
        buf.copy_from(&bytes);
        Ok(())
    }

    fn write_physical(&mut self, physical_page_id: u64, buf: &PageBuf) -> Result<()> {
        let offset = physical_page_id * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tempfile::TempDir;

    pub fn test_disk_manager() -> (TempDir, DiskManager) {
        crate::init_test_logger();
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path().join("test.db")).unwrap();
        (dir, disk)
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let (_dir, disk) = test_disk_manager();

        let page_id = disk.allocate_page()?;
        let mut buf = PageBuf::default();
        buf.write_bytes(0, b"hello page");
        buf.write_u32(PAGE_SIZE - 4, 42);
        disk.write_page(page_id, &buf)?;

        let mut read_buf = PageBuf::default();
        disk.read_page(page_id, &mut read_buf)?;
        assert_eq!(read_buf.read_bytes(0, 10), b"hello page");
        assert_eq!(read_buf.read_u32(PAGE_SIZE - 4), 42);
        Ok(())
    }

    #[test]
    fn test_read_unwritten_page_zero_fills() -> Result<()> {
        let (_dir, disk) = test_disk_manager();

        let page_id = disk.allocate_page()?;
        let mut buf = PageBuf::default();
        buf.write_u32(0, 7);
        disk.read_page(page_id, &mut buf)?;
        assert_eq!(buf.read_u32(0), 0);
        Ok(())
    }

    #[test]
    fn test_allocation_counters() -> Result<()> {
        let (_dir, disk) = test_disk_manager();

        let pages: Vec<PageId> = (0..64).map(|_| disk.allocate_page().unwrap()).collect();
        assert_eq!(pages, (0..64).collect::<Vec<PageId>>());
        assert_eq!(disk.num_allocated_pages(), 64);

        for id in &pages {
            assert!(!disk.is_page_free(*id)?);
        }

        disk.deallocate_page(7)?;
        assert!(disk.is_page_free(7)?);
        assert_eq!(disk.num_allocated_pages(), 63);

        // double free changes nothing
        disk.deallocate_page(7)?;
        assert_eq!(disk.num_allocated_pages(), 63);

        // the freed slot is the next one handed out
        assert_eq!(disk.allocate_page()?, 7);
        Ok(())
    }

    #[test]
    fn test_untouched_extent_is_free() -> Result<()> {
        let (_dir, disk) = test_disk_manager();
        assert!(disk.is_page_free((BITMAP_SIZE * 3) as PageId)?);
        Ok(())
    }

    #[test]
    fn test_meta_survives_reopen() -> Result<()> {
        crate::init_test_logger();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let disk = DiskManager::new(&path)?;
        for _ in 0..10 {
            disk.allocate_page()?;
        }
        disk.deallocate_page(3)?;
        disk.close()?;
        drop(disk);

        let disk = DiskManager::new(&path)?;
        assert_eq!(disk.num_allocated_pages(), 9);
        assert!(disk.is_page_free(3)?);
        assert!(!disk.is_page_free(4)?);
        assert_eq!(disk.allocate_page()?, 3);
        Ok(())
    }

    #[test]
    fn test_invalid_page_id() {
        let (_dir, disk) = test_disk_manager();
        let mut buf = PageBuf::default();
        let err = disk.read_page(-1, &mut buf).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::InvalidPageId(-1));
    }
}
