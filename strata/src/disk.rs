//! The disk manager owns the database file and multiplexes fixed-size pages
//! inside it.
//!
//! Physical layout: physical page 0 is the disk meta page (the extent
//! directory). After it, the file is partitioned into extents of one bitmap
//! page followed by `BITMAP_CAPACITY` data pages. Callers address pages by
//! their logical id, which counts data pages only; meta and bitmap pages are
//! invisible above this module.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bitmap::{BitmapPage, BITMAP_CAPACITY};
use crate::{PageId, PAGE_SIZE};

const META_HEADER_SIZE: usize = 8;

/// Extents the meta page's directory can describe before the file is full.
pub const MAX_EXTENTS: usize = (PAGE_SIZE - META_HEADER_SIZE) / 4;

/// Largest logical page id this layout can ever hand out.
pub const MAX_VALID_PAGE_ID: PageId = MAX_EXTENTS as u32 * BITMAP_CAPACITY - 1;

/// In-memory copy of physical page 0:
/// `allocated_pages: u32 | num_extents: u32 | used_count: u32 per extent`.
#[derive(Debug, Default)]
struct DiskMeta {
    allocated_pages: u32,
    extent_used: Vec<u32>,
}

impl DiskMeta {
    fn from_bytes(data: &[u8; PAGE_SIZE]) -> Self {
        let allocated_pages = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let num_extents = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        let mut extent_used = Vec::with_capacity(num_extents);
        for i in 0..num_extents {
            let at = META_HEADER_SIZE + i * 4;
            extent_used.push(u32::from_le_bytes(data[at..at + 4].try_into().unwrap()));
        }
        DiskMeta {
            allocated_pages,
            extent_used,
        }
    }

    fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut data = [0u8; PAGE_SIZE];
        data[0..4].copy_from_slice(&self.allocated_pages.to_le_bytes());
        data[4..8].copy_from_slice(&(self.extent_used.len() as u32).to_le_bytes());
        for (i, used) in self.extent_used.iter().enumerate() {
            let at = META_HEADER_SIZE + i * 4;
            data[at..at + 4].copy_from_slice(&used.to_le_bytes());
        }
        data
    }
}

/// Maps logical page ids to file offsets and tracks free space through the
/// per-extent bitmap pages.
pub struct DiskManager {
    file: File,
    meta: DiskMeta,
}

impl DiskManager {
    /// Opens (or creates) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_ref = path.as_ref();
        crate::strata_debug_log!("[DiskManager::open] Opening database file at: {path_ref:?}");
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let file_size = file.metadata()?.len();
        let mut manager = DiskManager {
            file,
            meta: DiskMeta::default(),
        };
        if file_size >= PAGE_SIZE as u64 {
            let mut raw = [0u8; PAGE_SIZE];
            manager.read_physical(0, &mut raw)?;
            manager.meta = DiskMeta::from_bytes(&raw);
        } else {
            manager.flush_meta()?;
        }
        Ok(manager)
    }

    /// Physical index of logical data page `logical`.
    ///
    /// Extent `i = logical / BITMAP_CAPACITY` occupies physical pages
    /// `1 + i * (BITMAP_CAPACITY + 1)` (its bitmap) through the following
    /// `BITMAP_CAPACITY` data pages, so
    /// `physical = 2 + i * (BITMAP_CAPACITY + 1) + logical % BITMAP_CAPACITY`.
    fn physical_index(logical: PageId) -> u64 {
        let extent = (logical / BITMAP_CAPACITY) as u64;
        2 + extent * (BITMAP_CAPACITY as u64 + 1) + (logical % BITMAP_CAPACITY) as u64
    }

    /// Physical index of the bitmap page governing `logical`.
    fn bitmap_index(logical: PageId) -> u64 {
        let extent = (logical / BITMAP_CAPACITY) as u64;
        1 + extent * (BITMAP_CAPACITY as u64 + 1)
    }

    /// Copies exactly one page from the file into `buf`.
    pub fn read_page(&mut self, logical: PageId, buf: &mut [u8; PAGE_SIZE]) -> io::Result<()> {
        self.read_physical(Self::physical_index(logical), buf)
    }

    /// Copies exactly one page from `buf` into the file.
    pub fn write_page(&mut self, logical: PageId, buf: &[u8; PAGE_SIZE]) -> io::Result<()> {
        self.write_physical(Self::physical_index(logical), buf)
    }

    /// Returns the lowest free logical page id, marking it allocated.
    pub fn allocate_page(&mut self) -> io::Result<PageId> {
        let extent = match self
            .meta
            .extent_used
            .iter()
            .position(|&used| used < BITMAP_CAPACITY)
        {
            Some(extent) => extent,
            None => {
                if self.meta.extent_used.len() >= MAX_EXTENTS {
                    return Err(io::Error::other("disk is full: extent directory exhausted"));
                }
                self.meta.extent_used.push(0);
                let fresh = BitmapPage::new();
                let extent = self.meta.extent_used.len() - 1;
                self.write_physical(
                    Self::bitmap_index(extent as u32 * BITMAP_CAPACITY),
                    fresh.as_bytes(),
                )?;
                extent
            }
        };

        let mut bitmap = self.read_bitmap(extent)?;
        let offset = bitmap
            .allocate()
            .ok_or_else(|| io::Error::other("bitmap full despite free meta count"))?;
        self.write_bitmap(extent, &bitmap)?;

        self.meta.extent_used[extent] += 1;
        self.meta.allocated_pages += 1;
        self.flush_meta()?;

        let logical = extent as u32 * BITMAP_CAPACITY + offset;
        crate::strata_debug_log!("[DiskManager::allocate_page] Allocated logical page {logical}");
        Ok(logical)
    }

    /// Marks the given logical page free. Freeing an unallocated page is a
    /// no-op.
    pub fn deallocate_page(&mut self, logical: PageId) -> io::Result<()> {
        let extent = (logical / BITMAP_CAPACITY) as usize;
        if extent >= self.meta.extent_used.len() {
            return Ok(());
        }
        let mut bitmap = self.read_bitmap(extent)?;
        if !bitmap.deallocate(logical % BITMAP_CAPACITY) {
            crate::strata_debug_log!(
                "[DiskManager::deallocate_page] Page {logical} was already free"
            );
            return Ok(());
        }
        self.write_bitmap(extent, &bitmap)?;
        self.meta.extent_used[extent] -= 1;
        self.meta.allocated_pages -= 1;
        self.flush_meta()
    }

    /// Reports the allocation status of a logical page.
    pub fn is_page_free(&mut self, logical: PageId) -> io::Result<bool> {
        let extent = (logical / BITMAP_CAPACITY) as usize;
        if extent >= self.meta.extent_used.len() {
            return Ok(true);
        }
        let bitmap = self.read_bitmap(extent)?;
        Ok(bitmap.is_free(logical % BITMAP_CAPACITY))
    }

    /// Total data pages currently allocated.
    pub fn allocated_pages(&self) -> u32 {
        self.meta.allocated_pages
    }

    fn read_bitmap(&mut self, extent: usize) -> io::Result<BitmapPage> {
        let mut raw = [0u8; PAGE_SIZE];
        self.read_physical(Self::bitmap_index(extent as u32 * BITMAP_CAPACITY), &mut raw)?;
        Ok(BitmapPage::from_bytes(raw))
    }

    fn write_bitmap(&mut self, extent: usize, bitmap: &BitmapPage) -> io::Result<()> {
        self.write_physical(
            Self::bitmap_index(extent as u32 * BITMAP_CAPACITY),
            bitmap.as_bytes(),
        )
    }

    fn flush_meta(&mut self) -> io::Result<()> {
        let raw = self.meta.to_bytes();
        self.write_physical(0, &raw)
    }

    fn read_physical(&mut self, physical: u64, buf: &mut [u8; PAGE_SIZE]) -> io::Result<()> {
        let offset = physical * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        // Pages past the end of file read back as zeroes.
        buf[read..].fill(0);
        Ok(())
    }

    fn write_physical(&mut self, physical: u64, buf: &[u8; PAGE_SIZE]) -> io::Result<()> {
        let offset = physical * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_manager(dir: &tempfile::TempDir) -> DiskManager {
        DiskManager::open(dir.path().join("test.db")).unwrap()
    }

    #[test]
    fn logical_to_physical_mapping() {
        let k = BITMAP_CAPACITY as u64;
        // Extent 0: meta at 0, bitmap at 1, data pages from 2.
        assert_eq!(DiskManager::physical_index(0), 2);
        assert_eq!(DiskManager::physical_index(1), 3);
        assert_eq!(DiskManager::physical_index(BITMAP_CAPACITY - 1), 1 + k);
        // Extent 1 begins with its own bitmap page.
        assert_eq!(DiskManager::bitmap_index(BITMAP_CAPACITY), 2 + k);
        assert_eq!(DiskManager::physical_index(BITMAP_CAPACITY), 3 + k);
        assert_eq!(
            DiskManager::physical_index(3 * BITMAP_CAPACITY + 5),
            2 + 3 * (k + 1) + 5
        );
    }

    #[test]
    fn allocate_marks_pages_in_use() {
        let dir = tempdir().unwrap();
        let mut disk = open_manager(&dir);

        let first = disk.allocate_page().unwrap();
        assert_eq!(first, 0);
        assert!(!disk.is_page_free(first).unwrap());
        assert!(disk.is_page_free(1).unwrap());

        let second = disk.allocate_page().unwrap();
        assert_eq!(second, 1);
        disk.deallocate_page(first).unwrap();
        assert!(disk.is_page_free(first).unwrap());
        // The freed slot is reused before any new page.
        assert_eq!(disk.allocate_page().unwrap(), first);
    }

    #[test]
    fn page_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let page_id;
        {
            let mut disk = DiskManager::open(&path).unwrap();
            page_id = disk.allocate_page().unwrap();
            let mut buf = [0u8; PAGE_SIZE];
            buf[0..4].copy_from_slice(&0xfeed_beefu32.to_le_bytes());
            disk.write_page(page_id, &buf).unwrap();
        }
        let mut disk = DiskManager::open(&path).unwrap();
        assert_eq!(disk.allocated_pages(), 1);
        assert!(!disk.is_page_free(page_id).unwrap());
        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(page_id, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 0xfeed_beef);
    }

    #[test]
    fn unallocated_pages_read_as_zeroes() {
        let dir = tempdir().unwrap();
        let mut disk = open_manager(&dir);
        let mut buf = [0xaau8; PAGE_SIZE];
        disk.read_page(17, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn deallocating_a_free_page_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut disk = open_manager(&dir);
        disk.deallocate_page(42).unwrap();
        assert_eq!(disk.allocated_pages(), 0);
    }
}
