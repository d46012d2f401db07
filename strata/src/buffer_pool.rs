//! Manages the buffer pool, a fixed set of in-memory frames that cache disk
//! pages.
//!
//! Ownership of a frame is conferred by a successful fetch/new and revoked
//! when the returned [`PageGuard`] drops. A frame with outstanding guards is
//! pinned and never chosen for eviction.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk::{DiskManager, MAX_VALID_PAGE_ID};
use crate::replacer::LruReplacer;
use crate::{FrameId, Page, PageId, INVALID_PAGE_ID};

const BUFFER_POOL_SIZE: usize = 256;

/// A single frame in the buffer pool.
struct Frame {
    page: RwLock<Page>,
    pin_count: Mutex<u32>,
    is_dirty: Mutex<bool>,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    disk: Mutex<DiskManager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, FrameId>>,
    free_list: Mutex<Vec<FrameId>>,
    replacer: Mutex<LruReplacer>,
}

/// An RAII guard for a pinned page.
///
/// `read`/`write` expose the page bytes; acquiring a write view marks the
/// frame dirty, and the dirty bit is sticky until the page is written back.
/// Dropping the guard unpins the frame.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
    frame: Arc<Frame>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock() = true;
        self.frame.page.write()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_id);
    }
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager) -> Self {
        Self::with_capacity(disk, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(disk: DiskManager, pool_size: usize) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for i in (0..pool_size).rev() {
            free_list.push(i);
        }
        for _ in 0..pool_size {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(INVALID_PAGE_ID)),
                pin_count: Mutex::new(0),
                is_dirty: Mutex::new(false),
            }));
        }
        BufferPoolManager {
            disk: Mutex::new(disk),
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: Mutex::new(LruReplacer::new(pool_size)),
        }
    }

    /// Pins the requested page, reading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> io::Result<PageGuard<'_>> {
        if page_id == INVALID_PAGE_ID || page_id > MAX_VALID_PAGE_ID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fetch of invalid page id {page_id}"),
            ));
        }

        if let Some(&frame_id) = self.page_table.read().get(&page_id) {
            let frame = Arc::clone(&self.frames[frame_id]);
            self.pin_frame(frame_id, &frame);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame_id,
                frame,
            });
        }

        let frame_id = self.take_victim_frame()?;
        let frame = Arc::clone(&self.frames[frame_id]);
        if let Err(err) = self.write_back_if_dirty(&frame) {
            self.release_frame(frame_id, &frame);
            return Err(err);
        }

        {
            let mut page = frame.page.write();
            page.id = page_id;
            if let Err(err) = self.disk.lock().read_page(page_id, &mut page.data) {
                drop(page);
                self.release_frame(frame_id, &frame);
                return Err(err);
            }
        }
        *frame.is_dirty.lock() = false;
        *frame.pin_count.lock() = 1;
        self.page_table.write().insert(page_id, frame_id);

        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_id,
            frame,
        })
    }

    /// Allocates a fresh logical page and pins it in a zeroed frame.
    pub fn new_page(&self) -> io::Result<PageGuard<'_>> {
        let frame_id = self.take_victim_frame()?;
        let frame = Arc::clone(&self.frames[frame_id]);
        if let Err(err) = self.write_back_if_dirty(&frame) {
            self.release_frame(frame_id, &frame);
            return Err(err);
        }

        let page_id = match self.disk.lock().allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                self.release_frame(frame_id, &frame);
                return Err(err);
            }
        };
        {
            let mut page = frame.page.write();
            page.reset();
            page.id = page_id;
        }
        *frame.is_dirty.lock() = false;
        *frame.pin_count.lock() = 1;
        self.page_table.write().insert(page_id, frame_id);

        crate::strata_debug_log!("[BufferPoolManager::new_page] Allocated page {page_id}");
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame_id,
            frame,
        })
    }

    /// Writes the resident page back to disk and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> io::Result<bool> {
        let frame = match self.page_table.read().get(&page_id) {
            Some(&frame_id) => Arc::clone(&self.frames[frame_id]),
            None => return Ok(false),
        };
        let page = frame.page.read();
        self.disk.lock().write_page(page_id, &page.data)?;
        drop(page);
        *frame.is_dirty.lock() = false;
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all(&self) -> io::Result<()> {
        let resident: Vec<PageId> = self.page_table.read().keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops the page from the pool and frees it on disk.
    ///
    /// Returns `Ok(false)` while the page is pinned; `Ok(true)` once the
    /// frame is recycled and the disk page deallocated.
    pub fn delete_page(&self, page_id: PageId) -> io::Result<bool> {
        let frame_id = match self.page_table.read().get(&page_id) {
            Some(&frame_id) => frame_id,
            None => {
                // Not resident: only the on-disk allocation needs undoing.
                self.disk.lock().deallocate_page(page_id)?;
                return Ok(true);
            }
        };
        let frame = Arc::clone(&self.frames[frame_id]);
        if *frame.pin_count.lock() > 0 {
            return Ok(false);
        }

        self.page_table.write().remove(&page_id);
        self.replacer.lock().pin(frame_id);
        frame.page.write().reset();
        *frame.is_dirty.lock() = false;
        self.free_list.lock().push(frame_id);
        self.disk.lock().deallocate_page(page_id)?;
        crate::strata_debug_log!("[BufferPoolManager::delete_page] Deleted page {page_id}");
        Ok(true)
    }

    /// Reports the allocation status of a page through the disk manager.
    pub fn is_page_free(&self, page_id: PageId) -> io::Result<bool> {
        self.disk.lock().is_page_free(page_id)
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently available in the free list.
    pub fn free_frames(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Frames currently waiting in the replacer.
    pub fn replacer_frames(&self) -> usize {
        self.replacer.lock().len()
    }

    /// Frames with at least one outstanding pin.
    pub fn pinned_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| *frame.pin_count.lock() > 0)
            .count()
    }

    fn pin_frame(&self, frame_id: FrameId, frame: &Arc<Frame>) {
        let mut pin_count = frame.pin_count.lock();
        *pin_count += 1;
        self.replacer.lock().pin(frame_id);
    }

    fn unpin_frame(&self, frame_id: FrameId) {
        let frame = &self.frames[frame_id];
        let mut pin_count = frame.pin_count.lock();
        if *pin_count > 0 {
            *pin_count -= 1;
        }
        if *pin_count == 0 {
            self.replacer.lock().unpin(frame_id);
        }
    }

    /// Returns a victimized frame to the free list after a failed reuse so
    /// no frame escapes the free-list/replacer/pinned accounting.
    fn release_frame(&self, frame_id: FrameId, frame: &Arc<Frame>) {
        frame.page.write().reset();
        *frame.is_dirty.lock() = false;
        self.free_list.lock().push(frame_id);
    }

    /// Picks a reusable frame: the free list first, then the LRU victim.
    fn take_victim_frame(&self) -> io::Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }
        self.replacer
            .lock()
            .victim()
            .ok_or_else(|| io::Error::other("all frames are pinned"))
    }

    /// Detaches the frame's old page, writing it back first when dirty.
    fn write_back_if_dirty(&self, frame: &Arc<Frame>) -> io::Result<()> {
        let old_page_id = frame.page.read().id;
        if old_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut is_dirty = frame.is_dirty.lock();
        if *is_dirty {
            let page = frame.page.read();
            self.disk.lock().write_page(old_page_id, &page.data)?;
            crate::strata_debug_log!(
                "[BufferPoolManager] Wrote back dirty page {old_page_id} before reuse"
            );
        }
        *is_dirty = false;
        self.page_table.write().remove(&old_page_id);
        Ok(())
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        let _ = self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pool(dir: &tempfile::TempDir, pool_size: usize) -> BufferPoolManager {
        let disk = DiskManager::open(dir.path().join("test.db")).unwrap();
        BufferPoolManager::with_capacity(disk, pool_size)
    }

    #[test]
    fn new_page_hands_out_sequential_ids() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 8);
        let first = pool.new_page().unwrap();
        let second = pool.new_page().unwrap();
        assert_eq!(first.page_id(), 0);
        assert_eq!(second.page_id(), 1);
        assert!(!pool.is_page_free(0).unwrap());
    }

    #[test]
    fn frame_accounting_is_conserved() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 4);

        let total = |p: &BufferPoolManager| p.pinned_frames() + p.free_frames() + p.replacer_frames();
        assert_eq!(total(&pool), 4);

        let g0 = pool.new_page().unwrap();
        let g1 = pool.new_page().unwrap();
        assert_eq!(pool.pinned_frames(), 2);
        assert_eq!(total(&pool), 4);

        drop(g0);
        assert_eq!(pool.replacer_frames(), 1);
        assert_eq!(total(&pool), 4);
        drop(g1);
        assert_eq!(total(&pool), 4);
    }

    #[test]
    fn eviction_honors_lru_order_and_dirty_writeback() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 2);
        // Materialize pages 0, 1 and 2 on disk first.
        for _ in 0..3 {
            pool.new_page().unwrap();
        }

        {
            let guard = pool.fetch_page(0).unwrap();
            guard.write().data[0..4].copy_from_slice(&0xabad_cafeu32.to_le_bytes());
        }
        {
            let _guard = pool.fetch_page(1).unwrap();
        }

        // Pool holds {0, 1}; 0 is least recently unpinned. Fetching 2 must
        // evict 0 and write its bytes back.
        let g2 = pool.fetch_page(2).unwrap();
        assert_eq!(g2.page_id(), 2);
        drop(g2);

        let g0 = pool.fetch_page(0).unwrap();
        assert_eq!(
            u32::from_le_bytes(g0.read().data[0..4].try_into().unwrap()),
            0xabad_cafe
        );
    }

    #[test]
    fn fetch_fails_when_all_frames_are_pinned() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 2);
        for _ in 0..3 {
            pool.new_page().unwrap();
        }
        let _g0 = pool.fetch_page(0).unwrap();
        let _g1 = pool.fetch_page(1).unwrap();
        assert!(pool.fetch_page(2).is_err());
    }

    #[test]
    fn read_only_unpin_does_not_clear_dirty() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 2);
        pool.new_page().unwrap();
        pool.new_page().unwrap();
        pool.new_page().unwrap();

        {
            let guard = pool.fetch_page(0).unwrap();
            guard.write().data[10] = 0x5a;
        }
        {
            // A second, read-only use of the same resident page.
            let guard = pool.fetch_page(0).unwrap();
            assert_eq!(guard.read().data[10], 0x5a);
        }
        // Force eviction; the earlier write must still reach disk.
        let _g1 = pool.fetch_page(1).unwrap();
        let _g2 = pool.fetch_page(2).unwrap();
        drop(_g1);
        drop(_g2);
        let guard = pool.fetch_page(0).unwrap();
        assert_eq!(guard.read().data[10], 0x5a);
    }

    #[test]
    fn delete_page_refuses_while_pinned() {
        let dir = tempdir().unwrap();
        let pool = make_pool(&dir, 4);
        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();
        assert!(!pool.delete_page(page_id).unwrap());
        drop(guard);
        assert!(pool.delete_page(page_id).unwrap());
        assert!(pool.is_page_free(page_id).unwrap());
        assert_eq!(pool.free_frames(), 4);
    }

    #[test]
    fn flush_page_persists_without_eviction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let disk = DiskManager::open(&path).unwrap();
            let pool = BufferPoolManager::with_capacity(disk, 4);
            let guard = pool.new_page().unwrap();
            guard.write().data[0] = 0x77;
            drop(guard);
            assert!(pool.flush_page(0).unwrap());
        }
        let disk = DiskManager::open(&path).unwrap();
        let pool = BufferPoolManager::with_capacity(disk, 4);
        let guard = pool.fetch_page(0).unwrap();
        assert_eq!(guard.read().data[0], 0x77);
    }
}
