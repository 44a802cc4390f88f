mod frame;
mod replacer;

use std::cell::Cell;
use std::collections::{HashMap, LinkedList};
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, warn};
use parking_lot::FairMutex;

use crate::disk_manager::DiskManager;
use crate::errors::Error;
use crate::pages::{Page, PageId, INVALID_LSN};
use crate::recovery::log_manager::LogManager;
use frame::Frame;
use replacer::{LruReplacer, Replacer};

pub type FrameId = usize;

/// Fixed array of frames caching pages by page id. The pool latch guards
/// the page table, free list, replacer and frame metadata; page *content*
/// is guarded by each page's own latch, which callers take through the
/// returned [`PageGuard`].
pub struct BufferPoolManager {
    core: FairMutex<BufferCore>,
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
}

struct BufferCore {
    frames: Vec<Frame>,
    free_list: LinkedList<FrameId>,
    page_table: HashMap<PageId, FrameId>,
    replacer: Box<dyn Replacer>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        disk: Arc<DiskManager>,
        log: Option<Arc<LogManager>>,
    ) -> Arc<Self> {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        Arc::new(Self {
            core: FairMutex::new(BufferCore {
                frames,
                free_list: LinkedList::from_iter(0..pool_size),
                page_table: HashMap::new(),
                replacer: Box::new(LruReplacer::new(pool_size)),
            }),
            disk,
            log,
        })
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn pool_size(&self) -> usize {
        self.core.lock().frames.len()
    }

    /// Pick a frame for a new resident: free list first, then the replacer.
    /// The victim is written back first when dirty, honoring the WAL rule
    /// that all log records up to the page's LSN are durable before the
    /// page itself.
    fn available_frame(&self, core: &mut BufferCore) -> Result<FrameId> {
        if let Some(frame_id) = core.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = core.replacer.evict() else {
            bail!(Error::OutOfMemory);
        };
        let frame = &core.frames[frame_id];
        assert_eq!(frame.pin_count, 0, "evicting a pinned frame");

        if frame.is_dirty {
            let lsn = frame.page.lsn();
            if lsn != INVALID_LSN {
                if let Some(log) = &self.log {
                    log.flush(lsn, true);
                }
            }
            debug!("evicting dirty page {} from frame {frame_id}", frame.page_id);
            self.disk.write_page(frame.page_id, frame.page.data())?;
        }
        core.page_table.remove(&frame.page_id);
        Ok(frame_id)
    }

    /// Fetch a page into the pool, pinned. The caller unpins by dropping
    /// the guard.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard> {
        let mut core = self.core.lock();

        if let Some(&frame_id) = core.page_table.get(&page_id) {
            let frame = &mut core.frames[frame_id];
            frame.pin_count += 1;
            let page = frame.page.clone();
            core.replacer.pin(frame_id);
            return Ok(PageGuard::new(self.clone(), page, page_id));
        }

        let frame_id = self.available_frame(&mut core)?;
        let frame = &mut core.frames[frame_id];
        if let Err(e) = self.disk.read_page(page_id, frame.page.data_mut(), false) {
            core.free_list.push_front(frame_id);
            return Err(e);
        }
        frame.reset(page_id);
        let page = frame.page.clone();
        core.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(self.clone(), page, page_id))
    }

    /// Allocate a fresh page id and install a zeroed page for it, pinned.
    pub fn new_page(self: &Arc<Self>) -> Result<PageGuard> {
        let mut core = self.core.lock();

        let frame_id = self.available_frame(&mut core)?;
        let page_id = self.disk.allocate_page();

        let frame = &mut core.frames[frame_id];
        frame.page.reset();
        frame.reset(page_id);
        let page = frame.page.clone();
        core.page_table.insert(page_id, frame_id);

        Ok(PageGuard::new(self.clone(), page, page_id))
    }

    /// Drop one pin; the sticky dirty flag is OR'd in. Fails on a page that
    /// is not cached or not pinned.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let mut core = self.core.lock();
        let Some(&frame_id) = core.page_table.get(&page_id) else {
            bail!(Error::Internal(format!("unpin of uncached page {page_id}")));
        };

        let frame = &mut core.frames[frame_id];
        frame.is_dirty |= is_dirty;
        if frame.pin_count == 0 {
            bail!(Error::Internal(format!("unpin of unpinned page {page_id}")));
        }
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            core.replacer.unpin(frame_id);
        }
        Ok(())
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut core = self.core.lock();
        let Some(&frame_id) = core.page_table.get(&page_id) else {
            bail!(Error::Internal(format!("flush of uncached page {page_id}")));
        };
        self.flush_frame(&mut core, frame_id)
    }

    fn flush_frame(&self, core: &mut BufferCore, frame_id: FrameId) -> Result<()> {
        let frame = &mut core.frames[frame_id];
        let lsn = frame.page.lsn();
        if lsn != INVALID_LSN {
            if let Some(log) = &self.log {
                log.flush(lsn, true);
            }
        }
        self.disk.write_page(frame.page_id, frame.page.data())?;
        frame.is_dirty = false;
        Ok(())
    }

    /// Drop an unpinned page from the pool and return its id to the disk
    /// manager.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut core = self.core.lock();
        if let Some(&frame_id) = core.page_table.get(&page_id) {
            let frame = &mut core.frames[frame_id];
            if frame.pin_count > 0 {
                bail!(Error::Internal(format!("delete of pinned page {page_id}")));
            }
            frame.page_id = crate::pages::INVALID_PAGE_ID;
            frame.is_dirty = false;
            core.page_table.remove(&page_id);
            core.replacer.pin(frame_id);
            core.free_list.push_front(frame_id);
        }
        self.disk.deallocate_page(page_id);
        Ok(())
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        let mut core = self.core.lock();
        let frame_ids: Vec<FrameId> = core.page_table.values().copied().collect();
        for frame_id in frame_ids {
            self.flush_frame(&mut core, frame_id)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let core = self.core.lock();
        core.page_table
            .get(&page_id)
            .map(|&frame_id| core.frames[frame_id].pin_count)
    }
}

/// Scoped pin. Unpins on drop, carrying the dirty flag set through
/// [`PageGuard::mark_dirty`]. Dereferences to the [`Page`] so callers can
/// latch it and form page views.
pub struct PageGuard {
    bpm: Arc<BufferPoolManager>,
    page: Arc<Page>,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl PageGuard {
    fn new(bpm: Arc<BufferPoolManager>, page: Arc<Page>, page_id: PageId) -> Self {
        Self {
            bpm,
            page,
            page_id,
            dirty: Cell::new(false),
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Err(e) = self.bpm.unpin_page(self.page_id, self.dirty.get()) {
            warn!("failed to unpin page {}: {e}", self.page_id);
        }
    }
}
