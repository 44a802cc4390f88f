use std::sync::Arc;

use crate::pages::{Page, PageId, INVALID_PAGE_ID};

/// One buffer pool slot: the cached page plus its bookkeeping. The dirty
/// flag is sticky until the page is written back; a frame with a nonzero
/// pin count is never handed to the replacer.
pub(super) struct Frame {
    pub page: Arc<Page>,
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            page: Arc::new(Page::new()),
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    /// Rebind the frame to a new page identity after eviction.
    pub fn reset(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.pin_count = 1;
        self.is_dirty = false;
    }
}
