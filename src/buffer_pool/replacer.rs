use core::fmt::Debug;

use priority_queue::PriorityQueue;

use super::FrameId;

/// Victim selection over unpinned frames. Driven entirely under the buffer
/// pool latch, so implementations need no locking of their own.
pub(super) trait Replacer: Send + Debug {
    /// Frame dropped to pin count zero; candidate for eviction. Idempotent.
    fn unpin(&mut self, frame_id: FrameId);
    /// Frame was pinned (or deleted); no-op if the replacer doesn't own it.
    fn pin(&mut self, frame_id: FrameId);
    /// Pick and remove the victim, least recently unpinned first.
    fn evict(&mut self) -> Option<FrameId>;
    /// Number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU over a priority queue keyed on a monotonic unpin stamp: the entry
/// with the oldest stamp wins eviction.
#[derive(Debug)]
pub(super) struct LruReplacer {
    timestamp: i64,
    heap: PriorityQueue<FrameId, i64>,
}

impl LruReplacer {
    pub fn new(size: usize) -> Self {
        Self {
            timestamp: 0,
            heap: PriorityQueue::with_capacity(size),
        }
    }
}

impl Replacer for LruReplacer {
    fn unpin(&mut self, frame_id: FrameId) {
        // only the first unpin counts; a later one must not refresh recency
        if self.heap.get(&frame_id).is_none() {
            self.timestamp += 1;
            self.heap.push(frame_id, -self.timestamp);
        }
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.heap.remove(&frame_id);
    }

    fn evict(&mut self) -> Option<FrameId> {
        self.heap.pop().map(|(frame_id, _)| frame_id)
    }

    fn size(&self) -> usize {
        self.heap.len()
    }
}
