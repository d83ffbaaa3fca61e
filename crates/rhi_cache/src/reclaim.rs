//! Deferred reclamation of GPU-visible resources
//!
//! Items released during frame `t` land in slot `t % N` and are handed back
//! for destruction only when that slot is reused at frame `t + N`. By then the
//! frame that may have referenced them has retired.

use crate::frame_ring::{FrameRing, MAX_FRAMES_IN_FLIGHT};

/// Per-slot lists of resources waiting for their slot to come around again
#[derive(Debug)]
pub struct DeferredReclaimQueue<T, const N: usize = MAX_FRAMES_IN_FLIGHT> {
    ring: FrameRing<Vec<T>, N>,
}

impl<T, const N: usize> DeferredReclaimQueue<T, N> {
    /// Create an empty queue positioned at frame 0
    pub fn new() -> Self {
        Self {
            ring: FrameRing::new(|_| Vec::new()),
        }
    }

    /// Queue an item for destruction once the current slot is reused
    pub fn enqueue(&mut self, item: T) {
        self.ring.current_mut().push(item);
    }

    /// Rotate to `frame_index` and return everything queued in that slot
    ///
    /// The caller destroys the returned items. Must be called once per frame
    /// with increasing indices.
    #[must_use = "drained items must be destroyed by the caller"]
    pub fn next_frame(&mut self, frame_index: u64) -> Vec<T> {
        self.ring.set_frame(frame_index);
        std::mem::take(self.ring.current_mut())
    }

    /// Number of items queued across all slots
    pub fn pending(&self) -> usize {
        self.ring.iter().map(Vec::len).sum()
    }

    /// Number of items queued in one slot
    pub fn pending_in_slot(&self, slot: usize) -> usize {
        self.ring.get(slot).len()
    }

    /// Take every queued item regardless of slot, for shutdown
    pub fn drain_all(&mut self) -> Vec<T> {
        self.ring.iter_mut().flat_map(std::mem::take).collect()
    }

    /// Frame the queue was last rotated to
    pub const fn frame(&self) -> u64 {
        self.ring.frame()
    }
}

impl<T, const N: usize> Default for DeferredReclaimQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
