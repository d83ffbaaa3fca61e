//! Frames-in-flight ring
//!
//! Every per-frame container in the crate is a [`FrameRing`]: exactly
//! [`MAX_FRAMES_IN_FLIGHT`] slots indexed by `frame % N`. A slot is only
//! touched again once `N` frames have elapsed, which is what lets pools and
//! reclaim queues reset or destroy its contents without waiting on the GPU.

/// Number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Fixed ring of per-frame state
#[derive(Debug)]
pub struct FrameRing<T, const N: usize = MAX_FRAMES_IN_FLIGHT> {
    slots: [T; N],
    frame: u64,
}

impl<T, const N: usize> FrameRing<T, N> {
    /// Create a ring at frame 0, building each slot from its index
    pub fn new(init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: std::array::from_fn(init),
            frame: 0,
        }
    }

    /// Slot index a frame number maps to
    pub const fn slot_of(frame: u64) -> usize {
        (frame % N as u64) as usize
    }

    /// Advance to the next frame and return its number
    pub fn advance(&mut self) -> u64 {
        self.frame += 1;
        log::trace!("Frame ring advanced to frame {} (slot {})", self.frame, self.slot());
        self.frame
    }

    /// Jump to an externally supplied frame number
    pub fn set_frame(&mut self, frame: u64) {
        debug_assert!(
            frame >= self.frame,
            "frame index went backwards: {} -> {}",
            self.frame,
            frame
        );
        self.frame = frame;
    }

    /// Current frame number
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Current slot index
    pub const fn slot(&self) -> usize {
        Self::slot_of(self.frame)
    }

    /// State of the current slot
    pub fn current(&self) -> &T {
        &self.slots[self.slot()]
    }

    /// Mutable state of the current slot
    pub fn current_mut(&mut self) -> &mut T {
        let slot = self.slot();
        &mut self.slots[slot]
    }

    /// State of a specific slot
    pub fn get(&self, slot: usize) -> &T {
        &self.slots[slot]
    }

    /// Mutable state of a specific slot
    pub fn get_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot]
    }

    /// Iterate over all slots in index order
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Mutably iterate over all slots in index order
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.slots.iter_mut()
    }

    /// Number of slots
    pub const fn len(&self) -> usize {
        N
    }

    /// Always false; a ring has at least one slot
    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<T: Default, const N: usize> Default for FrameRing<T, N> {
    fn default() -> Self {
        Self::new(|_| T::default())
    }
}
