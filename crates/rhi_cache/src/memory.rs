//! Device memory façade with deferred release
//!
//! Buffers and images are created immediately but released through a
//! [`DeferredReclaimQueue`]: a deallocation made during frame `t` is only
//! destroyed when slot `t % N` is reused at frame `t + N`. Call counters are
//! compared at shutdown to surface leaks.

use crate::backend::{ImageDesc, MemoryKey, RenderDevice};
use crate::error::OrFatal;
use crate::reclaim::DeferredReclaimQueue;
use ash::vk;
use std::sync::Arc;

/// A buffer with its backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAllocation {
    /// Native buffer
    pub buffer: vk::Buffer,
    /// Backing allocation
    pub memory: MemoryKey,
    /// Size in bytes
    pub size: vk::DeviceSize,
}

/// An image with its backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageAllocation {
    /// Native image
    pub image: vk::Image,
    /// Backing allocation
    pub memory: MemoryKey,
}

#[derive(Debug)]
enum PendingRelease {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
}

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful allocations
    pub alloc_calls: u64,
    /// Deallocation requests
    pub dealloc_calls: u64,
    /// Deallocations not yet destroyed
    pub pending: usize,
}

/// Allocates buffers and images and defers their destruction
pub struct DeviceMemoryManager<D: RenderDevice> {
    device: Arc<D>,
    pending: DeferredReclaimQueue<PendingRelease>,
    alloc_calls: u64,
    dealloc_calls: u64,
}

impl<D: RenderDevice> DeviceMemoryManager<D> {
    /// Create a manager at frame 0
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            pending: DeferredReclaimQueue::new(),
            alloc_calls: 0,
            dealloc_calls: 0,
        }
    }

    /// Allocate a buffer
    pub fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> BufferAllocation {
        debug_assert!(size > 0, "zero sized buffer allocation");

        let (buffer, key) = self
            .device
            .create_buffer(size, usage, memory)
            .or_fatal(format_args!("Failed to allocate buffer of {size} bytes"));
        self.alloc_calls += 1;

        BufferAllocation { buffer, memory: key, size }
    }

    /// Allocate an image
    pub fn allocate_image(&mut self, desc: &ImageDesc, memory: vk::MemoryPropertyFlags) -> ImageAllocation {
        debug_assert!(
            desc.extent.width > 0 && desc.extent.height > 0 && desc.extent.depth > 0,
            "zero sized image allocation"
        );

        let (image, key) = self
            .device
            .create_image(desc, memory)
            .or_fatal(format_args!("Failed to allocate image {:?} {:?}", desc.format, desc.extent));
        self.alloc_calls += 1;

        ImageAllocation { image, memory: key }
    }

    /// Release a buffer once the current slot is reused
    pub fn deallocate_buffer(&mut self, allocation: BufferAllocation) {
        self.pending.enqueue(PendingRelease::Buffer(allocation));
        self.dealloc_calls += 1;
    }

    /// Release an image once the current slot is reused
    pub fn deallocate_image(&mut self, allocation: ImageAllocation) {
        self.pending.enqueue(PendingRelease::Image(allocation));
        self.dealloc_calls += 1;
    }

    /// Rotate to `frame_index`, destroying what was released `N` frames ago
    pub fn next_frame(&mut self, frame_index: u64) {
        let released = self.pending.next_frame(frame_index);
        if !released.is_empty() {
            log::trace!("Releasing {} allocations at frame {}", released.len(), frame_index);
        }
        for item in released {
            self.destroy(item);
        }
    }

    /// Destroy every pending deallocation now, whatever its slot
    ///
    /// The device must be idle. Returns how many allocations were released.
    pub fn release_all_pending(&mut self) -> usize {
        let leftovers = self.pending.drain_all();
        let count = leftovers.len();
        for item in leftovers {
            self.destroy(item);
        }
        count
    }

    /// Allocation counters
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            alloc_calls: self.alloc_calls,
            dealloc_calls: self.dealloc_calls,
            pending: self.pending.pending(),
        }
    }

    fn destroy(&self, item: PendingRelease) {
        match item {
            PendingRelease::Buffer(b) => self.device.destroy_buffer(b.buffer, b.memory),
            PendingRelease::Image(i) => self.device.destroy_image(i.image, i.memory),
        }
    }
}

impl<D: RenderDevice> Drop for DeviceMemoryManager<D> {
    fn drop(&mut self) {
        let forced = self.release_all_pending();
        if forced > 0 {
            log::warn!(
                "Device memory leak: {} allocations still pending release at shutdown, destroyed now",
                forced
            );
        }

        if self.alloc_calls != self.dealloc_calls {
            log::warn!(
                "Device memory leak: {} allocations, {} deallocations",
                self.alloc_calls,
                self.dealloc_calls
            );
            debug_assert!(
                std::thread::panicking() || self.alloc_calls >= self.dealloc_calls,
                "more deallocations ({}) than allocations ({})",
                self.dealloc_calls,
                self.alloc_calls
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDevice;

    fn host_buffer(manager: &mut DeviceMemoryManager<MockDevice>) -> BufferAllocation {
        manager.allocate_buffer(
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    #[test]
    fn test_allocation_counts() {
        let device = Arc::new(MockDevice::new());
        let mut manager = DeviceMemoryManager::new(Arc::clone(&device));

        let buffer = host_buffer(&mut manager);
        let image = manager.allocate_image(
            &ImageDesc::texture_2d(vk::Format::R8G8B8A8_UNORM, 4, 4, vk::ImageUsageFlags::SAMPLED),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );
        assert_eq!(manager.stats().alloc_calls, 2);

        manager.deallocate_buffer(buffer);
        manager.deallocate_image(image);
        assert_eq!(
            manager.stats(),
            MemoryStats { alloc_calls: 2, dealloc_calls: 2, pending: 2 }
        );
    }

    #[test]
    fn test_deallocation_deferred_one_full_rotation() {
        let device = Arc::new(MockDevice::new());
        let mut manager = DeviceMemoryManager::new(Arc::clone(&device));

        // Frame 0: allocate and release
        let buffer = host_buffer(&mut manager);
        manager.deallocate_buffer(buffer);
        assert!(device.is_live(buffer.buffer));

        // Frame 1 (t + N - 1): still alive
        manager.next_frame(1);
        assert!(device.is_live(buffer.buffer));

        // Frame 2 (t + N): destroyed exactly once
        manager.next_frame(2);
        assert!(!device.is_live(buffer.buffer));
        assert_eq!(device.calls("destroy_buffer"), 1);

        manager.next_frame(3);
        manager.next_frame(4);
        assert_eq!(device.calls("destroy_buffer"), 1);
    }

    #[test]
    fn test_shutdown_force_releases_pending() {
        let device = Arc::new(MockDevice::new());
        {
            let mut manager = DeviceMemoryManager::new(Arc::clone(&device));
            let buffer = host_buffer(&mut manager);
            manager.deallocate_buffer(buffer);
        }
        assert_eq!(device.live_count("buffer"), 0);
    }

    #[test]
    fn test_release_all_pending_ignores_slots() {
        let device = Arc::new(MockDevice::new());
        let mut manager = DeviceMemoryManager::new(Arc::clone(&device));

        let a = host_buffer(&mut manager);
        manager.deallocate_buffer(a);
        manager.next_frame(1);
        let b = host_buffer(&mut manager);
        manager.deallocate_buffer(b);

        assert_eq!(manager.release_all_pending(), 2);
        assert!(!device.is_live(a.buffer));
        assert!(!device.is_live(b.buffer));
        assert_eq!(manager.stats().pending, 0);
        assert_eq!(manager.release_all_pending(), 0);
    }

    #[test]
    fn test_leak_is_reported_not_fatal() {
        crate::logging::init_for_tests();
        let device = Arc::new(MockDevice::new());
        {
            let mut manager = DeviceMemoryManager::new(Arc::clone(&device));
            let _leaked = host_buffer(&mut manager);
        }
        // Leaked allocation is never destroyed
        assert_eq!(device.live_count("buffer"), 1);
    }

    #[test]
    #[should_panic(expected = "fatal backend failure")]
    fn test_allocation_failure_is_fatal() {
        let device = Arc::new(MockDevice::new());
        let mut manager = DeviceMemoryManager::new(Arc::clone(&device));
        device.fail_next("create_buffer");
        host_buffer(&mut manager);
    }
}
