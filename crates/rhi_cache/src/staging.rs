//! Per-frame linear staging buffers
//!
//! Upload buffers are bucketed by size: bucket sizes start at
//! `initial_size` and grow by `growth_factor`, and a request is served from
//! the smallest bucket that fits. Within a frame each bucket hands out its
//! buffers in order and grows append-only; when the slot is reused the
//! cursors rewind and the same buffers are handed out again.
//!
//! Every slot allocates from its own linear memory pool on the device. The
//! pool never reuses freed space, so the only way to give memory back is
//! to destroy the slot's buffers together with the pool and start over,
//! which is what [`LinearStagingPool::recreate_current_pool`] does.

use crate::backend::{MemoryKey, RenderDevice, StagingPoolKey};
use crate::config::StagingConfig;
use crate::error::OrFatal;
use crate::frame_ring::FrameRing;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A host-visible upload buffer owned by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    /// Native buffer
    pub buffer: vk::Buffer,
    /// Backing host-visible memory
    pub memory: MemoryKey,
    /// Bucket size; at least the requested size
    pub size: vk::DeviceSize,
}

#[derive(Debug, Default)]
struct Bucket {
    buffers: Vec<StagingBuffer>,
    next_free: usize,
}

#[derive(Debug)]
struct StagingSlot {
    pool: StagingPoolKey,
    buckets: BTreeMap<vk::DeviceSize, Bucket>,
}

impl StagingSlot {
    fn new<D: RenderDevice>(device: &D, slot: usize) -> Self {
        let pool = device
            .create_staging_pool(&format!("Staging pool {slot}"))
            .or_fatal(format_args!("Failed to create staging pool for slot {slot}"));
        Self {
            pool,
            buckets: BTreeMap::new(),
        }
    }

    /// Destroy the buffers, then the pool they live in
    fn release<D: RenderDevice>(&mut self, device: &D) {
        for buffer in std::mem::take(&mut self.buckets).into_values().flat_map(|b| b.buffers) {
            device.destroy_buffer(buffer.buffer, buffer.memory);
        }
        device.destroy_staging_pool(self.pool);
    }

    fn buffer_count(&self) -> usize {
        self.buckets.values().map(|b| b.buffers.len()).sum()
    }

    fn reserved_bytes(&self) -> vk::DeviceSize {
        self.buckets.iter().map(|(size, b)| size * b.buffers.len() as u64).sum()
    }
}

/// Staging pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingStats {
    /// Buffers held by each slot
    pub buffers_per_slot: Vec<usize>,
    /// Buffers created over the pool's lifetime
    pub total_created: u64,
    /// Bytes held across all slots
    pub bytes_reserved: vk::DeviceSize,
}

/// Size-bucketed, per-frame, append-only upload buffer pool
pub struct LinearStagingPool<D: RenderDevice> {
    device: Arc<D>,
    ring: FrameRing<StagingSlot>,
    config: StagingConfig,
    total_created: u64,
}

impl<D: RenderDevice> LinearStagingPool<D> {
    /// Create one empty linear memory pool per slot
    pub fn new(device: Arc<D>, config: &StagingConfig) -> Self {
        debug_assert!(config.initial_size > 0 && config.growth_factor >= 2);
        let ring = FrameRing::new(|slot| StagingSlot::new(device.as_ref(), slot));
        Self {
            device,
            ring,
            config: *config,
            total_created: 0,
        }
    }

    /// Smallest bucket size holding `size` bytes
    pub fn bucket_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        let mut bucket = self.config.initial_size;
        while bucket < size {
            bucket = bucket.saturating_mul(self.config.growth_factor);
        }
        bucket
    }

    /// Hand out a buffer of at least `size` bytes for the current frame
    pub fn allocate_staging_buffer(&mut self, size: vk::DeviceSize) -> StagingBuffer {
        debug_assert!(size > 0, "zero sized staging request");

        let bucket_size = self.bucket_size(size);
        let slot = self.ring.current_mut();
        let pool = slot.pool;
        let bucket = slot.buckets.entry(bucket_size).or_default();

        if bucket.next_free == bucket.buffers.len() {
            let (buffer, memory) = self
                .device
                .create_staging_buffer(pool, bucket_size)
                .or_fatal(format_args!("Failed to create staging buffer of {bucket_size} bytes"));
            bucket.buffers.push(StagingBuffer {
                buffer,
                memory,
                size: bucket_size,
            });
            self.total_created += 1;
        }

        let staging = bucket.buffers[bucket.next_free];
        bucket.next_free += 1;
        staging
    }

    /// Copy `data` into a staging buffer at offset 0
    pub fn write(&self, staging: &StagingBuffer, data: &[u8]) {
        debug_assert!(data.len() as u64 <= staging.size, "staging write overflows buffer");
        self.device
            .write_memory(staging.memory, 0, data)
            .or_fatal("Failed to write staging buffer");
    }

    /// Rotate to `frame_index` and rewind that slot's buckets
    ///
    /// A slot that has grown past `max_buffers_per_slot` is rebuilt instead.
    pub fn next_frame(&mut self, frame_index: u64) {
        self.ring.set_frame(frame_index);

        let count = self.ring.current().buffer_count();
        if count > self.config.max_buffers_per_slot {
            log::warn!(
                "Staging slot {} holds {} buffers (limit {}), recreating",
                self.ring.slot(),
                count,
                self.config.max_buffers_per_slot
            );
            self.recreate_current_pool();
            return;
        }

        for bucket in self.ring.current_mut().buckets.values_mut() {
            bucket.next_free = 0;
        }
    }

    /// Destroy every buffer of the current slot and replace its memory pool
    ///
    /// Only valid right after [`next_frame`](Self::next_frame), before any
    /// staging work for the new frame.
    pub fn recreate_current_pool(&mut self) {
        let index = self.ring.slot();
        let device = self.device.as_ref();
        let slot = self.ring.current_mut();
        slot.release(device);
        *slot = StagingSlot::new(device, index);
    }

    /// Pool statistics
    pub fn stats(&self) -> StagingStats {
        StagingStats {
            buffers_per_slot: self.ring.iter().map(StagingSlot::buffer_count).collect(),
            total_created: self.total_created,
            bytes_reserved: self.ring.iter().map(StagingSlot::reserved_bytes).sum(),
        }
    }
}

impl<D: RenderDevice> Drop for LinearStagingPool<D> {
    fn drop(&mut self) {
        let device = self.device.as_ref();
        for slot in self.ring.iter_mut() {
            slot.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDevice;
    use crate::frame_ring::MAX_FRAMES_IN_FLIGHT;

    fn staging(device: &Arc<MockDevice>) -> LinearStagingPool<MockDevice> {
        LinearStagingPool::new(Arc::clone(device), &StagingConfig::default())
    }

    #[test]
    fn test_bucket_sizes_double_from_initial() {
        let device = Arc::new(MockDevice::new());
        let pool = staging(&device);
        assert_eq!(pool.bucket_size(1), 256);
        assert_eq!(pool.bucket_size(256), 256);
        assert_eq!(pool.bucket_size(257), 512);
        assert_eq!(pool.bucket_size(3000), 4096);
    }

    #[test]
    fn test_linear_allocation_within_frame() {
        let device = Arc::new(MockDevice::new());
        let mut pool = staging(&device);

        let a = pool.allocate_staging_buffer(100);
        let b = pool.allocate_staging_buffer(200);
        let c = pool.allocate_staging_buffer(1000);

        assert_ne!(a.buffer, b.buffer);
        assert_eq!(a.size, 256);
        assert_eq!(c.size, 1024);
        assert_eq!(device.calls("create_staging_buffer"), 3);
        assert_eq!(device.calls("create_buffer"), 0);
    }

    #[test]
    fn test_next_frame_rewinds_without_destroying() {
        let device = Arc::new(MockDevice::new());
        let mut pool = staging(&device);

        let first = pool.allocate_staging_buffer(64);
        pool.next_frame(1);
        pool.allocate_staging_buffer(64);
        pool.next_frame(2);

        let reused = pool.allocate_staging_buffer(64);
        assert_eq!(reused, first);
        assert_eq!(device.calls("create_staging_buffer"), 2);
        assert_eq!(device.calls("destroy_buffer"), 0);
        assert_eq!(pool.stats().buffers_per_slot, vec![1, 1]);
    }

    #[test]
    fn test_recreate_current_pool_destroys_slot() {
        let device = Arc::new(MockDevice::new());
        let mut pool = staging(&device);

        pool.allocate_staging_buffer(64);
        pool.allocate_staging_buffer(4096);
        pool.next_frame(1);
        pool.allocate_staging_buffer(64);

        pool.next_frame(2);
        pool.recreate_current_pool();
        assert_eq!(device.calls("destroy_buffer"), 2);
        assert_eq!(device.calls("destroy_staging_pool"), 1);
        assert_eq!(pool.stats().buffers_per_slot, vec![0, 1]);

        pool.allocate_staging_buffer(64);
        assert_eq!(pool.stats().total_created, 4);
    }

    #[test]
    fn test_each_slot_allocates_from_its_own_memory_pool() {
        let device = Arc::new(MockDevice::new());
        let mut pool = staging(&device);
        assert_eq!(device.live_staging_pools(), MAX_FRAMES_IN_FLIGHT);

        let a = pool.allocate_staging_buffer(64);
        let b = pool.allocate_staging_buffer(5000);
        pool.next_frame(1);
        let c = pool.allocate_staging_buffer(64);

        let slot0 = device.staging_pool_of(a.memory);
        assert!(slot0.is_some());
        assert_eq!(device.staging_pool_of(b.memory), slot0);
        assert_ne!(device.staging_pool_of(c.memory), slot0);
    }

    #[test]
    fn test_recreate_replaces_memory_pool() {
        let device = Arc::new(MockDevice::new());
        let mut pool = staging(&device);

        let before = pool.allocate_staging_buffer(64);
        let old_pool = device.staging_pool_of(before.memory);
        pool.recreate_current_pool();

        // Buffers go before their pool
        let destroyed_buffer = device.first_call("destroy_buffer").unwrap();
        let destroyed_pool = device.first_call("destroy_staging_pool").unwrap();
        assert!(destroyed_buffer < destroyed_pool);

        let after = pool.allocate_staging_buffer(64);
        assert!(!device.is_live(before.buffer));
        assert_ne!(device.staging_pool_of(after.memory), old_pool);
        assert_eq!(device.calls("create_staging_pool"), MAX_FRAMES_IN_FLIGHT + 1);
        assert_eq!(device.live_staging_pools(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn test_oversized_slot_is_rebuilt() {
        let device = Arc::new(MockDevice::new());
        let config = StagingConfig {
            max_buffers_per_slot: 2,
            ..StagingConfig::default()
        };
        let mut pool = LinearStagingPool::new(Arc::clone(&device), &config);

        for _ in 0..3 {
            pool.allocate_staging_buffer(16);
        }
        pool.next_frame(1);
        pool.next_frame(2);
        assert_eq!(pool.stats().buffers_per_slot, vec![0, 0]);
        assert_eq!(device.live_count("buffer"), 0);
        assert_eq!(device.calls("destroy_staging_pool"), 1);
    }

    #[test]
    fn test_write_and_drop() {
        let device = Arc::new(MockDevice::new());
        {
            let mut pool = staging(&device);
            let buffer = pool.allocate_staging_buffer(300);
            pool.write(&buffer, &[1u8; 300]);
            assert_eq!(device.bytes_written(buffer.memory), Some(300));
            assert_eq!(pool.stats().bytes_reserved, 512);
        }
        assert_eq!(device.live_count("buffer"), 0);
        assert_eq!(device.live_staging_pools(), 0);
    }
}
