//! Per-frame transient command pools
//!
//! Each frame slot owns one transient pool per queue kind. Buffers are
//! bump-allocated from a growing array and the whole pool is reset when its
//! slot comes around again, so buffers handed out during frame `t` are only
//! valid until frame `t + N` begins.
//!
//! Buffers come back recording; [`TransientCommandPool::submit`] ends them
//! and hands them to their queue.

use crate::backend::{QueueKind, RenderDevice, SubmitSync};
use crate::config::CommandPoolConfig;
use crate::error::OrFatal;
use crate::frame_ring::FrameRing;
use ash::vk;
use std::sync::Arc;

#[derive(Debug)]
struct QueuePool {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_free: usize,
}

/// Bump allocator over per-slot transient command pools
pub struct TransientCommandPool<D: RenderDevice> {
    device: Arc<D>,
    ring: FrameRing<[QueuePool; 3]>,
    alloc_step: u32,
}

impl<D: RenderDevice> TransientCommandPool<D> {
    /// Create pools for every slot and queue kind
    pub fn new(device: Arc<D>, config: &CommandPoolConfig) -> Self {
        debug_assert!(config.alloc_step > 0, "command buffer allocation step must be positive");

        let ring = FrameRing::new(|slot| {
            QueueKind::ALL.map(|kind| QueuePool {
                pool: device
                    .create_command_pool(kind)
                    .or_fatal(format_args!("Failed to create {kind:?} command pool for slot {slot}")),
                buffers: Vec::new(),
                next_free: 0,
            })
        });

        log::debug!("Created transient command pools for {} frame slots", ring.len());

        Self {
            device,
            ring,
            alloc_step: config.alloc_step,
        }
    }

    /// Rotate to `frame_index` and reset that slot's pools
    pub fn next_frame(&mut self, frame_index: u64) {
        self.ring.set_frame(frame_index);
        for (kind, pool) in QueueKind::ALL.iter().zip(self.ring.current_mut().iter_mut()) {
            self.device
                .reset_command_pool(pool.pool)
                .or_fatal(format_args!("Failed to reset {kind:?} command pool"));
            pool.next_free = 0;
        }
    }

    /// Hand out the next command buffer of the current slot, already recording
    pub fn start_command_buffer(&mut self, kind: QueueKind) -> vk::CommandBuffer {
        let alloc_step = self.alloc_step;
        let pool = &mut self.ring.current_mut()[kind.index()];

        if pool.next_free == pool.buffers.len() {
            let more = self
                .device
                .allocate_command_buffers(pool.pool, alloc_step)
                .or_fatal(format_args!("Failed to allocate {alloc_step} {kind:?} command buffers"));
            pool.buffers.extend(more);
        }

        let buffer = pool.buffers[pool.next_free];
        pool.next_free += 1;

        self.device
            .begin_command_buffer(buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .or_fatal("Failed to begin command buffer");

        buffer
    }

    /// End a buffer started this frame and submit it to the queue of `kind`
    pub fn submit(&self, kind: QueueKind, buffer: vk::CommandBuffer, sync: &SubmitSync) {
        self.device
            .end_command_buffer(buffer)
            .or_fatal("Failed to end command buffer");
        self.device
            .submit(kind, buffer, sync)
            .or_fatal(format_args!("Failed to submit to {kind:?} queue"));
    }

    /// Start a graphics command buffer
    pub fn start_graphics_cmd(&mut self) -> vk::CommandBuffer {
        self.start_command_buffer(QueueKind::Graphics)
    }

    /// Start a transfer command buffer
    pub fn start_transfer_cmd(&mut self) -> vk::CommandBuffer {
        self.start_command_buffer(QueueKind::Transfer)
    }

    /// Start a present-queue command buffer
    pub fn start_present_cmd(&mut self) -> vk::CommandBuffer {
        self.start_command_buffer(QueueKind::Present)
    }

    /// Index of the next buffer the current slot will hand out
    pub fn next_free_index(&self, kind: QueueKind) -> usize {
        self.ring.current()[kind.index()].next_free
    }

    /// Command buffers allocated across all slots and kinds
    pub fn total_allocated(&self) -> usize {
        self.ring
            .iter()
            .flat_map(|pools| pools.iter())
            .map(|pool| pool.buffers.len())
            .sum()
    }
}

impl<D: RenderDevice> Drop for TransientCommandPool<D> {
    fn drop(&mut self) {
        // Pools may still be executing
        if let Err(err) = self.device.wait_idle() {
            log::error!("wait_idle failed while destroying command pools: {}", err);
        }
        for pools in self.ring.iter() {
            for pool in pools {
                self.device.destroy_command_pool(pool.pool);
            }
        }
    }
}
