//! Per-device aggregate of all caches and pools
//!
//! [`ResourceContext`] is what the rendering front end talks to. It owns one
//! instance of every component over a shared device and drives them from a
//! single frame counter, so each component's `next_frame` sees the same
//! frame index and every cache collects exactly once per frame.

use crate::backend::{ImageDesc, QueueKind, RenderDevice, SubmitSync};
use crate::cache::CacheStats;
use crate::command_pool::TransientCommandPool;
use crate::config::RhiCacheConfig;
use crate::descriptor::{DescriptorSetManager, DescriptorStats};
use crate::error::{RhiError, RhiResult};
use crate::frame_ring::FrameRing;
use crate::framebuffer::{FramebufferCache, RenderPassDescriptor, RenderPassObjects};
use crate::memory::{BufferAllocation, DeviceMemoryManager, ImageAllocation, MemoryStats};
use crate::pipeline::{PipelineCache, PipelineDescriptor, PipelineLayoutObjects, PipelineObjects};
use crate::program::ProgramMeta;
use crate::staging::{LinearStagingPool, StagingBuffer, StagingStats};
use ash::vk;
use std::sync::Arc;

/// Snapshot of every component's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Current frame index
    pub frame: u64,
    /// Pipeline cache
    pub pipelines: CacheStats,
    /// Pipeline layout cache
    pub pipeline_layouts: CacheStats,
    /// Render pass cache
    pub render_passes: CacheStats,
    /// Framebuffer cache
    pub framebuffers: CacheStats,
    /// Descriptor pools and sets
    pub descriptors: DescriptorStats,
    /// Staging buffers
    pub staging: StagingStats,
    /// Buffer and image allocations
    pub memory: MemoryStats,
    /// Command buffers allocated across slots
    pub command_buffers: usize,
}

/// Caches and pools for one logical device
///
/// Dropping the context first waits for the device to go idle. Fields then
/// drop in declaration order: caches release their objects first, then the
/// pools, and the memory manager last so that its leak check sees every
/// deallocation.
pub struct ResourceContext<D: RenderDevice> {
    descriptors: DescriptorSetManager<D>,
    pipelines: PipelineCache<D>,
    framebuffers: FramebufferCache<D>,
    staging: LinearStagingPool<D>,
    command_pools: TransientCommandPool<D>,
    memory: DeviceMemoryManager<D>,
    frames: FrameRing<()>,
    device: Arc<D>,
}

impl<D: RenderDevice> ResourceContext<D> {
    /// Build every component from a validated configuration
    pub fn new(device: Arc<D>, config: &RhiCacheConfig) -> RhiResult<Self> {
        config.validate().map_err(RhiError::InitializationFailed)?;

        log::info!(
            "Creating resource context: pipelines {:?}, framebuffers {:?}, descriptors {:?}",
            config.pipelines,
            config.framebuffers,
            config.descriptors
        );

        Ok(Self {
            descriptors: DescriptorSetManager::new(Arc::clone(&device), &config.descriptors),
            pipelines: PipelineCache::new(Arc::clone(&device), config.pipelines),
            framebuffers: FramebufferCache::new(Arc::clone(&device), config.framebuffers),
            staging: LinearStagingPool::new(Arc::clone(&device), &config.staging),
            command_pools: TransientCommandPool::new(Arc::clone(&device), &config.command_pools),
            memory: DeviceMemoryManager::new(Arc::clone(&device)),
            frames: FrameRing::default(),
            device,
        })
    }

    /// Shared device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Current frame index
    pub const fn frame(&self) -> u64 {
        self.frames.frame()
    }

    /// Current frame slot
    pub const fn slot(&self) -> usize {
        self.frames.slot()
    }

    /// Begin the next frame
    ///
    /// Must be called once per rendered frame, before any work for the new
    /// frame is recorded. Recycles the new slot in every pool, then runs
    /// collection on every cache. Returns the new frame index.
    pub fn next_frame(&mut self) -> u64 {
        let frame = self.frames.advance();

        self.memory.next_frame(frame);
        self.command_pools.next_frame(frame);
        self.staging.next_frame(frame);
        self.descriptors.next_frame(frame);

        self.pipelines.gc();
        self.framebuffers.gc();
        self.descriptors.gc();

        frame
    }

    /// Cached pipeline for a draw
    pub fn get_or_create_pipeline(&mut self, descriptor: &PipelineDescriptor) -> PipelineObjects {
        self.pipelines.get_or_create_pipeline(descriptor)
    }

    /// Cached layout objects for a program
    pub fn get_or_create_pipeline_layout(&mut self, meta: &Arc<ProgramMeta>) -> PipelineLayoutObjects {
        self.pipelines.get_or_create_layout(meta)
    }

    /// Cached render pass and framebuffer for a target
    pub fn get_or_create_render_pass(&mut self, descriptor: &RenderPassDescriptor) -> RenderPassObjects {
        self.framebuffers.get_or_create_render_pass(descriptor)
    }

    /// Start assembling a descriptor set
    pub fn bind_layout(&mut self, layout: vk::DescriptorSetLayout, meta: Arc<ProgramMeta>) {
        self.descriptors.bind_layout(layout, meta);
    }

    /// Bind a uniform buffer range
    pub fn bind_uniform_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize, slot: u32) {
        self.descriptors.bind_uniform_buffer(buffer, offset, range, slot);
    }

    /// Bind a texture view
    pub fn bind_texture(&mut self, view: vk::ImageView, layout: vk::ImageLayout, location: u32, index: u32) {
        self.descriptors.bind_texture(view, layout, location, index);
    }

    /// Bind a sampler
    pub fn bind_sampler(&mut self, sampler: vk::Sampler, location: u32, index: u32) {
        self.descriptors.bind_sampler(sampler, location, index);
    }

    /// Descriptor set for the accumulated bindings
    pub fn get_or_create_set(&mut self) -> vk::DescriptorSet {
        self.descriptors.get_or_create_set()
    }

    /// Allocate a buffer
    pub fn allocate_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> BufferAllocation {
        self.memory.allocate_buffer(size, usage, memory)
    }

    /// Allocate an image
    pub fn allocate_image(&mut self, desc: &ImageDesc, memory: vk::MemoryPropertyFlags) -> ImageAllocation {
        self.memory.allocate_image(desc, memory)
    }

    /// Release a buffer once the frames in flight are done with it
    pub fn deallocate_buffer(&mut self, allocation: BufferAllocation) {
        self.memory.deallocate_buffer(allocation);
    }

    /// Release an image once the frames in flight are done with it
    pub fn deallocate_image(&mut self, allocation: ImageAllocation) {
        self.memory.deallocate_image(allocation);
    }

    /// Upload buffer for the current frame
    pub fn allocate_staging_buffer(&mut self, size: vk::DeviceSize) -> StagingBuffer {
        self.staging.allocate_staging_buffer(size)
    }

    /// Fill a staging buffer
    pub fn write_staging(&self, staging: &StagingBuffer, data: &[u8]) {
        self.staging.write(staging, data);
    }

    /// Recording command buffer for a queue, valid for this frame
    pub fn start_command_buffer(&mut self, kind: QueueKind) -> vk::CommandBuffer {
        self.command_pools.start_command_buffer(kind)
    }

    /// End a command buffer and submit it to the queue of `kind`
    pub fn submit(&self, kind: QueueKind, buffer: vk::CommandBuffer, sync: &SubmitSync) {
        self.command_pools.submit(kind, buffer, sync);
    }

    /// Component counters
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            frame: self.frames.frame(),
            pipelines: self.pipelines.pipeline_stats(),
            pipeline_layouts: self.pipelines.layout_stats(),
            render_passes: self.framebuffers.render_pass_stats(),
            framebuffers: self.framebuffers.framebuffer_stats(),
            descriptors: self.descriptors.stats(),
            staging: self.staging.stats(),
            memory: self.memory.stats(),
            command_buffers: self.command_pools.total_allocated(),
        }
    }
}

impl<D: RenderDevice> Drop for ResourceContext<D> {
    fn drop(&mut self) {
        // Recent frames may still reference cached objects
        if let Err(err) = self.device.wait_idle() {
            log::error!("wait_idle failed while destroying resource context: {}", err);
        }
        log::debug!("Destroying resource context at frame {}", self.frames.frame());
    }
}
