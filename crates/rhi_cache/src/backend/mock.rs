//! Recording device for tests
//!
//! [`MockDevice`] hands out unique fabricated handles, counts every call by
//! operation name and tracks which handles are alive. Destroying a handle
//! that is not alive panics, so a double free in a cache or pool fails the
//! test that triggers it. The order of calls is kept as well, for tests that
//! care about what happens before what.

use super::{
    DescriptorWrite, FramebufferDesc, GraphicsPipelineDesc, ImageDesc, MemoryKey, QueueFamilies, QueueKind,
    RenderDevice, RenderPassLayout, StagingPoolKey, SubmitSync,
};
use crate::error::{RhiError, RhiResult};
use ash::vk::{self, Handle};
use slotmap::SlotMap;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct MockAllocation {
    size: vk::DeviceSize,
    written: vk::DeviceSize,
    pool: Option<StagingPoolKey>,
}

#[derive(Debug)]
struct MockStagingPool {
    buffers: usize,
}

/// A recorded queue submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Queue the buffer went to
    pub kind: QueueKind,
    /// Submitted buffer
    pub buffer: vk::CommandBuffer,
    /// Attached synchronization
    pub sync: SubmitSync,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    calls: HashMap<&'static str, usize>,
    history: Vec<&'static str>,
    live: HashMap<u64, &'static str>,
    memory: SlotMap<MemoryKey, MockAllocation>,
    staging_pools: SlotMap<StagingPoolKey, MockStagingPool>,
    fail_next: HashSet<&'static str>,
    descriptor_pools: HashMap<u64, (u32, u32)>,
    render_passes: Vec<RenderPassLayout>,
    pipelines: Vec<String>,
    descriptor_writes: HashMap<u64, Vec<DescriptorWrite>>,
    begin_flags: HashMap<u64, vk::CommandBufferUsageFlags>,
    recording: HashSet<u64>,
    submissions: Vec<Submission>,
}

impl MockState {
    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
        self.history.push(op);
    }

    fn call(&mut self, op: &'static str) -> RhiResult<()> {
        self.record(op);
        if self.fail_next.remove(op) {
            return Err(RhiError::Api(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        Ok(())
    }

    fn create<H: Handle>(&mut self, kind: &'static str) -> H {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.live.insert(raw, kind);
        H::from_raw(raw)
    }

    fn destroy<H: Handle>(&mut self, op: &'static str, handle: H) {
        self.record(op);
        let raw = handle.as_raw();
        assert!(self.live.remove(&raw).is_some(), "{op}: handle {raw:#x} is not alive");
    }
}

/// In-memory [`RenderDevice`] for unit tests
#[derive(Debug)]
pub struct MockDevice {
    families: QueueFamilies,
    state: RefCell<MockState>,
}

impl MockDevice {
    /// Device with all queues on family 0
    pub fn new() -> Self {
        Self::with_queue_families(QueueFamilies::single(0))
    }

    /// Device with explicit queue families
    pub fn with_queue_families(families: QueueFamilies) -> Self {
        Self {
            families,
            state: RefCell::new(MockState::default()),
        }
    }

    /// Number of times an operation was called
    pub fn calls(&self, op: &str) -> usize {
        self.state.borrow().calls.get(op).copied().unwrap_or(0)
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: &'static str) {
        self.state.borrow_mut().fail_next.insert(op);
    }

    /// True if a handle was created and not yet destroyed
    pub fn is_live(&self, handle: impl Handle) -> bool {
        self.state.borrow().live.contains_key(&handle.as_raw())
    }

    /// Live handles of one kind, e.g. `"pipeline"`
    pub fn live_count(&self, kind: &str) -> usize {
        self.state.borrow().live.values().filter(|k| **k == kind).count()
    }

    /// Total live handles of any kind, staging pools included
    pub fn live_total(&self) -> usize {
        let state = self.state.borrow();
        state.live.len() + state.staging_pools.len()
    }

    /// Every recorded operation, oldest first
    pub fn history(&self) -> Vec<&'static str> {
        self.state.borrow().history.clone()
    }

    /// Position of the first call of `op` in [`history`](Self::history)
    pub fn first_call(&self, op: &str) -> Option<usize> {
        self.state.borrow().history.iter().position(|h| *h == op)
    }

    /// Live staging pools
    pub fn live_staging_pools(&self) -> usize {
        self.state.borrow().staging_pools.len()
    }

    /// Staging pool an allocation was made from
    pub fn staging_pool_of(&self, memory: MemoryKey) -> Option<StagingPoolKey> {
        self.state.borrow().memory.get(memory).and_then(|a| a.pool)
    }

    /// Submissions in order
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.borrow().submissions.clone()
    }

    /// True between begin and end of a command buffer
    pub fn is_recording(&self, buffer: vk::CommandBuffer) -> bool {
        self.state.borrow().recording.contains(&buffer.as_raw())
    }

    /// Bytes written into an allocation
    pub fn bytes_written(&self, memory: MemoryKey) -> Option<vk::DeviceSize> {
        self.state.borrow().memory.get(memory).map(|a| a.written)
    }

    /// Size of an allocation
    pub fn allocation_size(&self, memory: MemoryKey) -> Option<vk::DeviceSize> {
        self.state.borrow().memory.get(memory).map(|a| a.size)
    }

    /// Layout of the most recently created render pass
    pub fn last_render_pass(&self) -> Option<RenderPassLayout> {
        self.state.borrow().render_passes.last().cloned()
    }

    /// Debug names of created pipelines, in creation order
    pub fn pipeline_names(&self) -> Vec<String> {
        self.state.borrow().pipelines.clone()
    }

    /// Writes applied to a descriptor set
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.state
            .borrow()
            .descriptor_writes
            .get(&set.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Flags a command buffer was last begun with
    pub fn begin_flags(&self, buffer: vk::CommandBuffer) -> Option<vk::CommandBufferUsageFlags> {
        self.state.borrow().begin_flags.get(&buffer.as_raw()).copied()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for MockDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state.borrow_mut().call("wait_idle")
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _memory: vk::MemoryPropertyFlags,
    ) -> RhiResult<(vk::Buffer, MemoryKey)> {
        let mut state = self.state.borrow_mut();
        state.call("create_buffer")?;
        let buffer = state.create("buffer");
        let memory = state.memory.insert(MockAllocation {
            size,
            written: 0,
            pool: None,
        });
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: MemoryKey) {
        let mut state = self.state.borrow_mut();
        state.destroy("destroy_buffer", buffer);
        let allocation = state.memory.remove(memory);
        assert!(allocation.is_some(), "buffer memory freed twice");
        if let Some(pool) = allocation.and_then(|a| a.pool) {
            if let Some(pool) = state.staging_pools.get_mut(pool) {
                pool.buffers -= 1;
            }
        }
    }

    fn create_image(&self, desc: &ImageDesc, _memory: vk::MemoryPropertyFlags) -> RhiResult<(vk::Image, MemoryKey)> {
        let mut state = self.state.borrow_mut();
        state.call("create_image")?;
        let image = state.create("image");
        let size = u64::from(desc.extent.width) * u64::from(desc.extent.height) * u64::from(desc.extent.depth);
        let memory = state.memory.insert(MockAllocation {
            size,
            written: 0,
            pool: None,
        });
        Ok((image, memory))
    }

    fn destroy_image(&self, image: vk::Image, memory: MemoryKey) {
        let mut state = self.state.borrow_mut();
        state.destroy("destroy_image", image);
        assert!(state.memory.remove(memory).is_some(), "image memory freed twice");
    }

    fn create_staging_pool(&self, _debug_name: &str) -> RhiResult<StagingPoolKey> {
        let mut state = self.state.borrow_mut();
        state.call("create_staging_pool")?;
        Ok(state.staging_pools.insert(MockStagingPool { buffers: 0 }))
    }

    fn destroy_staging_pool(&self, pool: StagingPoolKey) {
        let mut state = self.state.borrow_mut();
        state.record("destroy_staging_pool");
        let removed = state.staging_pools.remove(pool);
        assert!(removed.is_some(), "destroy_staging_pool: pool is not alive");
        let buffers = removed.map_or(0, |p| p.buffers);
        assert_eq!(buffers, 0, "staging pool destroyed with {buffers} live buffers");
    }

    fn create_staging_buffer(&self, pool: StagingPoolKey, size: vk::DeviceSize) -> RhiResult<(vk::Buffer, MemoryKey)> {
        let mut state = self.state.borrow_mut();
        state.call("create_staging_buffer")?;
        let staging_pool = state
            .staging_pools
            .get_mut(pool)
            .ok_or(RhiError::Api(vk::Result::ERROR_UNKNOWN))?;
        staging_pool.buffers += 1;
        let buffer = state.create("buffer");
        let memory = state.memory.insert(MockAllocation {
            size,
            written: 0,
            pool: Some(pool),
        });
        Ok((buffer, memory))
    }

    fn write_memory(&self, memory: MemoryKey, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("write_memory")?;
        let allocation = state.memory.get_mut(memory).ok_or_else(|| RhiError::InvalidOperation {
            reason: "write to freed memory".to_string(),
        })?;
        let end = offset + data.len() as u64;
        if end > allocation.size {
            return Err(RhiError::InvalidOperation {
                reason: format!("write of {end} bytes into {} byte allocation", allocation.size),
            });
        }
        allocation.written = allocation.written.max(end);
        Ok(())
    }

    fn create_command_pool(&self, _kind: QueueKind) -> RhiResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        state.call("create_command_pool")?;
        Ok(state.create("command_pool"))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("reset_command_pool")?;
        assert!(state.live.contains_key(&pool.as_raw()), "reset of dead command pool");
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.borrow_mut().destroy("destroy_command_pool", pool);
    }

    fn allocate_command_buffers(&self, _pool: vk::CommandPool, count: u32) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        state.call("allocate_command_buffers")?;
        // Buffers are owned by their pool and never destroyed individually
        Ok((0..count)
            .map(|_| {
                state.next_handle += 1;
                vk::CommandBuffer::from_raw(0x1000 + state.next_handle)
            })
            .collect())
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("begin_command_buffer")?;
        state.begin_flags.insert(buffer.as_raw(), flags);
        state.recording.insert(buffer.as_raw());
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("end_command_buffer")?;
        assert!(state.recording.remove(&buffer.as_raw()), "end of a command buffer that is not recording");
        Ok(())
    }

    fn submit(&self, kind: QueueKind, buffer: vk::CommandBuffer, sync: &SubmitSync) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("submit")?;
        assert!(!state.recording.contains(&buffer.as_raw()), "submit of a command buffer still recording");
        state.submissions.push(Submission {
            kind,
            buffer,
            sync: *sync,
        });
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state.borrow_mut();
        state.call("create_descriptor_set_layout")?;
        Ok(state.create("descriptor_set_layout"))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().destroy("destroy_descriptor_set_layout", layout);
    }

    fn create_pipeline_layout(&self, _set_layouts: &[vk::DescriptorSetLayout]) -> RhiResult<vk::PipelineLayout> {
        let mut state = self.state.borrow_mut();
        state.call("create_pipeline_layout")?;
        Ok(state.create("pipeline_layout"))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().destroy("destroy_pipeline_layout", layout);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> RhiResult<vk::Pipeline> {
        let mut state = self.state.borrow_mut();
        state.call("create_graphics_pipeline")?;
        assert!(state.live.contains_key(&desc.layout.as_raw()), "pipeline built on dead layout");
        state.pipelines.push(desc.debug_name.to_string());
        Ok(state.create("pipeline"))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.borrow_mut().destroy("destroy_pipeline", pipeline);
    }

    fn create_render_pass(&self, layout: &RenderPassLayout, _debug_name: &str) -> RhiResult<vk::RenderPass> {
        let mut state = self.state.borrow_mut();
        state.call("create_render_pass")?;
        state.render_passes.push(layout.clone());
        Ok(state.create("render_pass"))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.borrow_mut().destroy("destroy_render_pass", render_pass);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> RhiResult<vk::Framebuffer> {
        let mut state = self.state.borrow_mut();
        state.call("create_framebuffer")?;
        assert!(state.live.contains_key(&desc.render_pass.as_raw()), "framebuffer built on dead render pass");
        Ok(state.create("framebuffer"))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.borrow_mut().destroy("destroy_framebuffer", framebuffer);
    }

    fn create_descriptor_pool(&self, max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        state.call("create_descriptor_pool")?;
        let pool: vk::DescriptorPool = state.create("descriptor_pool");
        state.descriptor_pools.insert(pool.as_raw(), (max_sets, 0));
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.state.borrow_mut();
        state.call("reset_descriptor_pool")?;
        let entry = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or(RhiError::Api(vk::Result::ERROR_UNKNOWN))?;
        entry.1 = 0;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.borrow_mut();
        state.destroy("destroy_descriptor_pool", pool);
        state.descriptor_pools.remove(&pool.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.state.borrow_mut();
        state.call("allocate_descriptor_set")?;
        let entry = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or(RhiError::Api(vk::Result::ERROR_UNKNOWN))?;
        if entry.1 >= entry.0 {
            return Err(RhiError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        entry.1 += 1;
        state.next_handle += 1;
        Ok(vk::DescriptorSet::from_raw(0x1000 + state.next_handle))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.borrow_mut();
        state.record("update_descriptor_set");
        state.descriptor_writes.insert(set.as_raw(), writes.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_tracked() {
        let device = MockDevice::new();
        let a = device.create_render_pass(&RenderPassLayout::default(), "a").unwrap();
        let b = device.create_render_pass(&RenderPassLayout::default(), "b").unwrap();
        assert_ne!(a, b);
        assert_eq!(device.live_count("render_pass"), 2);

        device.destroy_render_pass(a);
        assert!(!device.is_live(a));
        assert!(device.is_live(b));
        assert_eq!(device.calls("create_render_pass"), 2);
        assert_eq!(device.calls("destroy_render_pass"), 1);
    }

    #[test]
    #[should_panic(expected = "is not alive")]
    fn test_double_destroy_panics() {
        let device = MockDevice::new();
        let pool = device.create_command_pool(QueueKind::Graphics).unwrap();
        device.destroy_command_pool(pool);
        device.destroy_command_pool(pool);
    }

    #[test]
    fn test_fail_next_fails_once() {
        let device = MockDevice::new();
        device.fail_next("create_command_pool");
        assert!(device.create_command_pool(QueueKind::Graphics).is_err());
        assert!(device.create_command_pool(QueueKind::Graphics).is_ok());
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = MockDevice::new();
        let pool = device.create_descriptor_pool(1, &[]).unwrap();
        let layout = device.create_descriptor_set_layout(&[]).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(RhiError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        );
        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
    }

    #[test]
    fn test_history_keeps_call_order() {
        let device = MockDevice::new();
        let pool = device.create_command_pool(QueueKind::Graphics).unwrap();
        device.wait_idle().unwrap();
        device.destroy_command_pool(pool);
        assert_eq!(device.history(), vec!["create_command_pool", "wait_idle", "destroy_command_pool"]);
        assert_eq!(device.first_call("wait_idle"), Some(1));
        assert_eq!(device.first_call("submit"), None);
    }

    #[test]
    #[should_panic(expected = "live buffers")]
    fn test_staging_pool_destroyed_with_buffers_panics() {
        let device = MockDevice::new();
        let pool = device.create_staging_pool("slot 0").unwrap();
        device.create_staging_buffer(pool, 256).unwrap();
        device.destroy_staging_pool(pool);
    }

    #[test]
    #[should_panic(expected = "still recording")]
    fn test_submit_of_recording_buffer_panics() {
        let device = MockDevice::new();
        let pool = device.create_command_pool(QueueKind::Graphics).unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        device.submit(QueueKind::Graphics, cmd, &SubmitSync::default()).unwrap();
    }

    #[test]
    fn test_memory_writes_are_bounds_checked() {
        let device = MockDevice::new();
        let (_, memory) = device
            .create_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap();
        device.write_memory(memory, 0, &[0u8; 8]).unwrap();
        assert_eq!(device.bytes_written(memory), Some(8));
        assert!(device.write_memory(memory, 12, &[0u8; 8]).is_err());
    }
}
