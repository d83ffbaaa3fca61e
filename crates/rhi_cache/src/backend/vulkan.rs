//! Vulkan implementation of [`RenderDevice`]
//!
//! Wraps a logical device created by the application together with a
//! `vk-mem` allocator. The device handle is borrowed (cloned function table);
//! destroying the logical device remains the caller's job and must happen
//! after this wrapper is dropped.

use super::{
    DescriptorResource, DescriptorWrite, FramebufferDesc, GraphicsPipelineDesc, ImageDesc, MemoryKey,
    QueueFamilies, QueueKind, RenderDevice, RenderPassLayout, StagingPoolKey, SubmitSync,
};
use crate::error::{RhiError, RhiResult};
use ash::extensions::ext::DebugUtils;
use ash::vk::{self, Handle};
use slotmap::SlotMap;
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vk_mem::Alloc;

/// Buffer size used to pick the staging pools' memory type
const STAGING_SAMPLE_SIZE: vk::DeviceSize = 1024;

/// Logical device plus memory allocator
pub struct VulkanDevice {
    device: ash::Device,
    families: QueueFamilies,
    queues: [vk::Queue; 3],
    // Pools hold their own reference to the allocator and are destroyed first
    staging_pools: Mutex<SlotMap<StagingPoolKey, vk_mem::AllocatorPool>>,
    allocator: Arc<vk_mem::Allocator>,
    allocations: Mutex<SlotMap<MemoryKey, vk_mem::Allocation>>,
    debug_utils: Option<DebugUtils>,
}

impl VulkanDevice {
    /// Wrap an existing logical device and create its allocator
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> RhiResult<Self> {
        log::debug!("Creating VulkanDevice memory allocator...");

        let create_info = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        let allocator = vk_mem::Allocator::new(create_info)
            .map_err(|e| RhiError::InitializationFailed(format!("Failed to create memory allocator: {e:?}")))?;

        let queues = QueueKind::ALL.map(|kind| unsafe { device.get_device_queue(families.get(kind), 0) });

        Ok(Self {
            device,
            families,
            queues,
            staging_pools: Mutex::new(SlotMap::with_key()),
            allocator: Arc::new(allocator),
            allocations: Mutex::new(SlotMap::with_key()),
            debug_utils: None,
        })
    }

    /// Label created objects through `VK_EXT_debug_utils`
    pub fn with_debug_utils(mut self, entry: &ash::Entry, instance: &ash::Instance) -> Self {
        self.debug_utils = Some(DebugUtils::new(entry, instance));
        self
    }

    /// Raw logical device
    pub const fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn lock_allocations(&self) -> MutexGuard<'_, SlotMap<MemoryKey, vk_mem::Allocation>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_staging_pools(&self) -> MutexGuard<'_, SlotMap<StagingPoolKey, vk_mem::AllocatorPool>> {
        self.staging_pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_name<H: Handle>(&self, handle: H, name: &str) {
        let Some(utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);

        // Naming is best effort
        unsafe {
            let _ = utils.set_debug_utils_object_name(self.device.handle(), &info);
        }
    }

    fn allocation_info(memory: vk::MemoryPropertyFlags) -> vk_mem::AllocationCreateInfo {
        vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Unknown,
            required_flags: memory,
            ..Default::default()
        }
    }

    fn staging_buffer_info(size: vk::DeviceSize) -> vk::BufferCreateInfoBuilder<'static> {
        vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
    }

    fn staging_allocation_info() -> vk_mem::AllocationCreateInfo {
        Self::allocation_info(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

impl RenderDevice for VulkanDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle().map_err(RhiError::from) }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> RhiResult<(vk::Buffer, MemoryKey)> {
        let families = self.families.unique();
        let info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let info = if families.len() > 1 {
            info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&families)
        } else {
            info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(&info, &Self::allocation_info(memory))
                .map_err(|e| match RhiError::from(e) {
                    RhiError::OutOfMemory { .. } => RhiError::OutOfMemory { requested: size },
                    other => other,
                })?
        };

        Ok((buffer, self.lock_allocations().insert(allocation)))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: MemoryKey) {
        let allocation = self.lock_allocations().remove(memory);
        if let Some(mut allocation) = allocation {
            unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
        } else {
            log::warn!("Buffer {:?} destroyed with unknown allocation", buffer);
            unsafe { self.device.destroy_buffer(buffer, None) };
        }
    }

    fn create_image(&self, desc: &ImageDesc, memory: vk::MemoryPropertyFlags) -> RhiResult<(vk::Image, MemoryKey)> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = unsafe {
            self.allocator
                .create_image(&info, &Self::allocation_info(memory))
                .map_err(RhiError::from)?
        };

        Ok((image, self.lock_allocations().insert(allocation)))
    }

    fn destroy_image(&self, image: vk::Image, memory: MemoryKey) {
        let allocation = self.lock_allocations().remove(memory);
        if let Some(mut allocation) = allocation {
            unsafe { self.allocator.destroy_image(image, &mut allocation) };
        } else {
            log::warn!("Image {:?} destroyed with unknown allocation", image);
            unsafe { self.device.destroy_image(image, None) };
        }
    }

    fn create_staging_pool(&self, debug_name: &str) -> RhiResult<StagingPoolKey> {
        let memory_type = unsafe {
            self.allocator
                .find_memory_type_index_for_buffer_info(
                    &Self::staging_buffer_info(STAGING_SAMPLE_SIZE),
                    &Self::staging_allocation_info(),
                )
                .map_err(RhiError::from)?
        };

        // Allocations are never freed individually
        let flags = vk_mem::AllocatorPoolCreateFlags::LINEAR_ALGORITHM;
        let info = vk_mem::PoolCreateInfo::new().memory_type_index(memory_type).flags(&flags);
        let pool = self.allocator.create_pool(&info).map_err(RhiError::from)?;
        if let Ok(name) = CString::new(debug_name) {
            pool.set_name(Some(name.as_c_str()));
        }

        log::debug!("Created linear staging pool '{}' on memory type {}", debug_name, memory_type);
        Ok(self.lock_staging_pools().insert(pool))
    }

    fn destroy_staging_pool(&self, pool: StagingPoolKey) {
        let removed = self.lock_staging_pools().remove(pool);
        if removed.is_none() {
            log::warn!("Destroying unknown staging pool {:?}", pool);
        }
    }

    fn create_staging_buffer(&self, pool: StagingPoolKey, size: vk::DeviceSize) -> RhiResult<(vk::Buffer, MemoryKey)> {
        let (buffer, allocation) = {
            let pools = self.lock_staging_pools();
            let pool = pools.get(pool).ok_or_else(|| RhiError::InvalidOperation {
                reason: "staging buffer requested from destroyed pool".to_string(),
            })?;
            unsafe {
                pool.create_buffer(&Self::staging_buffer_info(size), &Self::staging_allocation_info())
                    .map_err(|e| match RhiError::from(e) {
                        RhiError::OutOfMemory { .. } => RhiError::OutOfMemory { requested: size },
                        other => other,
                    })?
            }
        };

        Ok((buffer, self.lock_allocations().insert(allocation)))
    }

    fn write_memory(&self, memory: MemoryKey, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        let offset = usize::try_from(offset).map_err(|_| RhiError::InvalidOperation {
            reason: format!("write offset {offset} out of range"),
        })?;

        let mut allocations = self.lock_allocations();
        let allocation = allocations.get_mut(memory).ok_or_else(|| RhiError::InvalidOperation {
            reason: "write to freed allocation".to_string(),
        })?;

        unsafe {
            let mapped = self.allocator.map_memory(allocation).map_err(RhiError::from)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset), data.len());
            self.allocator.unmap_memory(allocation);
        }

        Ok(())
    }

    fn create_command_pool(&self, kind: QueueKind) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.families.get(kind));

        let pool = unsafe { self.device.create_command_pool(&info, None).map_err(RhiError::from)? };
        self.set_name(pool, &format!("{kind:?} transient pool"));
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
                .map_err(RhiError::from)
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> RhiResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&info).map_err(RhiError::from) }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(buffer, &info).map_err(RhiError::from) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(buffer).map_err(RhiError::from) }
    }

    fn submit(&self, kind: QueueKind, buffer: vk::CommandBuffer, sync: &SubmitSync) -> RhiResult<()> {
        let buffers = [buffer];
        let waits = [sync.wait];
        let wait_masks = [sync.wait_mask];
        let signals = [sync.signal];

        let mut info = vk::SubmitInfo::builder().command_buffers(&buffers);
        if sync.wait != vk::Semaphore::null() {
            info = info.wait_semaphores(&waits).wait_dst_stage_mask(&wait_masks);
        }
        if sync.signal != vk::Semaphore::null() {
            info = info.signal_semaphores(&signals);
        }

        unsafe {
            self.device
                .queue_submit(self.queues[kind.index()], &[info.build()], sync.fence)
                .map_err(RhiError::from)
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None).map_err(RhiError::from) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RhiResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        unsafe { self.device.create_pipeline_layout(&info, None).map_err(RhiError::from) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> RhiResult<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(&stage.entry_point)
                    .build()
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.raster.polygon_mode)
            .cull_mode(desc.raster.cull_mode)
            .front_face(desc.raster.front_face)
            .line_width(desc.raster.line_width)
            .depth_bias_enable(false);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_stencil.depth_test)
            .depth_write_enable(desc.depth_stencil.depth_write)
            .depth_compare_op(desc.depth_stencil.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(desc.depth_stencil.stencil_test)
            .front(desc.depth_stencil.front.to_vk())
            .back(desc.depth_stencil.back.to_vk());

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
            desc.blend.attachments.iter().map(|a| a.to_vk()).collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments)
            .blend_constants(desc.blend.constants);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| RhiError::from(e))?
                .into_iter()
                .next()
                .ok_or_else(|| RhiError::InvalidOperation {
                    reason: "driver returned no pipeline".to_string(),
                })?
        };

        self.set_name(pipeline, desc.debug_name);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&self, layout: &RenderPassLayout, debug_name: &str) -> RhiResult<vk::RenderPass> {
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&layout.color_refs);
        if let Some(depth_stencil) = layout.depth_stencil_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_stencil);
        }
        let subpasses = [subpass.build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&layout.dependencies);

        let render_pass = unsafe { self.device.create_render_pass(&info, None).map_err(RhiError::from)? };
        self.set_name(render_pass, &format!("RenderPass for {debug_name}"));
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> RhiResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(desc.render_pass)
            .attachments(desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);

        let framebuffer = unsafe { self.device.create_framebuffer(&info, None).map_err(RhiError::from)? };
        self.set_name(framebuffer, desc.debug_name);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> RhiResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder().max_sets(max_sets).pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&info, None).map_err(RhiError::from) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(RhiError::from)
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&info).map_err(RhiError::from)? };
        sets.into_iter().next().ok_or_else(|| RhiError::InvalidOperation {
            reason: "driver returned no descriptor set".to_string(),
        })
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::UniformBuffer { buffer, offset, range } => {
                    vk::DescriptorBufferInfo { buffer, offset, range }
                }
                DescriptorResource::CombinedImageSampler { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();

        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::CombinedImageSampler { view, layout, sampler } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorResource::UniformBuffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let native: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element);
                match write.resource {
                    DescriptorResource::UniformBuffer { .. } => builder
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[i]))
                        .build(),
                    DescriptorResource::CombinedImageSampler { .. } => builder
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(&image_infos[i]))
                        .build(),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&native, &[]) };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let leaked = self.lock_allocations().len();
        if leaked > 0 {
            log::warn!("VulkanDevice dropped with {} live allocations", leaked);
        }
        let pools = self.lock_staging_pools().len();
        if pools > 0 {
            log::warn!("VulkanDevice dropped with {} live staging pools", pools);
        }
        log::debug!("Destroying VulkanDevice memory allocator");
    }
}
