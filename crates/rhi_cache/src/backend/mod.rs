//! Native device seam
//!
//! Every component in the crate talks to the GPU through [`RenderDevice`].
//! [`VulkanDevice`](vulkan::VulkanDevice) implements it over `ash` and
//! `vk-mem`; [`MockDevice`](mock::MockDevice) implements it without a GPU
//! and records the calls it receives. Components share the device through an
//! `Arc` handed in at construction.
//!
//! The trait takes plain descriptions (attachment lists, pipeline state)
//! rather than native create-info structs, so the caches can be exercised
//! against the mock and the translation to native structures stays in one
//! place.

pub mod mock;
pub mod vulkan;

use crate::error::RhiResult;
use crate::program::{BlendState, DepthStencilState, RasterState, ShaderStage};
use ash::vk;

slotmap::new_key_type! {
    /// Opaque handle to a memory allocation owned by the device
    pub struct MemoryKey;

    /// Opaque handle to a linear host-visible memory pool owned by the device
    pub struct StagingPoolKey;
}

/// Queue a command pool records for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics and compute work
    Graphics,
    /// Upload and copy work
    Transfer,
    /// Presentation-side transitions
    Present,
}

impl QueueKind {
    /// Every queue kind, in index order
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Transfer, Self::Present];

    /// Dense index for per-kind arrays
    pub const fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Transfer => 1,
            Self::Present => 2,
        }
    }
}

/// Queue family indices the device was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Graphics family
    pub graphics: u32,
    /// Transfer family
    pub transfer: u32,
    /// Present family
    pub present: u32,
}

impl QueueFamilies {
    /// All kinds served by one family
    pub const fn single(family: u32) -> Self {
        Self {
            graphics: family,
            transfer: family,
            present: family,
        }
    }

    /// Family index for a queue kind
    pub const fn get(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Transfer => self.transfer,
            QueueKind::Present => self.present,
        }
    }

    /// Distinct family indices, used for buffer sharing
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.transfer, self.present];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Dimensionality
    pub image_type: vk::ImageType,
    /// Texel format
    pub format: vk::Format,
    /// Size in texels
    pub extent: vk::Extent3D,
    /// Mip level count
    pub mip_levels: u32,
    /// Array layer count
    pub array_layers: u32,
    /// Samples per texel
    pub samples: vk::SampleCountFlags,
    /// Tiling mode
    pub tiling: vk::ImageTiling,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// Single-sampled optimal-tiled 2D image
    pub fn texture_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D { width, height, depth: 1 },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
        }
    }

    /// Set the mip level count
    pub const fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }
}

/// Single-subpass render pass description
#[derive(Debug, Clone, Default)]
pub struct RenderPassLayout {
    /// Color attachments followed by the optional depth-stencil attachment
    pub attachments: Vec<vk::AttachmentDescription>,
    /// Color references of the subpass
    pub color_refs: Vec<vk::AttachmentReference>,
    /// Depth-stencil reference of the subpass
    pub depth_stencil_ref: Option<vk::AttachmentReference>,
    /// External dependencies
    pub dependencies: Vec<vk::SubpassDependency>,
}

/// Framebuffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct FramebufferDesc<'a> {
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Views in attachment order
    pub attachments: &'a [vk::ImageView],
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Debug label
    pub debug_name: &'a str,
}

/// Graphics pipeline creation parameters
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    /// Debug label
    pub debug_name: &'a str,
    /// Shader stages
    pub stages: &'a [ShaderStage],
    /// Vertex streams
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    /// Vertex attributes
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Rasterizer state
    pub raster: &'a RasterState,
    /// Depth and stencil state
    pub depth_stencil: &'a DepthStencilState,
    /// Blend state
    pub blend: &'a BlendState,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Render pass the pipeline executes in
    pub render_pass: vk::RenderPass,
}

/// Resource written into a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    /// Uniform buffer range
    UniformBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Byte range
        range: vk::DeviceSize,
    },
    /// Image view sampled through a sampler
    CombinedImageSampler {
        /// Image view
        view: vk::ImageView,
        /// Layout the image is in when sampled
        layout: vk::ImageLayout,
        /// Sampler
        sampler: vk::Sampler,
    },
}

/// One descriptor write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    /// Binding within the set
    pub binding: u32,
    /// Array element within the binding
    pub array_element: u32,
    /// Resource to write
    pub resource: DescriptorResource,
}

/// Synchronization attached to a queue submission
///
/// Null handles mean "none"; `wait_mask` is only read when `wait` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSync {
    /// Semaphore waited on before execution
    pub wait: vk::Semaphore,
    /// Stages that wait on `wait`
    pub wait_mask: vk::PipelineStageFlags,
    /// Semaphore signaled on completion
    pub signal: vk::Semaphore,
    /// Fence signaled on completion
    pub fence: vk::Fence,
}

impl SubmitSync {
    /// Signal only a fence
    pub fn fence(fence: vk::Fence) -> Self {
        Self {
            fence,
            ..Self::default()
        }
    }
}

/// Logical device operations used by the caches and pools
///
/// Creation calls return [`RhiResult`]; callers treat failures as fatal.
/// Destruction calls never fail.
pub trait RenderDevice {
    /// Queue family serving a queue kind
    fn queue_families(&self) -> QueueFamilies;

    /// Block until the device is idle
    fn wait_idle(&self) -> RhiResult<()>;

    /// Create a buffer and bind newly allocated memory to it
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: vk::MemoryPropertyFlags,
    ) -> RhiResult<(vk::Buffer, MemoryKey)>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: vk::Buffer, memory: MemoryKey);

    /// Create an image and bind newly allocated memory to it
    fn create_image(&self, desc: &ImageDesc, memory: vk::MemoryPropertyFlags) -> RhiResult<(vk::Image, MemoryKey)>;

    /// Destroy an image and free its memory
    fn destroy_image(&self, image: vk::Image, memory: MemoryKey);

    /// Create a host-visible, transfer-source memory pool with linear allocation
    ///
    /// Space freed inside the pool is not reused; it comes back only when
    /// the whole pool is destroyed.
    fn create_staging_pool(&self, debug_name: &str) -> RhiResult<StagingPoolKey>;

    /// Destroy a staging pool; every buffer created in it must be destroyed first
    fn destroy_staging_pool(&self, pool: StagingPoolKey);

    /// Create a transfer-source buffer inside a staging pool
    ///
    /// Destroyed through [`destroy_buffer`](Self::destroy_buffer).
    fn create_staging_buffer(&self, pool: StagingPoolKey, size: vk::DeviceSize) -> RhiResult<(vk::Buffer, MemoryKey)>;

    /// Copy bytes into host-visible memory
    fn write_memory(&self, memory: MemoryKey, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()>;

    /// Create a transient command pool for a queue kind
    fn create_command_pool(&self, kind: QueueKind) -> RhiResult<vk::CommandPool>;

    /// Reset a command pool, recycling all its buffers
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;

    /// Destroy a command pool and its buffers
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate primary command buffers
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> RhiResult<Vec<vk::CommandBuffer>>;

    /// Begin recording a command buffer
    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> RhiResult<()>;

    /// Finish recording a command buffer
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Submit one recorded command buffer to the queue of `kind`
    fn submit(&self, kind: QueueKind, buffer: vk::CommandBuffer, sync: &SubmitSync) -> RhiResult<()>;

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<vk::DescriptorSetLayout>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a pipeline layout over descriptor set layouts
    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RhiResult<vk::PipelineLayout>;

    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Create a graphics pipeline with dynamic viewport and scissor
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> RhiResult<vk::Pipeline>;

    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Create a render pass
    fn create_render_pass(&self, layout: &RenderPassLayout, debug_name: &str) -> RhiResult<vk::RenderPass>;

    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    /// Create a framebuffer
    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> RhiResult<vk::Framebuffer>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Create a descriptor pool
    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> RhiResult<vk::DescriptorPool>;

    /// Reset a descriptor pool, freeing all its sets
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;

    /// Destroy a descriptor pool
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one descriptor set
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;

    /// Write resources into a descriptor set
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);
}
