//! # RHI Cache
//!
//! Resource lifecycle and object caching for a Vulkan rendering backend.
//!
//! Everything here is driven from the rendering thread, once per frame:
//!
//! - **Frame ring**: per-frame state lives in [`FrameRing`] slots that are
//!   only reused once the frames in flight have retired.
//! - **Deferred release**: [`DeviceMemoryManager`] holds deallocated buffers
//!   and images until their slot comes around again.
//! - **Per-frame pools**: [`TransientCommandPool`] and [`LinearStagingPool`]
//!   hand out command buffers and upload buffers that are recycled, not
//!   freed, when the slot is reused.
//! - **Content-addressed caches**: pipelines, pipeline layouts, render
//!   passes, framebuffers and descriptor pools are created on first request
//!   and evicted after a configurable number of idle frames.
//! - **Descriptor assembly**: [`DescriptorSetManager`] turns a sequence of
//!   bind calls into a written descriptor set.
//!
//! Backend failures are fatal; see [`error`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rhi_cache::prelude::*;
//! use std::sync::Arc;
//!
//! fn frame_loop<D: RenderDevice>(device: Arc<D>) -> Result<(), RhiError> {
//!     let config = RhiCacheConfig::default();
//!     let mut context = ResourceContext::new(device, &config)?;
//!
//!     loop {
//!         context.next_frame();
//!         let cmd = context.start_command_buffer(QueueKind::Graphics);
//!         // Record...
//!         context.submit(QueueKind::Graphics, cmd, &SubmitSync::default());
//!         # break;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Frame bookkeeping
pub mod frame_ring;
pub mod reclaim;

// Pools and allocation
pub mod command_pool;
pub mod memory;
pub mod staging;

// Caches
pub mod cache;
pub mod descriptor;
pub mod framebuffer;
pub mod pipeline;

// Inputs and collaborators
pub mod backend;
pub mod program;
pub mod surface;

pub mod config;
pub mod context;
pub mod error;
pub mod logging;

#[cfg(test)]
mod tests;

pub use backend::{QueueKind, RenderDevice, SubmitSync};
pub use cache::{CacheStats, ContentAddressedCache};
pub use command_pool::TransientCommandPool;
pub use config::{Config, ConfigError, GcPolicy, RhiCacheConfig};
pub use context::ResourceContext;
pub use descriptor::DescriptorSetManager;
pub use error::{RhiError, RhiResult};
pub use frame_ring::{FrameRing, MAX_FRAMES_IN_FLIGHT};
pub use memory::DeviceMemoryManager;
pub use reclaim::DeferredReclaimQueue;
pub use staging::LinearStagingPool;

/// Common imports for front-end code
pub mod prelude {
    pub use crate::{
        backend::{vulkan::VulkanDevice, ImageDesc, QueueFamilies, QueueKind, RenderDevice, SubmitSync},
        config::{Config, GcPolicy, RhiCacheConfig},
        context::{ContextStats, ResourceContext},
        error::{RhiError, RhiResult},
        framebuffer::{AttachmentOption, RenderPassDescriptor, RenderPassObjects},
        memory::{BufferAllocation, ImageAllocation},
        pipeline::{PipelineDescriptor, PipelineObjects},
        program::{
            BlendAttachment, BlendState, DepthStencilState, PipelineState, ProgramMeta, RasterState, SamplerInfo,
            ShaderProgram, ShaderStage, UniformBlockInfo, VertexAttribute, VertexBufferLayout, VertexDeclaration,
        },
        staging::StagingBuffer,
        surface::{OffscreenTarget, PresentationSurface, RenderTarget, TargetAttachment},
        MAX_FRAMES_IN_FLIGHT,
    };
}
