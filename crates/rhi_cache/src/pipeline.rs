//! Graphics pipeline and pipeline layout caches
//!
//! Pipelines are keyed by program and vertex declaration identity, the
//! fixed-function state, the render pass and the primitive topology. Layouts
//! are keyed by the identity of the program's reflection metadata and are
//! shared by every pipeline built from that program. A pipeline hit also
//! refreshes its layout, so a layout is never older than its pipelines and
//! collection can evict pipelines before layouts in the same pass.

use crate::backend::{GraphicsPipelineDesc, RenderDevice};
use crate::cache::{ByIdentity, CacheStats, ContentAddressedCache, HashedKey};
use crate::config::GcPolicy;
use crate::error::OrFatal;
use crate::program::{
    BlendState, DepthStencilState, PipelineState, ProgramMeta, RasterState, ResourcesBindingInfo, ShaderProgram,
    VertexDeclaration,
};
use ash::vk;
use std::sync::Arc;

/// A pipeline request
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    /// Program and fixed-function state
    pub state: PipelineState,
    /// Render pass the pipeline will execute in
    pub render_pass: vk::RenderPass,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
}

/// Layout objects shared by all pipelines of one program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLayoutObjects {
    /// Descriptor set layout for set 0
    pub set_layout: vk::DescriptorSetLayout,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Resource counts of the program
    pub binding_info: ResourcesBindingInfo,
}

/// A cached pipeline with its layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineObjects {
    /// Pipeline
    pub pipeline: vk::Pipeline,
    /// Pipeline layout, for binding descriptor sets
    pub layout: vk::PipelineLayout,
    /// Descriptor set layout, for the descriptor set manager
    pub set_layout: vk::DescriptorSetLayout,
    /// Resource counts of the program
    pub binding_info: ResourcesBindingInfo,
}

type LayoutKey = ByIdentity<ProgramMeta>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ByIdentity<ShaderProgram>,
    declaration: ByIdentity<VertexDeclaration>,
    raster: RasterState,
    depth_stencil: DepthStencilState,
    blend: BlendState,
    render_pass: vk::RenderPass,
    topology: vk::PrimitiveTopology,
}

impl PipelineKey {
    fn from_descriptor(descriptor: &PipelineDescriptor) -> Self {
        let state = &descriptor.state;
        Self {
            program: ByIdentity::new(&state.program),
            declaration: ByIdentity::new(&state.declaration),
            raster: state.raster,
            depth_stencil: state.depth_stencil,
            blend: state.blend.clone(),
            render_pass: descriptor.render_pass,
            topology: descriptor.topology,
        }
    }
}

#[derive(Debug)]
struct PipelineValue {
    pipeline: vk::Pipeline,
    layout_key: HashedKey<LayoutKey>,
}

/// Pipeline and pipeline layout caches
pub struct PipelineCache<D: RenderDevice> {
    device: Arc<D>,
    pipelines: ContentAddressedCache<PipelineKey, PipelineValue>,
    layouts: ContentAddressedCache<LayoutKey, PipelineLayoutObjects>,
}

impl<D: RenderDevice> PipelineCache<D> {
    /// Create empty caches sharing one policy
    pub fn new(device: Arc<D>, policy: GcPolicy) -> Self {
        Self {
            device,
            pipelines: ContentAddressedCache::new(policy),
            layouts: ContentAddressedCache::new(policy),
        }
    }

    /// Layout objects for a program's reflection metadata
    pub fn get_or_create_layout(&mut self, meta: &Arc<ProgramMeta>) -> PipelineLayoutObjects {
        let device = &self.device;
        *self
            .layouts
            .get_or_create(HashedKey::new(ByIdentity::new(meta)), |key| create_layout(device.as_ref(), &key.0))
    }

    /// Pipeline for a draw, plus its layout
    pub fn get_or_create_pipeline(&mut self, descriptor: &PipelineDescriptor) -> PipelineObjects {
        let key = HashedKey::new(PipelineKey::from_descriptor(descriptor));

        if let Some(value) = self.pipelines.get(&key) {
            let pipeline = value.pipeline;
            let layout_key = value.layout_key.clone();
            if let Some(layout) = self.layouts.get(&layout_key) {
                return objects(pipeline, layout);
            }
            log::warn!("Cached pipeline {:?} outlived its layout", pipeline);
        }

        let program = &descriptor.state.program;
        let layout = self.get_or_create_layout(&program.meta);
        let layout_key = HashedKey::new(ByIdentity::new(&program.meta));
        let device = &self.device;

        let value = self.pipelines.get_or_create(key, |_| {
            let pipeline = create_pipeline(device.as_ref(), descriptor, layout.layout);
            log::debug!("Cache new Pipeline: {:?} {}", pipeline, program.name);
            PipelineValue { pipeline, layout_key }
        });

        objects(value.pipeline, &layout)
    }

    /// Evict idle pipelines, then idle layouts
    pub fn gc(&mut self) {
        let device = &self.device;
        self.pipelines.gc(|_, value| {
            log::debug!("Release Pipeline: {:?}", value.pipeline);
            device.destroy_pipeline(value.pipeline);
        });
        self.layouts.gc(|_, layout| {
            log::debug!("Release PipelineLayout: {:?}", layout.layout);
            release_layout(device.as_ref(), layout);
        });
    }

    /// Pipeline cache counters
    pub fn pipeline_stats(&self) -> CacheStats {
        self.pipelines.stats()
    }

    /// Layout cache counters
    pub fn layout_stats(&self) -> CacheStats {
        self.layouts.stats()
    }
}

fn objects(pipeline: vk::Pipeline, layout: &PipelineLayoutObjects) -> PipelineObjects {
    PipelineObjects {
        pipeline,
        layout: layout.layout,
        set_layout: layout.set_layout,
        binding_info: layout.binding_info,
    }
}

fn create_layout<D: RenderDevice>(device: &D, meta: &ProgramMeta) -> PipelineLayoutObjects {
    let bindings = meta.layout_bindings();
    let set_layout = device
        .create_descriptor_set_layout(&bindings)
        .or_fatal("Failed to create descriptor set layout");
    let layout = device
        .create_pipeline_layout(&[set_layout])
        .or_fatal("Failed to create pipeline layout");

    log::debug!("Cache new PipelineLayout: {:?} ({} bindings)", layout, bindings.len());

    PipelineLayoutObjects {
        set_layout,
        layout,
        binding_info: meta.binding_info(),
    }
}

fn release_layout<D: RenderDevice>(device: &D, layout: PipelineLayoutObjects) {
    device.destroy_pipeline_layout(layout.layout);
    device.destroy_descriptor_set_layout(layout.set_layout);
}

fn create_pipeline<D: RenderDevice>(
    device: &D,
    descriptor: &PipelineDescriptor,
    layout: vk::PipelineLayout,
) -> vk::Pipeline {
    let state = &descriptor.state;
    let vertex_bindings = state.declaration.binding_descriptions();
    let vertex_attributes = state.declaration.attribute_descriptions();

    let desc = GraphicsPipelineDesc {
        debug_name: &state.program.name,
        stages: &state.program.stages,
        vertex_bindings: &vertex_bindings,
        vertex_attributes: &vertex_attributes,
        topology: descriptor.topology,
        raster: &state.raster,
        depth_stencil: &state.depth_stencil,
        blend: &state.blend,
        layout,
        render_pass: descriptor.render_pass,
    };

    device
        .create_graphics_pipeline(&desc)
        .or_fatal(format_args!("Failed to create pipeline for {}", state.program.name))
}

impl<D: RenderDevice> Drop for PipelineCache<D> {
    fn drop(&mut self) {
        let device = &self.device;
        self.pipelines.drain(|_, value| device.destroy_pipeline(value.pipeline));
        self.layouts.drain(|_, layout| release_layout(device.as_ref(), layout));
    }
}

#[cfg(test)]
pub(crate) mod test_programs {
    use super::*;
    use crate::program::{SamplerInfo, ShaderStage, UniformBlockInfo};
    use ash::vk::Handle;

    pub fn program(name: &str) -> Arc<ShaderProgram> {
        let meta = Arc::new(ProgramMeta {
            samplers: vec![SamplerInfo {
                name: "albedo".to_string(),
                location: 1,
                array_size: 1,
            }],
            uniform_blocks: vec![UniformBlockInfo {
                name: "Camera".to_string(),
                slot: 0,
                size: 64,
            }],
        });
        Arc::new(ShaderProgram::new(
            name,
            vec![
                ShaderStage::new(vk::ShaderStageFlags::VERTEX, vk::ShaderModule::from_raw(0xa1)),
                ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vk::ShaderModule::from_raw(0xa2)),
            ],
            meta,
        ))
    }

    pub fn descriptor(program: &Arc<ShaderProgram>, declaration: &Arc<VertexDeclaration>) -> PipelineDescriptor {
        PipelineDescriptor {
            state: PipelineState::new(Arc::clone(program), Arc::clone(declaration)),
            render_pass: vk::RenderPass::from_raw(0x500),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }
}
