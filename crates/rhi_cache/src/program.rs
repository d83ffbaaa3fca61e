//! Shader programs and fixed-function pipeline state
//!
//! These are the inputs the pipeline and descriptor caches build native
//! objects from. Programs, their reflection metadata and vertex declarations
//! are created elsewhere and shared through `Arc`; the caches key on the
//! identity of those allocations. Fixed-function state is plain data and is
//! keyed by value.

use ash::vk;
use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A single compiled shader stage
#[derive(Debug, Clone)]
pub struct ShaderStage {
    /// Pipeline stage this module runs at
    pub stage: vk::ShaderStageFlags,
    /// Compiled module, owned by the program's creator
    pub module: vk::ShaderModule,
    /// Entry point name
    pub entry_point: CString,
}

impl ShaderStage {
    /// Stage with the conventional `main` entry point
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self {
            stage,
            module,
            entry_point: CString::from(c"main"),
        }
    }
}

/// Reflected sampler (combined image sampler) binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerInfo {
    /// Name in shader source
    pub name: String,
    /// Binding location
    pub location: u32,
    /// Declared array size, 1 for non-arrays
    pub array_size: u32,
}

/// Reflected uniform block binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlockInfo {
    /// Name in shader source
    pub name: String,
    /// Binding slot
    pub slot: u32,
    /// Block size in bytes
    pub size: u32,
}

/// Count of resources a program binds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcesBindingInfo {
    /// Number of uniform blocks
    pub uniform_buffers: u32,
    /// Number of sampler descriptors, counting array elements
    pub samplers: u32,
}

/// Reflection metadata of a shader program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramMeta {
    /// Combined image samplers
    pub samplers: Vec<SamplerInfo>,
    /// Uniform blocks
    pub uniform_blocks: Vec<UniformBlockInfo>,
}

impl ProgramMeta {
    /// Find a sampler by binding location
    pub fn sampler(&self, location: u32) -> Option<&SamplerInfo> {
        self.samplers.iter().find(|s| s.location == location)
    }

    /// Find a uniform block by binding slot
    pub fn uniform_block(&self, slot: u32) -> Option<&UniformBlockInfo> {
        self.uniform_blocks.iter().find(|b| b.slot == slot)
    }

    /// True when the program binds no resources
    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty() && self.uniform_blocks.is_empty()
    }

    /// Resource counts, used to size descriptor pools
    pub fn binding_info(&self) -> ResourcesBindingInfo {
        ResourcesBindingInfo {
            uniform_buffers: u32::try_from(self.uniform_blocks.len()).unwrap_or(u32::MAX),
            samplers: self.samplers.iter().map(|s| s.array_size).sum(),
        }
    }

    /// Descriptor set layout bindings, visible to all stages
    pub fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        let samplers = self.samplers.iter().map(|sampler| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(sampler.location)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(sampler.array_size)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        });

        let blocks = self.uniform_blocks.iter().map(|block| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(block.slot)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        });

        samplers.chain(blocks).collect()
    }
}

/// A linked shader program
#[derive(Debug)]
pub struct ShaderProgram {
    /// Debug name, never part of a cache key
    pub name: String,
    /// Compiled stages
    pub stages: Vec<ShaderStage>,
    /// Reflection metadata shared with the descriptor layer
    pub meta: Arc<ProgramMeta>,
}

impl ShaderProgram {
    /// Create a program
    pub fn new(name: impl Into<String>, stages: Vec<ShaderStage>, meta: Arc<ProgramMeta>) -> Self {
        Self {
            name: name.into(),
            stages,
            meta,
        }
    }
}

/// One attribute inside a vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    /// Data format
    pub format: vk::Format,
    /// Byte offset within a vertex
    pub offset: u32,
}

/// One bound vertex buffer stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBufferLayout {
    /// Binding index
    pub binding: u32,
    /// Declared stride in bytes
    pub stride: u32,
    /// Per-vertex or per-instance stepping
    pub input_rate: vk::VertexInputRate,
    /// Attributes read from this stream
    pub attributes: Vec<VertexAttribute>,
}

/// Complete vertex input layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexDeclaration {
    /// Streams in binding order
    pub buffers: Vec<VertexBufferLayout>,
}

impl VertexDeclaration {
    /// Native binding descriptions
    pub fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        self.buffers
            .iter()
            .map(|buffer| vk::VertexInputBindingDescription {
                binding: buffer.binding,
                stride: buffer.stride,
                input_rate: buffer.input_rate,
            })
            .collect()
    }

    /// Native attribute descriptions
    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.buffers
            .iter()
            .flat_map(|buffer| {
                buffer.attributes.iter().map(move |attribute| vk::VertexInputAttributeDescription {
                    location: attribute.location,
                    binding: buffer.binding,
                    format: attribute.format,
                    offset: attribute.offset,
                })
            })
            .collect()
    }
}

/// Rasterizer state
#[derive(Debug, Clone, Copy)]
pub struct RasterState {
    /// Fill mode
    pub polygon_mode: vk::PolygonMode,
    /// Faces to cull
    pub cull_mode: vk::CullModeFlags,
    /// Winding of front faces
    pub front_face: vk::FrontFace,
    /// Line width for line topologies
    pub line_width: f32,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
        }
    }
}

// Floats compare by bit pattern so that equal keys always hash equal
impl PartialEq for RasterState {
    fn eq(&self, other: &Self) -> bool {
        self.polygon_mode == other.polygon_mode
            && self.cull_mode == other.cull_mode
            && self.front_face == other.front_face
            && self.line_width.to_bits() == other.line_width.to_bits()
    }
}

impl Eq for RasterState {}

impl Hash for RasterState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.polygon_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_face.hash(state);
        self.line_width.to_bits().hash(state);
    }
}

/// Stencil operations for one face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFace {
    /// Action when the stencil test fails
    pub fail_op: vk::StencilOp,
    /// Action when both tests pass
    pub pass_op: vk::StencilOp,
    /// Action when only the depth test fails
    pub depth_fail_op: vk::StencilOp,
    /// Stencil comparison
    pub compare_op: vk::CompareOp,
    /// Bits read by the comparison
    pub compare_mask: u32,
    /// Bits written
    pub write_mask: u32,
    /// Reference value
    pub reference: u32,
}

impl StencilFace {
    /// Native stencil state
    pub fn to_vk(&self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.compare_mask,
            write_mask: self.write_mask,
            reference: self.reference,
        }
    }
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: 0xff,
            write_mask: 0xff,
            reference: 0,
        }
    }
}

/// Depth and stencil test state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    /// Enable depth testing
    pub depth_test: bool,
    /// Enable depth writes
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare: vk::CompareOp,
    /// Enable stencil testing
    pub stencil_test: bool,
    /// Front face stencil ops
    pub front: StencilFace,
    /// Back face stencil ops
    pub back: StencilFace,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            stencil_test: false,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

/// Blending for one color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendAttachment {
    /// Enable blending
    pub enable: bool,
    /// Source color factor
    pub src_color: vk::BlendFactor,
    /// Destination color factor
    pub dst_color: vk::BlendFactor,
    /// Color blend operation
    pub color_op: vk::BlendOp,
    /// Source alpha factor
    pub src_alpha: vk::BlendFactor,
    /// Destination alpha factor
    pub dst_alpha: vk::BlendFactor,
    /// Alpha blend operation
    pub alpha_op: vk::BlendOp,
    /// Channels written
    pub write_mask: vk::ColorComponentFlags,
}

impl BlendAttachment {
    /// Blending disabled, all channels written
    pub fn opaque() -> Self {
        Self {
            enable: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }

    /// Standard non-premultiplied alpha blending
    pub fn alpha() -> Self {
        Self {
            enable: true,
            src_color: vk::BlendFactor::SRC_ALPHA,
            dst_color: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ..Self::opaque()
        }
    }

    /// Native attachment blend state
    pub fn to_vk(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::Bool32::from(self.enable),
            src_color_blend_factor: self.src_color,
            dst_color_blend_factor: self.dst_color,
            color_blend_op: self.color_op,
            src_alpha_blend_factor: self.src_alpha,
            dst_alpha_blend_factor: self.dst_alpha,
            alpha_blend_op: self.alpha_op,
            color_write_mask: self.write_mask,
        }
    }
}

/// Blend state across all color attachments
#[derive(Debug, Clone)]
pub struct BlendState {
    /// One entry per color attachment, in attachment order
    pub attachments: Vec<BlendAttachment>,
    /// Constant blend color
    pub constants: [f32; 4],
}

impl BlendState {
    /// Opaque writes to `count` attachments
    pub fn opaque(count: usize) -> Self {
        Self {
            attachments: vec![BlendAttachment::opaque(); count],
            constants: [0.0; 4],
        }
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::opaque(1)
    }
}

impl PartialEq for BlendState {
    fn eq(&self, other: &Self) -> bool {
        self.attachments == other.attachments
            && self.constants.map(f32::to_bits) == other.constants.map(f32::to_bits)
    }
}

impl Eq for BlendState {}

impl Hash for BlendState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attachments.hash(state);
        self.constants.map(f32::to_bits).hash(state);
    }
}

/// Everything a draw binds besides the render pass and topology
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Shader program
    pub program: Arc<ShaderProgram>,
    /// Vertex input layout
    pub declaration: Arc<VertexDeclaration>,
    /// Rasterizer state
    pub raster: RasterState,
    /// Depth and stencil state
    pub depth_stencil: DepthStencilState,
    /// Blend state
    pub blend: BlendState,
}

impl PipelineState {
    /// State with default fixed-function settings
    pub fn new(program: Arc<ShaderProgram>, declaration: Arc<VertexDeclaration>) -> Self {
        Self {
            program,
            declaration,
            raster: RasterState::default(),
            depth_stencil: DepthStencilState::default(),
            blend: BlendState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ProgramMeta {
        ProgramMeta {
            samplers: vec![SamplerInfo {
                name: "textures".to_string(),
                location: 1,
                array_size: 4,
            }],
            uniform_blocks: vec![UniformBlockInfo {
                name: "Transform".to_string(),
                slot: 0,
                size: 128,
            }],
        }
    }

    #[test]
    fn test_layout_bindings_from_reflection() {
        let bindings = sample_meta().layout_bindings();
        assert_eq!(bindings.len(), 2);

        let sampler = bindings.iter().find(|b| b.binding == 1).unwrap();
        assert_eq!(sampler.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sampler.descriptor_count, 4);
        assert_eq!(sampler.stage_flags, vk::ShaderStageFlags::ALL);

        let block = bindings.iter().find(|b| b.binding == 0).unwrap();
        assert_eq!(block.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(block.descriptor_count, 1);
    }

    #[test]
    fn test_binding_info_counts_array_elements() {
        let info = sample_meta().binding_info();
        assert_eq!(info.uniform_buffers, 1);
        assert_eq!(info.samplers, 4);
        assert!(ProgramMeta::default().is_empty());
    }

    #[test]
    fn test_vertex_declaration_descriptions() {
        let declaration = VertexDeclaration {
            buffers: vec![VertexBufferLayout {
                binding: 0,
                stride: 20,
                input_rate: vk::VertexInputRate::VERTEX,
                attributes: vec![
                    VertexAttribute { location: 0, format: vk::Format::R32G32B32_SFLOAT, offset: 0 },
                    VertexAttribute { location: 1, format: vk::Format::R32G32_SFLOAT, offset: 12 },
                ],
            }],
        };

        assert_eq!(declaration.binding_descriptions()[0].stride, 20);
        let attributes = declaration.attribute_descriptions();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[1].binding, 0);
    }

    #[test]
    fn test_float_state_compares_by_bits() {
        let a = RasterState::default();
        let mut b = RasterState::default();
        assert_eq!(a, b);
        b.line_width = 2.0;
        assert_ne!(a, b);

        let mut blend = BlendState::default();
        assert_eq!(blend, BlendState::opaque(1));
        blend.constants[0] = 0.5;
        assert_ne!(blend, BlendState::opaque(1));
    }
}
