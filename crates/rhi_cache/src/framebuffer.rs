//! Render pass and framebuffer cache
//!
//! Render passes are keyed by the attachment formats, layouts and load/store
//! options of the target; framebuffers by the target's identity and the
//! render pass they were built for. Surface-backed entries also carry the
//! surface version, so a resized surface always misses and gets fresh
//! objects. Entries built for an old version are never returned again and
//! age out through the regular collection pass.

use crate::backend::{FramebufferDesc, RenderDevice, RenderPassLayout};
use crate::cache::{ByIdentity, CacheStats, ContentAddressedCache, HashedKey};
use crate::config::GcPolicy;
use crate::error::OrFatal;
use crate::surface::{OffscreenTarget, PresentationSurface, RenderTarget};
use ash::vk;
use std::sync::Arc;

/// Load and store behavior of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentOption {
    /// Clear on load, keep results
    ClearStore,
    /// Clear on load, discard results
    ClearDiscard,
    /// Keep previous contents and results
    LoadStore,
    /// Keep previous contents, discard results
    LoadDiscard,
    /// Ignore previous contents, keep results
    DiscardStore,
    /// Ignore previous contents and results
    DiscardDiscard,
}

impl AttachmentOption {
    /// Native load op
    pub const fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            Self::ClearStore | Self::ClearDiscard => vk::AttachmentLoadOp::CLEAR,
            Self::LoadStore | Self::LoadDiscard => vk::AttachmentLoadOp::LOAD,
            Self::DiscardStore | Self::DiscardDiscard => vk::AttachmentLoadOp::DONT_CARE,
        }
    }

    /// Native store op
    pub const fn store_op(self) -> vk::AttachmentStoreOp {
        match self {
            Self::ClearStore | Self::LoadStore | Self::DiscardStore => vk::AttachmentStoreOp::STORE,
            Self::ClearDiscard | Self::LoadDiscard | Self::DiscardDiscard => vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    /// True when previous contents are not needed
    pub const fn discards_on_start(self) -> bool {
        !matches!(self, Self::LoadStore | Self::LoadDiscard)
    }
}

/// What a caller asks the cache for
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    /// Target to draw into
    pub target: RenderTarget,
    /// One option per color attachment of the target
    pub color_options: Vec<AttachmentOption>,
    /// Depth aspect option
    pub depth_option: AttachmentOption,
    /// Stencil aspect option
    pub stencil_option: AttachmentOption,
}

/// Native objects for beginning a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassObjects {
    /// Render pass
    pub render_pass: vk::RenderPass,
    /// Framebuffer for the requested target (and presentation image)
    pub framebuffer: vk::Framebuffer,
    /// Render area size
    pub extent: vk::Extent2D,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderPassKey {
    color_options: Vec<AttachmentOption>,
    color_formats: Vec<vk::Format>,
    color_layouts: Vec<vk::ImageLayout>,
    depth_option: AttachmentOption,
    stencil_option: AttachmentOption,
    depth_stencil_format: vk::Format,
    depth_stencil_layout: vk::ImageLayout,
    depth: bool,
    stencil: bool,
    version: u32,
}

impl RenderPassKey {
    fn from_descriptor(descriptor: &RenderPassDescriptor) -> Self {
        match &descriptor.target {
            RenderTarget::Offscreen(target) => {
                debug_assert_eq!(
                    descriptor.color_options.len(),
                    target.colors.len(),
                    "one option per color attachment of '{}'",
                    target.name
                );
                let (depth_stencil_format, depth_stencil_layout) = target
                    .depth_stencil
                    .map_or((vk::Format::UNDEFINED, vk::ImageLayout::UNDEFINED), |a| (a.format, a.layout));

                Self {
                    color_options: descriptor.color_options.clone(),
                    color_formats: target.colors.iter().map(|a| a.format).collect(),
                    color_layouts: target.colors.iter().map(|a| a.layout).collect(),
                    depth_option: descriptor.depth_option,
                    stencil_option: descriptor.stencil_option,
                    depth_stencil_format,
                    depth_stencil_layout,
                    depth: target.has_depth(),
                    stencil: target.has_stencil(),
                    version: 0,
                }
            }
            RenderTarget::Surface { surface, .. } => {
                debug_assert_eq!(descriptor.color_options.len(), 1, "surfaces have one color attachment");

                Self {
                    color_options: descriptor.color_options.clone(),
                    color_formats: vec![surface.color_format()],
                    color_layouts: vec![vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL],
                    depth_option: descriptor.depth_option,
                    stencil_option: descriptor.stencil_option,
                    depth_stencil_format: surface.depth_stencil_format(),
                    depth_stencil_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    depth: true,
                    stencil: true,
                    version: surface.version(),
                }
            }
        }
    }

    fn layout(&self) -> RenderPassLayout {
        let mut attachments: Vec<vk::AttachmentDescription> = self
            .color_options
            .iter()
            .zip(&self.color_formats)
            .zip(&self.color_layouts)
            .map(|((option, format), layout)| vk::AttachmentDescription {
                format: *format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: option.load_op(),
                store_op: option.store_op(),
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: if option.discards_on_start() {
                    vk::ImageLayout::UNDEFINED
                } else {
                    *layout
                },
                final_layout: *layout,
                ..Default::default()
            })
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..attachments.len())
            .map(|i| vk::AttachmentReference {
                attachment: i as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let mut depth_stencil_ref = None;
        if self.depth || self.stencil {
            // Both aspects must discard for the old contents to be dropped
            let discard = self.depth_option.discards_on_start() && self.stencil_option.discards_on_start();

            attachments.push(vk::AttachmentDescription {
                format: self.depth_stencil_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: self.depth_option.load_op(),
                store_op: self.depth_option.store_op(),
                stencil_load_op: self.stencil_option.load_op(),
                stencil_store_op: self.stencil_option.store_op(),
                initial_layout: if discard {
                    vk::ImageLayout::UNDEFINED
                } else {
                    self.depth_stencil_layout
                },
                final_layout: self.depth_stencil_layout,
                ..Default::default()
            });
            depth_stencil_ref = Some(vk::AttachmentReference {
                attachment: (attachments.len() - 1) as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
        }

        let dependencies = vec![
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::SHADER_READ,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::VERTEX_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        RenderPassLayout {
            attachments,
            color_refs,
            depth_stencil_ref,
            dependencies,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TargetIdentity {
    Surface(ByIdentity<dyn PresentationSurface>),
    Offscreen(ByIdentity<OffscreenTarget>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    target: TargetIdentity,
    render_pass: vk::RenderPass,
    version: u32,
}

#[derive(Debug)]
enum FramebufferValue {
    // One framebuffer per presentation image
    Surface(Vec<vk::Framebuffer>),
    Offscreen(vk::Framebuffer),
}

/// Render pass plus framebuffer cache
pub struct FramebufferCache<D: RenderDevice> {
    device: Arc<D>,
    render_passes: ContentAddressedCache<RenderPassKey, vk::RenderPass>,
    framebuffers: ContentAddressedCache<FramebufferKey, FramebufferValue>,
}

impl<D: RenderDevice> FramebufferCache<D> {
    /// Create an empty cache
    pub fn new(device: Arc<D>, policy: GcPolicy) -> Self {
        Self {
            device,
            render_passes: ContentAddressedCache::new(policy),
            framebuffers: ContentAddressedCache::new(policy),
        }
    }

    /// Render pass and framebuffer for drawing into a target
    pub fn get_or_create_render_pass(&mut self, descriptor: &RenderPassDescriptor) -> RenderPassObjects {
        let name = descriptor.target.name();
        let device = &self.device;

        let render_pass = *self
            .render_passes
            .get_or_create(HashedKey::new(RenderPassKey::from_descriptor(descriptor)), |key| {
                let render_pass = device
                    .create_render_pass(&key.layout(), name)
                    .or_fatal(format_args!("Failed to create render pass for {name}"));
                log::debug!("Cache new RenderPass: {:?} {}", render_pass, name);
                render_pass
            });

        let (target, version, extent) = match &descriptor.target {
            RenderTarget::Surface { surface, image_index } => {
                debug_assert!(*image_index < surface.image_count(), "presentation image out of range");
                (
                    TargetIdentity::Surface(ByIdentity::new(surface)),
                    surface.version(),
                    surface.extent(),
                )
            }
            RenderTarget::Offscreen(target) => (TargetIdentity::Offscreen(ByIdentity::new(target)), 0, target.extent),
        };

        let key = FramebufferKey {
            target,
            render_pass,
            version,
        };
        let value = self.framebuffers.get_or_create(HashedKey::new(key), |_| {
            let value = create_framebuffers(device.as_ref(), &descriptor.target, render_pass, extent);
            log::debug!("Cache new Framebuffer: {:?} {}", value, name);
            value
        });

        let framebuffer = match (value, &descriptor.target) {
            (FramebufferValue::Surface(images), RenderTarget::Surface { image_index, .. }) => {
                images[*image_index as usize]
            }
            (FramebufferValue::Offscreen(framebuffer), _) => *framebuffer,
            (FramebufferValue::Surface(_), RenderTarget::Offscreen(_)) => {
                unreachable!("framebuffer keys separate surface and offscreen targets")
            }
        };

        RenderPassObjects {
            render_pass,
            framebuffer,
            extent,
        }
    }

    /// Evict idle framebuffers and render passes
    pub fn gc(&mut self) {
        let device = &self.device;
        self.framebuffers.gc(|_, value| {
            log::debug!("Release Framebuffer: {:?}", value);
            release_framebuffer(device.as_ref(), value);
        });
        self.render_passes.gc(|_, render_pass| {
            log::debug!("Release RenderPass: {:?}", render_pass);
            device.destroy_render_pass(render_pass);
        });
    }

    /// Render pass cache counters
    pub fn render_pass_stats(&self) -> CacheStats {
        self.render_passes.stats()
    }

    /// Framebuffer cache counters
    pub fn framebuffer_stats(&self) -> CacheStats {
        self.framebuffers.stats()
    }
}

fn create_framebuffers<D: RenderDevice>(
    device: &D,
    target: &RenderTarget,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> FramebufferValue {
    match target {
        RenderTarget::Surface { surface, .. } => {
            let depth = surface.depth_stencil_view();
            let framebuffers = (0..surface.image_count())
                .map(|index| {
                    let attachments = [surface.color_view(index), depth];
                    let desc = FramebufferDesc {
                        render_pass,
                        attachments: &attachments,
                        extent,
                        debug_name: surface.name(),
                    };
                    device
                        .create_framebuffer(&desc)
                        .or_fatal(format_args!("Failed to create framebuffer {index} for {}", surface.name()))
                })
                .collect();
            FramebufferValue::Surface(framebuffers)
        }
        RenderTarget::Offscreen(target) => {
            let attachments = target.views();
            let desc = FramebufferDesc {
                render_pass,
                attachments: &attachments,
                extent,
                debug_name: &target.name,
            };
            FramebufferValue::Offscreen(
                device
                    .create_framebuffer(&desc)
                    .or_fatal(format_args!("Failed to create framebuffer for {}", target.name)),
            )
        }
    }
}

fn release_framebuffer<D: RenderDevice>(device: &D, value: FramebufferValue) {
    match value {
        FramebufferValue::Surface(framebuffers) => {
            for framebuffer in framebuffers {
                device.destroy_framebuffer(framebuffer);
            }
        }
        FramebufferValue::Offscreen(framebuffer) => device.destroy_framebuffer(framebuffer),
    }
}

impl<D: RenderDevice> Drop for FramebufferCache<D> {
    fn drop(&mut self) {
        let device = &self.device;
        self.framebuffers.drain(|_, value| release_framebuffer(device.as_ref(), value));
        self.render_passes.drain(|_, render_pass| device.destroy_render_pass(render_pass));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDevice;
    use crate::surface::test_surface::TestSurface;
    use crate::surface::TargetAttachment;
    use ash::vk::Handle;

    fn surface_descriptor(surface: &Arc<TestSurface>, image_index: u32) -> RenderPassDescriptor {
        RenderPassDescriptor {
            target: RenderTarget::Surface {
                surface: surface.clone(),
                image_index,
            },
            color_options: vec![AttachmentOption::ClearStore],
            depth_option: AttachmentOption::ClearDiscard,
            stencil_option: AttachmentOption::ClearDiscard,
        }
    }

    fn offscreen(name: &str) -> Arc<OffscreenTarget> {
        Arc::new(OffscreenTarget {
            name: name.to_string(),
            extent: vk::Extent2D { width: 256, height: 256 },
            colors: vec![TargetAttachment {
                view: vk::ImageView::from_raw(0x77),
                format: vk::Format::R16G16B16A16_SFLOAT,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }],
            depth_stencil: None,
        })
    }

    fn offscreen_descriptor(target: &Arc<OffscreenTarget>, option: AttachmentOption) -> RenderPassDescriptor {
        RenderPassDescriptor {
            target: RenderTarget::Offscreen(Arc::clone(target)),
            color_options: vec![option],
            depth_option: AttachmentOption::DiscardDiscard,
            stencil_option: AttachmentOption::DiscardDiscard,
        }
    }

    #[test]
    fn test_attachment_option_ops() {
        use AttachmentOption::*;
        assert_eq!(ClearStore.load_op(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(ClearStore.store_op(), vk::AttachmentStoreOp::STORE);
        assert_eq!(LoadDiscard.load_op(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(LoadDiscard.store_op(), vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(DiscardStore.load_op(), vk::AttachmentLoadOp::DONT_CARE);
        assert!(ClearDiscard.discards_on_start());
        assert!(DiscardDiscard.discards_on_start());
        assert!(!LoadStore.discards_on_start());
    }

    #[test]
    fn test_surface_framebuffer_per_image() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
        let surface = Arc::new(TestSurface::new(3));

        let first = cache.get_or_create_render_pass(&surface_descriptor(&surface, 0));
        let second = cache.get_or_create_render_pass(&surface_descriptor(&surface, 2));

        assert_eq!(first.render_pass, second.render_pass);
        assert_ne!(first.framebuffer, second.framebuffer);
        assert_eq!(device.calls("create_render_pass"), 1);
        assert_eq!(device.calls("create_framebuffer"), 3);
        assert_eq!(first.extent.width, 800);
    }

    #[test]
    fn test_identical_requests_hit() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
        let target = offscreen("shadow");

        let a = cache.get_or_create_render_pass(&offscreen_descriptor(&target, AttachmentOption::ClearStore));
        let b = cache.get_or_create_render_pass(&offscreen_descriptor(&target, AttachmentOption::ClearStore));
        assert_eq!(a, b);
        assert_eq!(device.calls("create_render_pass"), 1);
        assert_eq!(device.calls("create_framebuffer"), 1);
        assert_eq!(cache.render_pass_stats().hits, 1);
    }

    #[test]
    fn test_load_op_changes_render_pass() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
        let target = offscreen("color");

        let clear = cache.get_or_create_render_pass(&offscreen_descriptor(&target, AttachmentOption::ClearStore));
        let load = cache.get_or_create_render_pass(&offscreen_descriptor(&target, AttachmentOption::LoadStore));
        assert_ne!(clear.render_pass, load.render_pass);
        assert_ne!(clear.framebuffer, load.framebuffer);

        let layout = device.last_render_pass().unwrap();
        assert_eq!(layout.attachments.len(), 1);
        assert_eq!(layout.attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(layout.attachments[0].initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(layout.depth_stencil_ref.is_none());
    }

    #[test]
    fn test_debug_name_not_part_of_key() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());

        // Same formats and options, different names: render pass shared
        cache.get_or_create_render_pass(&offscreen_descriptor(&offscreen("a"), AttachmentOption::ClearStore));
        cache.get_or_create_render_pass(&offscreen_descriptor(&offscreen("b"), AttachmentOption::ClearStore));
        assert_eq!(device.calls("create_render_pass"), 1);
        // Distinct targets: separate framebuffers
        assert_eq!(device.calls("create_framebuffer"), 2);
    }

    #[test]
    fn test_surface_layout_has_depth_stencil() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
        let surface = Arc::new(TestSurface::new(2));
        cache.get_or_create_render_pass(&surface_descriptor(&surface, 0));

        let layout = device.last_render_pass().unwrap();
        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(layout.attachments[1].format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(layout.depth_stencil_ref.unwrap().attachment, 1);
        assert_eq!(layout.dependencies.len(), 2);
        assert_eq!(layout.dependencies[0].dependency_flags, vk::DependencyFlags::BY_REGION);
    }

    #[test]
    fn test_surface_version_forces_miss() {
        let device = Arc::new(MockDevice::new());
        let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
        let surface = Arc::new(TestSurface::new(2));

        let before = cache.get_or_create_render_pass(&surface_descriptor(&surface, 0));
        surface.resize();
        let after = cache.get_or_create_render_pass(&surface_descriptor(&surface, 0));

        assert_ne!(before.render_pass, after.render_pass);
        assert_ne!(before.framebuffer, after.framebuffer);
        assert_eq!(device.calls("create_framebuffer"), 4);

        // Old objects stay alive until they age out
        assert!(device.is_live(before.framebuffer));
        for _ in 0..8 {
            cache.get_or_create_render_pass(&surface_descriptor(&surface, 1));
            cache.gc();
        }
        assert!(!device.is_live(before.framebuffer));
        assert!(!device.is_live(before.render_pass));
        assert!(device.is_live(after.framebuffer));
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Arc::new(MockDevice::new());
        {
            let mut cache = FramebufferCache::new(Arc::clone(&device), GcPolicy::default());
            let surface = Arc::new(TestSurface::new(3));
            cache.get_or_create_render_pass(&surface_descriptor(&surface, 0));
            cache.get_or_create_render_pass(&offscreen_descriptor(&offscreen("x"), AttachmentOption::LoadStore));
        }
        assert_eq!(device.live_total(), 0);
    }
}
