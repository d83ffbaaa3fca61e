//! Render targets consumed by the framebuffer cache
//!
//! A draw renders either into a presentation surface (one image per
//! swapchain entry, recreated on resize) or into an application-owned
//! offscreen target. The surface is provided by the windowing layer through
//! [`PresentationSurface`]; its `version` must change every time its images
//! are recreated.

use ash::vk;
use std::fmt;
use std::sync::Arc;

/// Presentation surface as seen by the framebuffer cache
pub trait PresentationSurface: fmt::Debug {
    /// Debug name
    fn name(&self) -> &str;
    /// Format of the presentation images
    fn color_format(&self) -> vk::Format;
    /// Format of the surface's depth-stencil buffer
    fn depth_stencil_format(&self) -> vk::Format;
    /// Incremented whenever the presentation images are recreated
    fn version(&self) -> u32;
    /// Current size in pixels
    fn extent(&self) -> vk::Extent2D;
    /// Number of images in the presentation chain
    fn image_count(&self) -> u32;
    /// View of one presentation image
    fn color_view(&self, image_index: u32) -> vk::ImageView;
    /// View of the depth-stencil buffer
    fn depth_stencil_view(&self) -> vk::ImageView;
}

/// One attachment of an offscreen target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetAttachment {
    /// Image view
    pub view: vk::ImageView,
    /// Format
    pub format: vk::Format,
    /// Layout the attachment is left in after the pass
    pub layout: vk::ImageLayout,
}

/// Application-owned framebuffer target
#[derive(Debug, Clone)]
pub struct OffscreenTarget {
    /// Debug name
    pub name: String,
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Color attachments in order
    pub colors: Vec<TargetAttachment>,
    /// Optional depth and/or stencil attachment
    pub depth_stencil: Option<TargetAttachment>,
}

impl OffscreenTarget {
    /// True if the depth-stencil attachment has a depth aspect
    pub fn has_depth(&self) -> bool {
        self.depth_stencil.is_some_and(|a| format_has_depth(a.format))
    }

    /// True if the depth-stencil attachment has a stencil aspect
    pub fn has_stencil(&self) -> bool {
        self.depth_stencil.is_some_and(|a| format_has_stencil(a.format))
    }

    /// Views in attachment order, depth-stencil last
    pub fn views(&self) -> Vec<vk::ImageView> {
        self.colors
            .iter()
            .chain(self.depth_stencil.iter())
            .map(|a| a.view)
            .collect()
    }
}

/// True for formats with a depth aspect
pub fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// True for formats with a stencil aspect
pub fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Where a render pass draws
#[derive(Debug, Clone)]
pub enum RenderTarget {
    /// One image of a presentation surface
    Surface {
        /// Surface
        surface: Arc<dyn PresentationSurface>,
        /// Presentation image acquired for this frame
        image_index: u32,
    },
    /// Offscreen target
    Offscreen(Arc<OffscreenTarget>),
}

impl RenderTarget {
    /// Debug name of the target
    pub fn name(&self) -> &str {
        match self {
            Self::Surface { surface, .. } => surface.name(),
            Self::Offscreen(target) => &target.name,
        }
    }

    /// Surface version, 0 for offscreen targets
    pub fn version(&self) -> u32 {
        match self {
            Self::Surface { surface, .. } => surface.version(),
            Self::Offscreen(_) => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_surface {
    use super::*;
    use ash::vk::Handle;
    use std::cell::Cell;

    /// Surface whose version can be bumped from tests
    #[derive(Debug)]
    pub struct TestSurface {
        version: Cell<u32>,
        images: u32,
    }

    impl TestSurface {
        pub fn new(images: u32) -> Self {
            Self {
                version: Cell::new(1),
                images,
            }
        }

        pub fn resize(&self) {
            self.version.set(self.version.get() + 1);
        }
    }

    impl PresentationSurface for TestSurface {
        fn name(&self) -> &str {
            "test surface"
        }
        fn color_format(&self) -> vk::Format {
            vk::Format::B8G8R8A8_SRGB
        }
        fn depth_stencil_format(&self) -> vk::Format {
            vk::Format::D24_UNORM_S8_UINT
        }
        fn version(&self) -> u32 {
            self.version.get()
        }
        fn extent(&self) -> vk::Extent2D {
            vk::Extent2D { width: 800, height: 600 }
        }
        fn image_count(&self) -> u32 {
            self.images
        }
        fn color_view(&self, image_index: u32) -> vk::ImageView {
            vk::ImageView::from_raw(0x10 + u64::from(image_index))
        }
        fn depth_stencil_view(&self) -> vk::ImageView {
            vk::ImageView::from_raw(0x1)
        }
    }
}
