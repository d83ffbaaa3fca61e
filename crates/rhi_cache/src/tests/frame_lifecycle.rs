//! Frame-by-frame behavior of the whole resource layer
//!
//! Runs the caches and pools together on a mock device, checking object
//! lifetimes against the frame counter the front end sees.

use crate::backend::mock::MockDevice;
use crate::backend::{QueueKind, SubmitSync};
use crate::config::{GcPolicy, RhiCacheConfig};
use crate::context::ResourceContext;
use crate::framebuffer::{AttachmentOption, RenderPassDescriptor};
use crate::pipeline::test_programs::{descriptor, program};
use crate::program::VertexDeclaration;
use crate::surface::test_surface::TestSurface;
use crate::surface::RenderTarget;
use ash::vk::{self, Handle};
use std::sync::Arc;

#[cfg(test)]
mod tests {
    use super::*;

    fn context(device: &Arc<MockDevice>) -> ResourceContext<MockDevice> {
        crate::logging::init_for_tests();
        let config = RhiCacheConfig::default()
            .with_pipeline_policy(GcPolicy::new(2, 4))
            .with_framebuffer_policy(GcPolicy::new(2, 4));
        ResourceContext::new(Arc::clone(device), &config).unwrap()
    }

    #[test]
    fn test_pipeline_lifetime_across_frames() {
        let device = Arc::new(MockDevice::new());
        let mut context = context(&device);
        let program = program("mesh");
        let declaration = Arc::new(VertexDeclaration::default());
        let request = descriptor(&program, &declaration);

        // Frame 0: created
        let a = context.get_or_create_pipeline(&request).pipeline;
        assert_eq!(device.calls("create_graphics_pipeline"), 1);

        // Frames 1..=4: hits
        for frame in 1..=4 {
            assert_eq!(context.next_frame(), frame);
            assert_eq!(context.get_or_create_pipeline(&request).pipeline, a);
        }
        assert_eq!(device.calls("create_graphics_pipeline"), 1);
        assert_eq!(context.stats().pipelines.hits, 4);

        // No longer requested; still cached through frame 7 and into frame 8
        for frame in 5..=8 {
            assert_eq!(context.next_frame(), frame);
            assert!(device.is_live(a), "evicted early at frame {frame}");
        }

        // Collected by the pass closing frame 8
        assert_eq!(context.next_frame(), 9);
        assert!(!device.is_live(a));
        assert_eq!(device.live_count("pipeline_layout"), 0);
        assert_eq!(context.stats().pipelines.evictions, 1);
    }

    #[test]
    fn test_deallocation_survives_frames_in_flight() {
        let device = Arc::new(MockDevice::new());
        let mut context = context(&device);

        for _ in 0..3 {
            context.next_frame();
        }
        let buffer = context.allocate_buffer(
            1024,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        context.deallocate_buffer(buffer);

        // Frame 4 retires the other slot
        context.next_frame();
        assert!(device.is_live(buffer.buffer));

        // Frame 5 revisits the slot of frame 3
        context.next_frame();
        assert!(!device.is_live(buffer.buffer));
        assert_eq!(device.calls("destroy_buffer"), 1);

        context.next_frame();
        context.next_frame();
        assert_eq!(device.calls("destroy_buffer"), 1);
    }

    #[test]
    fn test_descriptor_sets_built_from_pipeline_layout() {
        let device = Arc::new(MockDevice::new());
        let mut context = context(&device);
        let program = program("textured");
        let declaration = Arc::new(VertexDeclaration::default());

        let objects = context.get_or_create_pipeline(&descriptor(&program, &declaration));

        let bind = |context: &mut ResourceContext<MockDevice>, texture: u64| {
            context.bind_layout(objects.set_layout, Arc::clone(&program.meta));
            context.bind_uniform_buffer(vk::Buffer::from_raw(0x900), 0, 64, 0);
            context.bind_texture(
                vk::ImageView::from_raw(texture),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                1,
                0,
            );
            context.bind_sampler(vk::Sampler::from_raw(0x990), 1, 0);
            context.get_or_create_set()
        };

        let first = bind(&mut context, 0x910);
        let again = bind(&mut context, 0x910);
        let other = bind(&mut context, 0x920);

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(device.calls("allocate_descriptor_set"), 2);
        assert_eq!(device.calls("create_descriptor_pool"), 1);

        // Next use of this slot starts from a reset pool
        context.next_frame();
        context.next_frame();
        bind(&mut context, 0x910);
        assert_eq!(device.calls("reset_descriptor_pool"), 1);
        assert_eq!(device.calls("allocate_descriptor_set"), 3);
    }

    #[test]
    fn test_resized_surface_gets_new_framebuffers() {
        let device = Arc::new(MockDevice::new());
        let mut context = context(&device);
        let surface = Arc::new(TestSurface::new(3));
        let request = |image_index| RenderPassDescriptor {
            target: RenderTarget::Surface {
                surface: surface.clone(),
                image_index,
            },
            color_options: vec![AttachmentOption::ClearStore],
            depth_option: AttachmentOption::ClearDiscard,
            stencil_option: AttachmentOption::DiscardDiscard,
        };

        let before = context.get_or_create_render_pass(&request(0));
        assert_eq!(context.get_or_create_render_pass(&request(0)), before);
        assert_eq!(device.live_count("framebuffer"), 3);

        surface.resize();
        context.next_frame();
        let after = context.get_or_create_render_pass(&request(0));
        assert_ne!(after.framebuffer, before.framebuffer);
        assert_eq!(device.live_count("framebuffer"), 6);

        // Stale objects age out while the new ones stay in use
        for _ in 0..6 {
            context.next_frame();
            context.get_or_create_render_pass(&request(1));
        }
        assert!(!device.is_live(before.framebuffer));
        assert!(!device.is_live(before.render_pass));
        assert!(device.is_live(after.framebuffer));
        assert_eq!(device.live_count("framebuffer"), 3);
    }

    #[test]
    fn test_command_and_staging_buffers_recycle_per_slot() {
        let device = Arc::new(MockDevice::new());
        let mut context = context(&device);

        let cmd = context.start_command_buffer(QueueKind::Transfer);
        let staging = context.allocate_staging_buffer(4000);
        context.write_staging(&staging, &[7u8; 4000]);
        context.submit(QueueKind::Transfer, cmd, &SubmitSync::fence(vk::Fence::from_raw(0x77)));

        context.next_frame();
        assert_ne!(context.start_command_buffer(QueueKind::Transfer), cmd);
        assert_ne!(context.allocate_staging_buffer(4000), staging);

        context.next_frame();
        assert_eq!(context.start_command_buffer(QueueKind::Transfer), cmd);
        assert_eq!(context.allocate_staging_buffer(4000), staging);

        let stats = context.stats();
        assert_eq!(stats.staging.total_created, 2);
        assert_eq!(stats.staging.buffers_per_slot, vec![1, 1]);
        assert_eq!(device.calls("allocate_command_buffers"), 2);
        assert_eq!(device.submissions().len(), 1);
        assert_eq!(device.live_staging_pools(), 2);
    }

    #[test]
    fn test_shutdown_leaves_no_live_objects() {
        let device = Arc::new(MockDevice::new());
        {
            let mut context = context(&device);
            let program = program("mesh");
            let declaration = Arc::new(VertexDeclaration::default());
            let surface = Arc::new(TestSurface::new(2));

            for _ in 0..3 {
                context.get_or_create_pipeline(&descriptor(&program, &declaration));
                context.get_or_create_render_pass(&RenderPassDescriptor {
                    target: RenderTarget::Surface {
                        surface: surface.clone(),
                        image_index: 1,
                    },
                    color_options: vec![AttachmentOption::ClearStore],
                    depth_option: AttachmentOption::ClearDiscard,
                    stencil_option: AttachmentOption::ClearDiscard,
                });
                let image = context.allocate_image(
                    &crate::backend::ImageDesc::texture_2d(
                        vk::Format::R8G8B8A8_UNORM,
                        16,
                        16,
                        vk::ImageUsageFlags::SAMPLED,
                    ),
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                );
                context.deallocate_image(image);
                context.allocate_staging_buffer(512);
                context.next_frame();
            }
            assert!(device.live_total() > 0);
        }
        assert_eq!(device.live_total(), 0);
    }
}
