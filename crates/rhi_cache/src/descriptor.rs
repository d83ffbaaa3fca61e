//! Descriptor set assembly
//!
//! The front end binds a layout, records uniform buffers, textures and
//! samplers against it, then asks for a descriptor set. The manager keeps one
//! write per declared descriptor, so the accumulated binding state doubles as
//! the key of the sets realized so far this frame: binding the same resources
//! again returns the set that was already written.
//!
//! Sets are allocated from pools owned per layout and per frame slot. A slot
//! starts with a pool of `pool_alloc_base` sets and appends pools of
//! `pool_alloc_factor` times the previous size when one runs out. When the
//! slot comes around again a single pool is reset in place; several pools are
//! replaced by one pool large enough for the whole previous frame.

use crate::backend::{DescriptorResource, DescriptorWrite, RenderDevice};
use crate::cache::{ByIdentity, CacheStats, ContentAddressedCache, HashedKey};
use crate::config::DescriptorPoolConfig;
use crate::error::OrFatal;
use crate::frame_ring::FrameRing;
use crate::program::ProgramMeta;
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    layout: vk::DescriptorSetLayout,
    meta: ByIdentity<ProgramMeta>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    pool: vk::DescriptorPool,
    size: u32,
    allocated: u32,
}

#[derive(Debug, Default)]
struct SlotPools {
    buckets: Vec<Bucket>,
    realized: HashMap<HashedKey<Vec<DescriptorWrite>>, vk::DescriptorSet>,
}

#[derive(Debug)]
struct LayoutPool {
    max_buffers: u32,
    max_images: u32,
    slots: FrameRing<SlotPools>,
}

impl LayoutPool {
    fn bucket_count(&self) -> usize {
        self.slots.current().buckets.len()
    }
}

/// Binding state being accumulated for the bound layout
#[derive(Debug)]
struct BoundLayout {
    key: HashedKey<PoolKey>,
    writes: Vec<DescriptorWrite>,
    buffer_writes: HashMap<u32, usize>,
    image_writes: HashMap<u32, usize>,
    set: Option<vk::DescriptorSet>,
    written: bool,
}

impl BoundLayout {
    fn new(layout: vk::DescriptorSetLayout, meta: &Arc<ProgramMeta>) -> Self {
        let mut writes = Vec::new();
        let mut buffer_writes = HashMap::new();
        let mut image_writes = HashMap::new();

        for block in &meta.uniform_blocks {
            buffer_writes.insert(block.slot, writes.len());
            writes.push(DescriptorWrite {
                binding: block.slot,
                array_element: 0,
                resource: DescriptorResource::UniformBuffer {
                    buffer: vk::Buffer::null(),
                    offset: 0,
                    range: 0,
                },
            });
        }

        for sampler in &meta.samplers {
            debug_assert!(sampler.array_size > 0, "sampler {} has no elements", sampler.name);
            image_writes.insert(sampler.location, writes.len());
            writes.extend((0..sampler.array_size).map(|element| DescriptorWrite {
                binding: sampler.location,
                array_element: element,
                resource: DescriptorResource::CombinedImageSampler {
                    view: vk::ImageView::null(),
                    layout: vk::ImageLayout::UNDEFINED,
                    sampler: vk::Sampler::null(),
                },
            }));
        }

        Self {
            key: HashedKey::new(PoolKey {
                layout,
                meta: ByIdentity::new(meta),
            }),
            writes,
            buffer_writes,
            image_writes,
            set: None,
            written: false,
        }
    }

    fn meta(&self) -> &ProgramMeta {
        &self.key.key().meta.0
    }

    fn layout(&self) -> vk::DescriptorSetLayout {
        self.key.key().layout
    }

    fn image_write(&mut self, location: u32, index: u32) -> Option<&mut DescriptorResource> {
        debug_assert!(
            self.meta().sampler(location).is_some_and(|s| index < s.array_size),
            "no sampler element {index} at location {location}"
        );
        let first = *self.image_writes.get(&location)?;
        self.written = false;
        self.writes.get_mut(first + index as usize).map(|w| &mut w.resource)
    }

    fn is_complete(&self) -> bool {
        self.writes.iter().all(|write| match write.resource {
            DescriptorResource::UniformBuffer { buffer, .. } => buffer != vk::Buffer::null(),
            DescriptorResource::CombinedImageSampler { view, sampler, .. } => {
                view != vk::ImageView::null() && sampler != vk::Sampler::null()
            }
        })
    }
}

/// Descriptor manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorStats {
    /// Layout pools and their cache activity
    pub pools: CacheStats,
    /// Native pools held by the current slot across all layouts
    pub buckets_in_slot: usize,
    /// Sets allocated over the manager's lifetime
    pub sets_allocated: u64,
    /// Set requests answered by an already written set
    pub sets_reused: u64,
}

/// Accumulates bindings and resolves them into descriptor sets
pub struct DescriptorSetManager<D: RenderDevice> {
    device: Arc<D>,
    pools: ContentAddressedCache<PoolKey, LayoutPool>,
    config: DescriptorPoolConfig,
    frame: u64,
    bound: Option<BoundLayout>,
    sets_allocated: u64,
    sets_reused: u64,
}

impl<D: RenderDevice> DescriptorSetManager<D> {
    /// Create a manager with no pools
    pub fn new(device: Arc<D>, config: &DescriptorPoolConfig) -> Self {
        debug_assert!(config.pool_alloc_base > 0 && config.pool_alloc_factor >= 2);
        Self {
            device,
            pools: ContentAddressedCache::new(config.gc),
            config: *config,
            frame: 0,
            bound: None,
            sets_allocated: 0,
            sets_reused: 0,
        }
    }

    /// Start a new set for `layout`, dropping all previous bindings
    pub fn bind_layout(&mut self, layout: vk::DescriptorSetLayout, meta: Arc<ProgramMeta>) {
        debug_assert!(layout != vk::DescriptorSetLayout::null(), "binding a null set layout");

        let bound = BoundLayout::new(layout, &meta);
        let frame = self.frame;

        if !meta.is_empty() {
            self.pools.get_or_create(bound.key.clone(), |_| {
                let info = meta.binding_info();
                log::debug!("Cache new DescriptorPool: {:?} for layout {:?}", info, layout);

                let mut slots = FrameRing::new(|_| SlotPools::default());
                slots.set_frame(frame);
                LayoutPool {
                    max_buffers: info.uniform_buffers,
                    max_images: info.samplers,
                    slots,
                }
            });
        }

        self.bound = Some(bound);
    }

    /// Bind a uniform buffer range at a uniform block slot
    pub fn bind_uniform_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize, slot: u32) {
        debug_assert!(self.bound.is_some(), "bind_uniform_buffer without a bound layout");
        let Some(bound) = self.bound.as_mut() else {
            return;
        };
        debug_assert!(bound.meta().uniform_block(slot).is_some(), "no uniform block at slot {slot}");

        if let Some(&index) = bound.buffer_writes.get(&slot) {
            bound.writes[index].resource = DescriptorResource::UniformBuffer { buffer, offset, range };
            bound.written = false;
        }
    }

    /// Bind an image view at one element of a sampler location
    pub fn bind_texture(&mut self, view: vk::ImageView, layout: vk::ImageLayout, location: u32, index: u32) {
        debug_assert!(self.bound.is_some(), "bind_texture without a bound layout");
        let Some(resource) = self.bound.as_mut().and_then(|b| b.image_write(location, index)) else {
            return;
        };
        if let DescriptorResource::CombinedImageSampler {
            view: bound_view,
            layout: bound_layout,
            ..
        } = resource
        {
            *bound_view = view;
            *bound_layout = layout;
        }
    }

    /// Bind a sampler at one element of a sampler location
    pub fn bind_sampler(&mut self, sampler: vk::Sampler, location: u32, index: u32) {
        debug_assert!(self.bound.is_some(), "bind_sampler without a bound layout");
        let Some(resource) = self.bound.as_mut().and_then(|b| b.image_write(location, index)) else {
            return;
        };
        if let DescriptorResource::CombinedImageSampler {
            sampler: bound_sampler, ..
        } = resource
        {
            *bound_sampler = sampler;
        }
    }

    /// Descriptor set holding the current bindings
    ///
    /// Returns a null set for layouts without bindings. The set stays valid
    /// until this frame slot is reused.
    pub fn get_or_create_set(&mut self) -> vk::DescriptorSet {
        debug_assert!(self.bound.is_some(), "get_or_create_set without a bound layout");
        let Some(bound) = self.bound.as_mut() else {
            return vk::DescriptorSet::null();
        };

        if bound.writes.is_empty() {
            return vk::DescriptorSet::null();
        }

        if bound.written {
            if let Some(set) = bound.set {
                return set;
            }
        }

        debug_assert!(bound.is_complete(), "descriptor set requested with unbound resources");

        let Some(pool) = self.pools.get(&bound.key) else {
            log::error!("No descriptor pool for layout {:?}", bound.layout());
            return vk::DescriptorSet::null();
        };

        let state = HashedKey::new(bound.writes.clone());
        let realized = pool.slots.current().realized.get(&state).copied();
        let set = if let Some(set) = realized {
            self.sets_reused += 1;
            set
        } else {
            let set = allocate_set(self.device.as_ref(), &self.config, pool, bound.layout());
            self.device.update_descriptor_set(set, &bound.writes);
            pool.slots.current_mut().realized.insert(state, set);
            self.sets_allocated += 1;
            set
        };

        bound.set = Some(set);
        bound.written = true;
        set
    }

    /// Rotate every layout pool to `frame_index` and recycle that slot
    pub fn next_frame(&mut self, frame_index: u64) {
        self.frame = frame_index;
        self.bound = None;

        let device = self.device.as_ref();
        let factor = self.config.pool_alloc_factor;

        for pool in self.pools.values_mut() {
            pool.slots.set_frame(frame_index);
            let (max_buffers, max_images) = (pool.max_buffers, pool.max_images);
            let slot = pool.slots.current_mut();
            slot.realized.clear();

            match slot.buckets.as_mut_slice() {
                [] => {}
                [bucket] => {
                    device
                        .reset_descriptor_pool(bucket.pool)
                        .or_fatal("Failed to reset descriptor pool");
                    bucket.allocated = 0;
                }
                [.., last] => {
                    let size = last.size.saturating_mul(factor);
                    release_buckets(device, &mut slot.buckets);
                    slot.buckets.push(create_bucket(device, size, max_buffers, max_images));
                }
            }
        }
    }

    /// Release pools of layouts that have not been bound recently
    pub fn gc(&mut self) {
        let device = self.device.as_ref();
        self.pools.gc(|key, mut pool| {
            log::debug!("Release DescriptorPool for layout {:?}", key.layout);
            release_pool(device, &mut pool);
        });
    }

    /// Manager counters
    pub fn stats(&self) -> DescriptorStats {
        DescriptorStats {
            pools: self.pools.stats(),
            buckets_in_slot: self.pools.values().map(LayoutPool::bucket_count).sum(),
            sets_allocated: self.sets_allocated,
            sets_reused: self.sets_reused,
        }
    }
}

fn create_bucket<D: RenderDevice>(device: &D, size: u32, max_buffers: u32, max_images: u32) -> Bucket {
    debug_assert!(size > 0);

    let mut sizes = Vec::with_capacity(2);
    if max_buffers > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: size.saturating_mul(max_buffers),
        });
    }
    if max_images > 0 {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: size.saturating_mul(max_images),
        });
    }

    let pool = device
        .create_descriptor_pool(size, &sizes)
        .or_fatal(format_args!("Failed to create descriptor pool of {size} sets"));

    Bucket {
        pool,
        size,
        allocated: 0,
    }
}

fn allocate_set<D: RenderDevice>(
    device: &D,
    config: &DescriptorPoolConfig,
    pool: &mut LayoutPool,
    layout: vk::DescriptorSetLayout,
) -> vk::DescriptorSet {
    let (max_buffers, max_images) = (pool.max_buffers, pool.max_images);
    let buckets = &mut pool.slots.current_mut().buckets;

    let exhausted = buckets.last().map_or(true, |b| b.allocated >= b.size);
    if exhausted {
        let size = buckets
            .last()
            .map_or(config.pool_alloc_base, |b| b.size.saturating_mul(config.pool_alloc_factor));
        buckets.push(create_bucket(device, size, max_buffers, max_images));
    }

    let index = buckets.len() - 1;
    let bucket = &mut buckets[index];
    let set = device
        .allocate_descriptor_set(bucket.pool, layout)
        .or_fatal("Failed to allocate descriptor set");
    bucket.allocated += 1;

    set
}

fn release_buckets<D: RenderDevice>(device: &D, buckets: &mut Vec<Bucket>) {
    for bucket in buckets.drain(..) {
        device.destroy_descriptor_pool(bucket.pool);
    }
}

fn release_pool<D: RenderDevice>(device: &D, pool: &mut LayoutPool) {
    for slot in pool.slots.iter_mut() {
        release_buckets(device, &mut slot.buckets);
        slot.realized.clear();
    }
}

impl<D: RenderDevice> Drop for DescriptorSetManager<D> {
    fn drop(&mut self) {
        let device = self.device.as_ref();
        self.pools.drain(|_, mut pool| release_pool(device, &mut pool));
    }
}
