//! Descriptor layouts, growable pool allocation and batched writes
//!
//! Descriptor sets are Vulkan's mechanism for binding buffers, images and
//! acceleration structures to shaders. This module provides:
//!
//! - [`DescriptorSetLayoutBuilder`]: ordered bindings to an RAII layout. An
//!   empty binding list yields a null layout, which pipeline layouts accept
//!   as "no set here".
//! - [`DescriptorAllocator`]: a list of fixed-size pools split into ready and
//!   full. When a pool runs out it is retired, a larger one (1.5x, capped at
//!   [`MAX_DESCRIPTOR_SETS_PER_POOL`]) is created and the allocation retried
//!   once. A second failure aborts.
//! - [`DescriptorWriter`]: pending writes keyed by binding, flushed into a set
//!   in a single `vkUpdateDescriptorSets` call.

use ash::{vk, Device};
use std::collections::BTreeMap;

use crate::core::config::{DescriptorConfig, DescriptorKind, PoolSizeRatio, MAX_DESCRIPTOR_SETS_PER_POOL};
use crate::foundation::logging::fatal;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Vulkan descriptor type for a config descriptor kind
pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

/// Per-type descriptor counts for a pool of `max_sets` sets
pub fn pool_sizes(ratios: &[PoolSizeRatio], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| vk::DescriptorPoolSize {
            ty: descriptor_type(r.kind),
            descriptor_count: (r.ratio * max_sets as f32).ceil().max(1.0) as u32,
        })
        .collect()
}

/// Set capacity of the pool created after one of `current` sets
pub fn next_pool_size(current: u32, cap: u32) -> u32 {
    ((current as f32 * 1.5) as u32).min(cap).max(1)
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding of any type
    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    /// Add a combined image sampler binding
    pub fn add_combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags)
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }

    /// Add a top-level acceleration structure binding
    pub fn add_acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, stage_flags)
    }

    /// Bindings added so far
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        if self.bindings.is_empty() {
            return Ok(DescriptorSetLayout {
                layout: vk::DescriptorSetLayout::null(),
                device: device.clone(),
                bindings: self.bindings,
            });
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// True for the layout of an empty binding list
    pub fn is_null(&self) -> bool {
        self.layout == vk::DescriptorSetLayout::null()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if !self.is_null() {
            unsafe {
                self.device.destroy_descriptor_set_layout(self.layout, None);
            }
        }
    }
}

/// Growable descriptor pool allocator
pub struct DescriptorAllocator {
    device: Device,
    ratios: Vec<PoolSizeRatio>,
    ready: Vec<vk::DescriptorPool>,
    full: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
    max_sets_per_pool: u32,
}

impl DescriptorAllocator {
    /// Create the allocator with one pool of `config.initial_sets_per_pool` sets
    pub fn init(device: Device, config: &DescriptorConfig) -> VulkanResult<Self> {
        let cap = config.max_sets_per_pool.min(MAX_DESCRIPTOR_SETS_PER_POOL);
        let initial = config.initial_sets_per_pool.clamp(1, cap);
        let mut allocator = Self {
            device,
            ratios: config.ratios.clone(),
            ready: Vec::new(),
            full: Vec::new(),
            sets_per_pool: initial,
            max_sets_per_pool: cap,
        };
        let first = allocator.create_pool(initial)?;
        allocator.sets_per_pool = next_pool_size(initial, cap);
        allocator.ready.push(first);
        Ok(allocator)
    }

    fn create_pool(&self, max_sets: u32) -> VulkanResult<vk::DescriptorPool> {
        let sizes = pool_sizes(&self.ratios, max_sets);
        let pool_info = vk::DescriptorPoolCreateInfo::builder().max_sets(max_sets).pool_sizes(&sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }.map_err(VulkanError::Api)?;
        log::debug!("Created descriptor pool for {} sets", max_sets);
        Ok(pool)
    }

    fn get_pool(&mut self) -> vk::DescriptorPool {
        if let Some(pool) = self.ready.pop() {
            return pool;
        }
        let sets = self.sets_per_pool;
        let pool = self
            .create_pool(sets)
            .unwrap_or_else(|e| fatal(format!("descriptor pool creation failed: {e}")));
        self.sets_per_pool = next_pool_size(sets, self.max_sets_per_pool);
        pool
    }

    fn try_allocate(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map(|sets| sets[0])
    }

    /// Allocate one set; retries once in a fresh pool, then aborts
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> vk::DescriptorSet {
        let mut pool = self.get_pool();
        let set = match self.try_allocate(pool, layout) {
            Ok(set) => set,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.full.push(pool);
                pool = self.get_pool();
                self.try_allocate(pool, layout)
                    .unwrap_or_else(|e| fatal(format!("descriptor set allocation failed after pool growth: {e:?}")))
            }
            Err(e) => fatal(format!("descriptor set allocation failed: {e:?}")),
        };
        self.ready.push(pool);
        set
    }

    /// Reset every pool; all sets allocated so far become invalid
    pub fn clear_pools(&mut self) -> VulkanResult<()> {
        for &pool in self.ready.iter().chain(self.full.iter()) {
            unsafe {
                self.device
                    .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(VulkanError::Api)?;
            }
        }
        self.ready.append(&mut self.full);
        Ok(())
    }

    /// Destroy every pool
    pub fn destroy_pools(&mut self) {
        for pool in self.ready.drain(..).chain(self.full.drain(..)) {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
    }

    /// Pools with room left
    pub fn ready_pool_count(&self) -> usize {
        self.ready.len()
    }

    /// Exhausted pools
    pub fn full_pool_count(&self) -> usize {
        self.full.len()
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        self.destroy_pools();
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingWrite {
    Buffer(vk::DescriptorType, vk::DescriptorBufferInfo),
    Image(vk::DescriptorType, vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl PendingWrite {
    fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Buffer(ty, _) | Self::Image(ty, _) => *ty,
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

/// Pending descriptor writes keyed by binding
///
/// A later write to a binding replaces the earlier one.
#[derive(Debug, Default)]
pub struct DescriptorWriter {
    pending: BTreeMap<u32, PendingWrite>,
}

impl DescriptorWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a uniform or storage buffer write
    pub fn write_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize, ty: vk::DescriptorType) -> &mut Self {
        let info = vk::DescriptorBufferInfo { buffer, offset, range };
        self.pending.insert(binding, PendingWrite::Buffer(ty, info));
        self
    }

    /// Queue a sampled or storage image write
    pub fn write_image(
        &mut self,
        binding: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        let info = vk::DescriptorImageInfo {
            sampler,
            image_view,
            image_layout: layout,
        };
        self.pending.insert(binding, PendingWrite::Image(ty, info));
        self
    }

    /// Queue a top-level acceleration structure write
    pub fn write_acceleration_structure(&mut self, binding: u32, tlas: vk::AccelerationStructureKHR) -> &mut Self {
        self.pending.insert(binding, PendingWrite::AccelerationStructure(tlas));
        self
    }

    /// Bindings and types waiting to be written
    pub fn pending_bindings(&self) -> Vec<(u32, vk::DescriptorType)> {
        self.pending.iter().map(|(&b, w)| (b, w.descriptor_type())).collect()
    }

    /// Drop all pending writes
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Apply every pending write to `set` in one call, then clear
    pub fn update_set(&mut self, device: &Device, set: vk::DescriptorSet) {
        if self.pending.is_empty() {
            return;
        }

        // Info arrays are filled completely before any pointer into them is taken
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut tlas_handles = Vec::new();
        for write in self.pending.values() {
            match write {
                PendingWrite::Buffer(_, info) => buffer_infos.push(*info),
                PendingWrite::Image(_, info) => image_infos.push(*info),
                PendingWrite::AccelerationStructure(handle) => tlas_handles.push(*handle),
            }
        }
        let mut as_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = tlas_handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(std::slice::from_ref(handle))
                    .build()
            })
            .collect();

        let (mut b, mut i, mut a) = (0, 0, 0);
        let mut writes = Vec::with_capacity(self.pending.len());
        for (&binding, write) in &self.pending {
            let base = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .dst_array_element(0)
                .descriptor_type(write.descriptor_type());
            let built = match write {
                PendingWrite::Buffer(..) => {
                    b += 1;
                    base.buffer_info(&buffer_infos[b - 1..b]).build()
                }
                PendingWrite::Image(..) => {
                    i += 1;
                    base.image_info(&image_infos[i - 1..i]).build()
                }
                PendingWrite::AccelerationStructure(_) => {
                    a += 1;
                    let mut w = base.push_next(&mut as_writes[a - 1]).build();
                    w.descriptor_count = 1;
                    w
                }
            };
            writes.push(built);
        }

        unsafe { device.update_descriptor_sets(&writes, &[]) };
        log::trace!("Updated {} descriptor bindings", writes.len());
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_use_ceiling_of_ratio() {
        let ratios = [
            PoolSizeRatio::new(DescriptorKind::StorageBuffer, 2.5),
            PoolSizeRatio::new(DescriptorKind::UniformBuffer, 0.1),
            PoolSizeRatio::new(DescriptorKind::StorageImage, 1.0),
        ];
        let sizes = pool_sizes(&ratios, 10);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 25);
        assert_eq!(sizes[1].descriptor_count, 1);
        assert_eq!(sizes[2].descriptor_count, 10);

        let sizes = pool_sizes(&ratios[1..2], 15);
        assert_eq!(sizes[0].descriptor_count, 2);
    }

    #[test]
    fn test_pool_growth_is_capped() {
        assert_eq!(next_pool_size(64, MAX_DESCRIPTOR_SETS_PER_POOL), 96);
        assert_eq!(next_pool_size(96, MAX_DESCRIPTOR_SETS_PER_POOL), 144);
        assert_eq!(next_pool_size(3000, MAX_DESCRIPTOR_SETS_PER_POOL), MAX_DESCRIPTOR_SETS_PER_POOL);
        assert_eq!(next_pool_size(MAX_DESCRIPTOR_SETS_PER_POOL, MAX_DESCRIPTOR_SETS_PER_POOL), MAX_DESCRIPTOR_SETS_PER_POOL);
    }

    #[test]
    fn test_writer_later_write_replaces_binding() {
        let mut writer = DescriptorWriter::new();
        writer
            .write_buffer(2, vk::Buffer::null(), 0, 64, vk::DescriptorType::UNIFORM_BUFFER)
            .write_buffer(0, vk::Buffer::null(), 0, 16, vk::DescriptorType::STORAGE_BUFFER)
            .write_image(
                2,
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::GENERAL,
                vk::DescriptorType::STORAGE_IMAGE,
            );

        assert_eq!(
            writer.pending_bindings(),
            vec![(0, vk::DescriptorType::STORAGE_BUFFER), (2, vk::DescriptorType::STORAGE_IMAGE)]
        );

        writer.write_acceleration_structure(0, vk::AccelerationStructureKHR::null());
        assert_eq!(writer.pending_bindings()[0].1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);

        writer.clear();
        assert!(writer.pending_bindings().is_empty());
    }

    #[test]
    fn test_descriptor_kind_mapping() {
        assert_eq!(descriptor_type(DescriptorKind::CombinedImageSampler), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(
            descriptor_type(DescriptorKind::AccelerationStructure),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }
}
