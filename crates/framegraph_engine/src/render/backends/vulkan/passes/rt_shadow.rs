//! Ray-query shadow mask
//!
//! One compute invocation per pixel reads the G-buffer world position and
//! traces a ray toward the primary directional light through the slot's
//! top-level acceleration structure. The mask stores 1.0 for lit and 0.0 for
//! occluded pixels and stays in `GENERAL` for its whole life.

use ash::{vk, Device};

use super::gbuffer::GBuffer;
use super::{allocate_slot_sets, write_whole_buffer, PassContext, PassSetup, RenderPass, Sampler, SlotBuffers};
use crate::render::backends::vulkan::rendering::{create_compute_pipeline, Pipeline};
use crate::render::backends::vulkan::resources::{
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, ImageId, QueueType, ResourceAllocator,
};
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Mask format; guaranteed for storage images on every Vulkan device
pub const SHADOW_MASK_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

/// Local size (per axis) of the shadow compute shader
pub const SHADOW_GROUP_SIZE: u32 = 8;

const BINDING_TLAS: u32 = 0;
const BINDING_POSITION: u32 = 1;
const BINDING_LIGHTS: u32 = 2;
const BINDING_SCENE: u32 = 3;
const BINDING_MASK: u32 = 4;

/// Workgroups covering `extent`
pub fn shadow_group_count(extent: vk::Extent2D) -> (u32, u32) {
    (extent.width.div_ceil(SHADOW_GROUP_SIZE), extent.height.div_ceil(SHADOW_GROUP_SIZE))
}

/// Shadow mask dispatch against per-slot TLASes
pub struct RtShadowPass {
    device: Device,
    pipeline: Pipeline,
    _layout: DescriptorSetLayout,
    sampler: Sampler,
    sets: Vec<vk::DescriptorSet>,
    linked_tlas: Vec<vk::AccelerationStructureKHR>,
    mask: Option<ImageId>,
}

impl RtShadowPass {
    /// Build the pipeline and a mask for the current extent
    pub fn new(setup: &mut PassSetup<'_>) -> VulkanResult<Self> {
        let compute = vk::ShaderStageFlags::COMPUTE;
        let layout = DescriptorSetLayoutBuilder::new()
            .add_acceleration_structure(BINDING_TLAS, compute)
            .add_combined_image_sampler(BINDING_POSITION, compute)
            .add_storage_buffer(BINDING_LIGHTS, compute)
            .add_uniform_buffer(BINDING_SCENE, compute)
            .add_storage_image(BINDING_MASK, compute)
            .build(&setup.device)?;

        let shader = setup.load_shader(&setup.shaders.shadow_compute)?;
        let pipeline = create_compute_pipeline(&setup.device, &shader, &[layout.handle()], 0)?;
        let sampler = Sampler::new(&setup.device, vk::Filter::NEAREST)?;
        let sets = allocate_slot_sets(setup.descriptors, layout.handle(), setup.slot_count);

        let mut pass = Self {
            device: setup.device.clone(),
            pipeline,
            _layout: layout,
            sampler,
            linked_tlas: vec![vk::AccelerationStructureKHR::null(); sets.len()],
            sets,
            mask: None,
        };
        pass.create_mask(setup)?;
        log::info!("Ray traced shadow pass ready");
        Ok(pass)
    }

    fn create_mask(&mut self, setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        if let Some(old) = self.mask.take() {
            setup.allocator.destroy_image(old);
        }
        let id = setup.allocator.create_image(
            setup.extent,
            SHADOW_MASK_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            1,
            "shadow mask",
        );
        let (image, view) = setup
            .allocator
            .image(id)
            .map(|img| (img.image, img.view))
            .ok_or_else(|| VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() })?;

        setup.allocator.immediate_submit(QueueType::Graphics, |device, cmd| {
            let barrier = image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_WRITE,
            );
            pipeline_barrier(device, cmd, vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::COMPUTE_SHADER, &[], &[barrier]);
        })?;

        let mut writer = DescriptorWriter::new();
        for &set in &self.sets {
            writer.write_image(BINDING_MASK, view, vk::Sampler::null(), vk::ImageLayout::GENERAL, vk::DescriptorType::STORAGE_IMAGE);
            writer.update_set(&self.device, set);
        }
        self.mask = Some(id);
        Ok(())
    }

    /// Mask view for the lighting pass (layout `GENERAL`)
    pub fn mask_view(&self, allocator: &ResourceAllocator) -> Option<vk::ImageView> {
        self.mask.and_then(|id| allocator.image(id)).map(|img| img.view)
    }

    /// Point the slot at its top-level structure; no-op when unchanged
    pub fn link_tlas(&mut self, slot: usize, tlas: vk::AccelerationStructureKHR) {
        if self.linked_tlas[slot] == tlas {
            return;
        }
        let mut writer = DescriptorWriter::new();
        writer.write_acceleration_structure(BINDING_TLAS, tlas);
        writer.update_set(&self.device, self.sets[slot]);
        self.linked_tlas[slot] = tlas;
        log::debug!("Slot {} shadow pass linked to TLAS {:?}", slot, tlas);
    }

    /// Point every slot at the G-buffer position attachment
    pub fn link_gbuffer(&mut self, allocator: &ResourceAllocator, gbuffer: &GBuffer) -> VulkanResult<()> {
        let [position, _, _] = gbuffer.targets(allocator)?;
        let mut writer = DescriptorWriter::new();
        for &set in &self.sets {
            writer.write_image(
                BINDING_POSITION,
                position.1,
                self.sampler.handle(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            );
            writer.update_set(&self.device, set);
        }
        Ok(())
    }
}

impl RenderPass for RtShadowPass {
    fn name(&self) -> &'static str {
        "ray traced shadows"
    }

    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        let mut writer = DescriptorWriter::new();
        write_whole_buffer(&mut writer, allocator, BINDING_LIGHTS, buffers.lights, vk::DescriptorType::STORAGE_BUFFER);
        write_whole_buffer(&mut writer, allocator, BINDING_SCENE, buffers.scene, vk::DescriptorType::UNIFORM_BUFFER);
        writer.update_set(device, self.sets[slot]);
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        if self.linked_tlas[ctx.slot] == vk::AccelerationStructureKHR::null() {
            log::warn!("Shadow pass skipped: slot {} has no TLAS", ctx.slot);
            return Ok(());
        }
        let Some(mask) = self.mask.and_then(|id| ctx.allocator.image(id)) else {
            return Err(VulkanError::InvalidOperation { reason: "shadow mask recorded after cleanup".to_string() });
        };

        let write_after_read = image_barrier(
            mask.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::SHADER_WRITE,
        );
        pipeline_barrier(
            ctx.device,
            ctx.cmd,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            &[],
            &[write_after_read],
        );

        self.pipeline.bind(ctx.cmd, &[self.sets[ctx.slot]]);
        let (gx, gy) = shadow_group_count(ctx.extent);
        unsafe { ctx.device.cmd_dispatch(ctx.cmd, gx, gy, 1) };

        let mask_written = image_barrier(
            mask.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        pipeline_barrier(
            ctx.device,
            ctx.cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[],
            &[mask_written],
        );
        Ok(())
    }

    fn resize(&mut self, setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        self.create_mask(setup)
    }

    fn cleanup(&mut self, allocator: &mut ResourceAllocator) {
        if let Some(id) = self.mask.take() {
            allocator.destroy_image(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_groups_cover_extent() {
        assert_eq!(shadow_group_count(vk::Extent2D { width: 800, height: 600 }), (100, 75));
        assert_eq!(shadow_group_count(vk::Extent2D { width: 801, height: 1 }), (101, 1));
    }
}
