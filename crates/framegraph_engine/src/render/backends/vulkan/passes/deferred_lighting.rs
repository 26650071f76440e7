//! Fullscreen lighting over the G-buffer
//!
//! A single triangle generated in the vertex shader covers the screen; the
//! fragment shader shades every pixel from the G-buffer, the light buffer
//! and the shadow mask. Without ray-traced shadows the mask binding points
//! at a 1x1 texel cleared to fully lit.

use ash::{vk, Device};

use super::gbuffer::GBuffer;
use super::{allocate_slot_sets, begin_rendering, color_attachment, write_whole_buffer};
use super::{PassContext, PassSetup, RenderPass, Sampler, SlotBuffers};
use crate::render::backends::vulkan::rendering::{GraphicsPipelineBuilder, Pipeline};
use crate::render::backends::vulkan::resources::{
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, ImageId, QueueType, ResourceAllocator,
};
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

const BINDING_SCENE: u32 = 0;
const BINDING_LIGHTS: u32 = 1;
const BINDING_POSITION: u32 = 2;
const BINDING_NORMAL: u32 = 3;
const BINDING_ALBEDO: u32 = 4;
const BINDING_SHADOW: u32 = 5;

/// Fullscreen shading pass writing the swapchain image
pub struct DeferredLightingPass {
    device: Device,
    pipeline: Pipeline,
    _layout: DescriptorSetLayout,
    sampler: Sampler,
    sets: Vec<vk::DescriptorSet>,
    unshadowed: Option<ImageId>,
}

impl DeferredLightingPass {
    /// Build the pipeline and the fallback shadow texel
    pub fn new(setup: &mut PassSetup<'_>) -> VulkanResult<Self> {
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(BINDING_SCENE, fragment)
            .add_storage_buffer(BINDING_LIGHTS, fragment)
            .add_combined_image_sampler(BINDING_POSITION, fragment)
            .add_combined_image_sampler(BINDING_NORMAL, fragment)
            .add_combined_image_sampler(BINDING_ALBEDO, fragment)
            .add_combined_image_sampler(BINDING_SHADOW, fragment)
            .build(&setup.device)?;

        let vs = setup.load_shader(&setup.shaders.fullscreen_vertex)?;
        let fs = setup.load_shader(&setup.shaders.lighting_fragment)?;
        let pipeline = GraphicsPipelineBuilder::new(&vs, &fs)
            .color_formats(&[setup.color_format])
            .cull_mode(vk::CullModeFlags::NONE)
            .set_layouts(&[layout.handle()])
            .build(&setup.device)?;

        let sampler = Sampler::new(&setup.device, vk::Filter::NEAREST)?;
        let sets = allocate_slot_sets(setup.descriptors, layout.handle(), setup.slot_count);
        let unshadowed = create_unshadowed_texel(setup.allocator)?;

        let mut pass = Self {
            device: setup.device.clone(),
            pipeline,
            _layout: layout,
            sampler,
            sets,
            unshadowed: Some(unshadowed),
        };
        let view = setup.allocator.image(unshadowed).map(|img| img.view).unwrap_or_default();
        pass.link_shadow_mask(view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        log::info!("Deferred lighting pass ready");
        Ok(pass)
    }

    /// Point every slot at the G-buffer attachments
    pub fn link_gbuffer(&mut self, allocator: &ResourceAllocator, gbuffer: &GBuffer) -> VulkanResult<()> {
        let [position, normal, albedo] = gbuffer.targets(allocator)?;
        let layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        let ty = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let mut writer = DescriptorWriter::new();
        for &set in &self.sets {
            writer
                .write_image(BINDING_POSITION, position.1, self.sampler.handle(), layout, ty)
                .write_image(BINDING_NORMAL, normal.1, self.sampler.handle(), layout, ty)
                .write_image(BINDING_ALBEDO, albedo.1, self.sampler.handle(), layout, ty);
            writer.update_set(&self.device, set);
        }
        Ok(())
    }

    /// Point every slot at a shadow mask view in `layout`
    pub fn link_shadow_mask(&mut self, view: vk::ImageView, layout: vk::ImageLayout) {
        let mut writer = DescriptorWriter::new();
        for &set in &self.sets {
            writer.write_image(BINDING_SHADOW, view, self.sampler.handle(), layout, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            writer.update_set(&self.device, set);
        }
    }
}

fn create_unshadowed_texel(allocator: &mut ResourceAllocator) -> VulkanResult<ImageId> {
    let id = allocator.create_image(
        vk::Extent2D { width: 1, height: 1 },
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageAspectFlags::COLOR,
        1,
        "unshadowed texel",
    );
    let image = allocator
        .image(id)
        .map(|img| img.image)
        .ok_or_else(|| VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() })?;

    allocator.immediate_submit(QueueType::Graphics, |device, cmd| {
        let to_transfer = image_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );
        pipeline_barrier(device, cmd, vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER, &[], &[to_transfer]);

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let lit = vk::ClearColorValue { float32: [1.0; 4] };
        unsafe { device.cmd_clear_color_image(cmd, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &lit, &[range]) };

        let to_read = image_barrier(
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        pipeline_barrier(device, cmd, vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::FRAGMENT_SHADER, &[], &[to_read]);
    })?;
    Ok(id)
}

impl RenderPass for DeferredLightingPass {
    fn name(&self) -> &'static str {
        "deferred lighting"
    }

    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        let mut writer = DescriptorWriter::new();
        write_whole_buffer(&mut writer, allocator, BINDING_SCENE, buffers.scene, vk::DescriptorType::UNIFORM_BUFFER);
        write_whole_buffer(&mut writer, allocator, BINDING_LIGHTS, buffers.lights, vk::DescriptorType::STORAGE_BUFFER);
        writer.update_set(device, self.sets[slot]);
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        let colors = [color_attachment(ctx.color_target.1, Some(ctx.clear_color))];
        begin_rendering(ctx.device, ctx.cmd, ctx.extent, &colors, None);
        self.pipeline.bind(ctx.cmd, &[self.sets[ctx.slot]]);
        unsafe {
            ctx.device.cmd_draw(ctx.cmd, 3, 1, 0, 0);
            ctx.device.cmd_end_rendering(ctx.cmd);
        }
        Ok(())
    }

    fn cleanup(&mut self, allocator: &mut ResourceAllocator) {
        if let Some(id) = self.unshadowed.take() {
            allocator.destroy_image(id);
        }
    }
}
