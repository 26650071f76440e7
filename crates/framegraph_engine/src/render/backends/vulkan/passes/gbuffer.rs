//! Geometry pass filling the G-buffer
//!
//! Same indirect draw as the forward pass, writing world position, normal
//! and albedo into three extent-sized attachments. The attachments leave the
//! pass in `SHADER_READ_ONLY_OPTIMAL` for the shadow and lighting passes.

use ash::{vk, Device};

use super::{
    allocate_slot_sets, begin_rendering, color_attachment, depth_attachment, draw_indirect, wait_for_previous_depth,
    write_whole_buffer,
};
use super::{PassContext, PassSetup, RenderPass, SlotBuffers};
use crate::render::backends::vulkan::rendering::{GraphicsPipelineBuilder, Pipeline};
use crate::render::backends::vulkan::resources::{
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, ImageId, ResourceAllocator,
};
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// World position, w = 1 where geometry was written
pub const POSITION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
/// World normal
pub const NORMAL_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
/// Base color
pub const ALBEDO_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Attachment formats in location order
pub const GBUFFER_FORMATS: [vk::Format; 3] = [POSITION_FORMAT, NORMAL_FORMAT, ALBEDO_FORMAT];

/// The three G-buffer attachments
#[derive(Debug, Clone, Copy)]
pub struct GBuffer {
    /// Location 0
    pub position: ImageId,
    /// Location 1
    pub normal: ImageId,
    /// Location 2
    pub albedo: ImageId,
}

impl GBuffer {
    fn create(allocator: &mut ResourceAllocator, extent: vk::Extent2D) -> Self {
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
        let mut target = |format, name| allocator.create_image(extent, format, usage, vk::ImageAspectFlags::COLOR, 1, name);
        Self {
            position: target(POSITION_FORMAT, "gbuffer position"),
            normal: target(NORMAL_FORMAT, "gbuffer normal"),
            albedo: target(ALBEDO_FORMAT, "gbuffer albedo"),
        }
    }

    fn ids(&self) -> [ImageId; 3] {
        [self.position, self.normal, self.albedo]
    }

    /// `(image, view)` of every attachment in location order
    pub fn targets(&self, allocator: &ResourceAllocator) -> VulkanResult<[(vk::Image, vk::ImageView); 3]> {
        let mut out = [(vk::Image::null(), vk::ImageView::null()); 3];
        for (slot, id) in out.iter_mut().zip(self.ids()) {
            let image = allocator
                .image(id)
                .ok_or_else(|| VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() })?;
            *slot = (image.image, image.view);
        }
        Ok(out)
    }

    fn destroy(&self, allocator: &mut ResourceAllocator) {
        for id in self.ids() {
            allocator.destroy_image(id);
        }
    }
}

/// Indirect geometry draw into the G-buffer
pub struct GBufferPass {
    pipeline: Pipeline,
    _layout: DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
    gbuffer: Option<GBuffer>,
}

impl GBufferPass {
    /// Build the pipeline and the attachments for the current extent
    pub fn new(setup: &mut PassSetup<'_>) -> VulkanResult<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(1, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(2, vk::ShaderStageFlags::VERTEX)
            .build(&setup.device)?;

        let vs = setup.load_shader(&setup.shaders.gbuffer_vertex)?;
        let fs = setup.load_shader(&setup.shaders.gbuffer_fragment)?;
        let pipeline = GraphicsPipelineBuilder::new(&vs, &fs)
            .vertex_layout(setup.vertex_layout)
            .color_formats(&GBUFFER_FORMATS)
            .depth(setup.depth_format)
            .cull_mode(vk::CullModeFlags::BACK)
            .set_layouts(&[layout.handle()])
            .build(&setup.device)?;

        let sets = allocate_slot_sets(setup.descriptors, layout.handle(), setup.slot_count);
        let gbuffer = GBuffer::create(setup.allocator, setup.extent);
        log::info!("G-buffer pass ready ({}x{})", setup.extent.width, setup.extent.height);
        Ok(Self {
            pipeline,
            _layout: layout,
            sets,
            gbuffer: Some(gbuffer),
        })
    }

    /// Current attachments
    pub fn gbuffer(&self) -> Option<GBuffer> {
        self.gbuffer
    }

    fn transition(ctx: &PassContext<'_>, targets: &[(vk::Image, vk::ImageView); 3], to_attachment: bool) {
        let (old, new, src_access, dst_access, src_stage, dst_stage) = if to_attachment {
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )
        } else {
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            )
        };
        let barriers: Vec<_> = targets
            .iter()
            .map(|&(image, _)| image_barrier(image, vk::ImageAspectFlags::COLOR, old, new, src_access, dst_access))
            .collect();
        pipeline_barrier(ctx.device, ctx.cmd, src_stage, dst_stage, &[], &barriers);
    }
}

impl RenderPass for GBufferPass {
    fn name(&self) -> &'static str {
        "gbuffer"
    }

    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        let mut writer = DescriptorWriter::new();
        write_whole_buffer(&mut writer, allocator, 0, buffers.scene, vk::DescriptorType::UNIFORM_BUFFER);
        write_whole_buffer(&mut writer, allocator, 1, buffers.objects, vk::DescriptorType::STORAGE_BUFFER);
        write_whole_buffer(&mut writer, allocator, 2, buffers.instance_to_object, vk::DescriptorType::STORAGE_BUFFER);
        writer.update_set(device, self.sets[slot]);
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        let gbuffer = self
            .gbuffer
            .ok_or_else(|| VulkanError::InvalidOperation { reason: "G-buffer recorded after cleanup".to_string() })?;
        let targets = gbuffer.targets(ctx.allocator)?;

        Self::transition(ctx, &targets, true);
        let colors = targets.map(|(_, view)| color_attachment(view, Some([0.0; 4])));
        wait_for_previous_depth(ctx);
        let depth = depth_attachment(ctx.depth_target.1);
        begin_rendering(ctx.device, ctx.cmd, ctx.extent, &colors, Some(&depth));

        self.pipeline.bind(ctx.cmd, &[self.sets[ctx.slot]]);
        ctx.mesh_buffers.bind(ctx.device, ctx.allocator, ctx.cmd);
        draw_indirect(ctx);

        unsafe { ctx.device.cmd_end_rendering(ctx.cmd) };
        Self::transition(ctx, &targets, false);
        Ok(())
    }

    fn resize(&mut self, setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        if let Some(old) = self.gbuffer.take() {
            old.destroy(setup.allocator);
        }
        self.gbuffer = Some(GBuffer::create(setup.allocator, setup.extent));
        log::debug!("G-buffer resized to {}x{}", setup.extent.width, setup.extent.height);
        Ok(())
    }

    fn cleanup(&mut self, allocator: &mut ResourceAllocator) {
        if let Some(gbuffer) = self.gbuffer.take() {
            gbuffer.destroy(allocator);
        }
    }
}
