//! Forward shading straight into the swapchain image
//!
//! One indirect draw over the culled command buffer. The vertex shader looks
//! up its object through `instance_to_object[gl_InstanceIndex]`.

use ash::{vk, Device};

use super::{
    allocate_slot_sets, begin_rendering, color_attachment, depth_attachment, draw_indirect, wait_for_previous_depth,
    write_whole_buffer,
};
use super::{PassContext, PassSetup, RenderPass, SlotBuffers};
use crate::render::backends::vulkan::rendering::{GraphicsPipelineBuilder, Pipeline};
use crate::render::backends::vulkan::resources::{DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, ResourceAllocator};
use crate::render::backends::vulkan::VulkanResult;

/// Lit meshes drawn from the indirect command buffer
pub struct ForwardPass {
    pipeline: Pipeline,
    layout: DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
}

impl ForwardPass {
    /// Build the pipeline against the swapchain color and depth formats
    pub fn new(setup: &mut PassSetup<'_>) -> VulkanResult<Self> {
        let vertex = vk::ShaderStageFlags::VERTEX;
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vertex | vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(1, vertex)
            .add_storage_buffer(2, vk::ShaderStageFlags::FRAGMENT)
            .add_storage_buffer(3, vertex)
            .build(&setup.device)?;

        let vs = setup.load_shader(&setup.shaders.forward_vertex)?;
        let fs = setup.load_shader(&setup.shaders.forward_fragment)?;
        let pipeline = GraphicsPipelineBuilder::new(&vs, &fs)
            .vertex_layout(setup.vertex_layout)
            .color_formats(&[setup.color_format])
            .depth(setup.depth_format)
            .cull_mode(vk::CullModeFlags::BACK)
            .set_layouts(&[layout.handle()])
            .build(&setup.device)?;

        let sets = allocate_slot_sets(setup.descriptors, layout.handle(), setup.slot_count);
        log::info!("Forward pass ready ({:?})", setup.color_format);
        Ok(Self { pipeline, layout, sets })
    }

    /// Set layout shared with the pipeline
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }
}

impl RenderPass for ForwardPass {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let mut writer = DescriptorWriter::new();
        write_whole_buffer(&mut writer, allocator, 0, buffers.scene, vk::DescriptorType::UNIFORM_BUFFER);
        write_whole_buffer(&mut writer, allocator, 1, buffers.objects, storage);
        write_whole_buffer(&mut writer, allocator, 2, buffers.lights, storage);
        write_whole_buffer(&mut writer, allocator, 3, buffers.instance_to_object, storage);
        writer.update_set(device, self.sets[slot]);
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        let colors = [color_attachment(ctx.color_target.1, Some(ctx.clear_color))];
        wait_for_previous_depth(ctx);
        let depth = depth_attachment(ctx.depth_target.1);
        begin_rendering(ctx.device, ctx.cmd, ctx.extent, &colors, Some(&depth));

        self.pipeline.bind(ctx.cmd, &[self.sets[ctx.slot]]);
        ctx.mesh_buffers.bind(ctx.device, ctx.allocator, ctx.cmd);
        draw_indirect(ctx);

        unsafe { ctx.device.cmd_end_rendering(ctx.cmd) };
        Ok(())
    }
}
