//! Render pass set
//!
//! Each pass owns its descriptor layouts, one descriptor set per frame slot,
//! its pipeline and any extent-dependent images. The renderer decides the
//! order and records the barriers between passes:
//!
//! ```text
//! forward:  reset draws -> cull -> forward
//! deferred: reset draws -> cull -> gbuffer -> [shadow] -> lighting
//! ```
//!
//! Whenever a buffer a pass reads is reallocated the renderer relinks it
//! through [`RenderPass::link_slot`] (or a pass-specific `link_*` call).

use ash::{vk, Device};

use crate::core::config::ShaderConfig;
use crate::render::backends::vulkan::mesh_buffers::MeshBuffers;
use crate::render::backends::vulkan::rendering::ShaderModule;
use crate::render::backends::vulkan::resources::{BufferId, DescriptorAllocator, DescriptorWriter, ResourceAllocator};
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::mesh_bank::VertexLayout;

pub mod culling;
pub mod deferred_lighting;
pub mod draw_buffers;
pub mod forward;
pub mod gbuffer;
pub mod rt_shadow;

pub use culling::CullingPass;
pub use deferred_lighting::DeferredLightingPass;
pub use draw_buffers::DrawBuffers;
pub use forward::ForwardPass;
pub use gbuffer::{GBuffer, GBufferPass};
pub use rt_shadow::RtShadowPass;

/// What a pass needs to build or rebuild its GPU state
pub struct PassSetup<'a> {
    /// Logical device
    pub device: Device,
    /// Buffer and image owner
    pub allocator: &'a mut ResourceAllocator,
    /// Descriptor pools
    pub descriptors: &'a mut DescriptorAllocator,
    /// Shader file locations
    pub shaders: &'a ShaderConfig,
    /// Frames in flight
    pub slot_count: usize,
    /// Swapchain extent
    pub extent: vk::Extent2D,
    /// Swapchain color format
    pub color_format: vk::Format,
    /// Depth attachment format
    pub depth_format: vk::Format,
    /// Depth attachment view
    pub depth_view: vk::ImageView,
    /// Vertex layout of the mesh bank
    pub vertex_layout: &'a VertexLayout,
}

impl PassSetup<'_> {
    /// Load one SPIR-V file from the shader directory
    pub fn load_shader(&self, file: &str) -> VulkanResult<ShaderModule> {
        ShaderModule::from_file(&self.device, self.shaders.path(file))
    }
}

/// Buffers bound for one frame slot
#[derive(Debug, Clone, Copy)]
pub struct SlotBuffers {
    /// `ObjectData` records
    pub objects: BufferId,
    /// `SceneUniforms` block
    pub scene: BufferId,
    /// `LightData` records
    pub lights: BufferId,
    /// Working indirect commands
    pub commands: BufferId,
    /// Instance-to-object indices
    pub instance_to_object: BufferId,
    /// `GpuMeshInfo` records
    pub mesh_info: BufferId,
}

/// Everything a pass reads while recording one frame
pub struct PassContext<'a> {
    /// Logical device
    pub device: &'a Device,
    /// Buffer and image owner
    pub allocator: &'a ResourceAllocator,
    /// Command buffer being recorded
    pub cmd: vk::CommandBuffer,
    /// Frame slot
    pub slot: usize,
    /// Render extent
    pub extent: vk::Extent2D,
    /// Swapchain image and view for this frame
    pub color_target: (vk::Image, vk::ImageView),
    /// Depth attachment image and view
    pub depth_target: (vk::Image, vk::ImageView),
    /// Previous frame's depth is usable for occlusion
    pub history_valid: bool,
    /// Objects in this frame's object buffer
    pub object_count: u32,
    /// Slot's working indirect command buffer
    pub commands: BufferId,
    /// Indirect commands in the working buffer
    pub command_count: u32,
    /// Shared vertex/index buffers
    pub mesh_buffers: &'a MeshBuffers,
    /// Clear color for the swapchain image
    pub clear_color: [f32; 4],
}

/// Common pass lifecycle
pub trait RenderPass {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Point the slot's descriptor set at the slot's buffers
    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers);

    /// Record this pass into `ctx.cmd`
    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()>;

    /// Rebuild extent-dependent resources
    fn resize(&mut self, _setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        Ok(())
    }

    /// Release images and buffers owned through the allocator
    fn cleanup(&mut self, _allocator: &mut ResourceAllocator) {}
}

/// Clamp-to-edge sampler without mip filtering
pub struct Sampler {
    device: Device,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Create with the same min/mag filter
    pub fn new(device: &Device, filter: vk::Filter) -> VulkanResult<Self> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&info, None).map_err(VulkanError::Api)? };
        Ok(Self { device: device.clone(), sampler })
    }

    /// Sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

/// Color attachment for dynamic rendering
pub fn color_attachment(view: vk::ImageView, clear: Option<[f32; 4]>) -> vk::RenderingAttachmentInfo {
    let (load_op, clear_value) = match clear {
        Some(float32) => (vk::AttachmentLoadOp::CLEAR, vk::ClearValue { color: vk::ClearColorValue { float32 } }),
        None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
    };
    vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(clear_value)
        .build()
}

/// Depth attachment cleared to the far plane
pub fn depth_attachment(view: vk::ImageView) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        })
        .build()
}

/// Stages that touch the shared depth image before the next frame clears it
pub const DEPTH_REUSE_SRC_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

/// Stages of the depth clear and tests
pub const DEPTH_REUSE_DST_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw() | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

/// Orders this frame's depth clear after every earlier frame's depth writes
///
/// The depth image is shared by all slots and stays in `DEPTH_ATTACHMENT_OPTIMAL`.
pub fn depth_reuse_barrier(image: vk::Image) -> vk::ImageMemoryBarrier {
    image_barrier(
        image,
        vk::ImageAspectFlags::DEPTH,
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    )
}

/// Record [`depth_reuse_barrier`] for the frame's depth target
pub fn wait_for_previous_depth(ctx: &PassContext<'_>) {
    pipeline_barrier(
        ctx.device,
        ctx.cmd,
        DEPTH_REUSE_SRC_STAGES,
        DEPTH_REUSE_DST_STAGES,
        &[],
        &[depth_reuse_barrier(ctx.depth_target.0)],
    );
}

/// Begin dynamic rendering over the full extent
pub fn begin_rendering(
    device: &Device,
    cmd: vk::CommandBuffer,
    extent: vk::Extent2D,
    colors: &[vk::RenderingAttachmentInfo],
    depth: Option<&vk::RenderingAttachmentInfo>,
) {
    let mut info = vk::RenderingInfo::builder()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .layer_count(1)
        .color_attachments(colors);
    if let Some(depth) = depth {
        info = info.depth_attachment(depth);
    }
    unsafe { device.cmd_begin_rendering(cmd, &info) };
}

/// Allocate one set per slot from `layout`
pub fn allocate_slot_sets(descriptors: &mut DescriptorAllocator, layout: vk::DescriptorSetLayout, slot_count: usize) -> Vec<vk::DescriptorSet> {
    (0..slot_count).map(|_| descriptors.allocate(layout)).collect()
}

/// Queue a whole-buffer write of `id` at `binding`
pub fn write_whole_buffer(
    writer: &mut DescriptorWriter,
    allocator: &ResourceAllocator,
    binding: u32,
    id: BufferId,
    ty: vk::DescriptorType,
) {
    writer.write_buffer(binding, allocator.buffer_handle(id), 0, vk::WHOLE_SIZE, ty);
}

/// Indexed indirect draw over every command in the slot's working buffer
pub fn draw_indirect(ctx: &PassContext<'_>) {
    if ctx.command_count == 0 {
        return;
    }
    unsafe {
        ctx.device.cmd_draw_indexed_indirect(
            ctx.cmd,
            ctx.allocator.buffer_handle(ctx.commands),
            0,
            ctx.command_count,
            std::mem::size_of::<crate::render::gpu_types::DrawIndexedIndirectCommand>() as u32,
        );
    }
    log::trace!("Indirect draw of {} commands", ctx.command_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_depth_reuse_keeps_layout_and_orders_writes() {
        let image = vk::Image::from_raw(7);
        let barrier = depth_reuse_barrier(image);
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.old_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_depth_reuse_stages_cover_writes_and_pyramid_reads() {
        assert!(DEPTH_REUSE_SRC_STAGES.contains(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS));
        assert!(DEPTH_REUSE_SRC_STAGES.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
        assert!(DEPTH_REUSE_DST_STAGES.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
    }
}
