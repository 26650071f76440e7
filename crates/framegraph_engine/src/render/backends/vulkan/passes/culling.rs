//! GPU visibility pass
//!
//! Two compute stages:
//!
//! 1. Depth pyramid. Last frame's depth buffer is reduced into a
//!    power-of-two `R32_SFLOAT` mip chain, each texel holding the farthest
//!    depth of its footprint. Skipped while occlusion is off or the depth
//!    history is invalid (first frame, after a resize).
//! 2. Cull. One invocation per object tests its bounding sphere against the
//!    frustum and the pyramid, then claims an instance slot in its mesh's
//!    range and bumps the instance count of every command of the mesh.
//!
//! The pyramid image lives in `GENERAL` for its whole life. The depth buffer
//! is borrowed as `SHADER_READ_ONLY_OPTIMAL` for the first reduction and
//! handed back as `DEPTH_ATTACHMENT_OPTIMAL`.

use ash::{vk, Device};
use gpu_allocator::MemoryLocation;

use super::{allocate_slot_sets, write_whole_buffer, PassContext, PassSetup, RenderPass, Sampler, SlotBuffers};
use crate::render::backends::vulkan::rendering::{create_compute_pipeline, Pipeline};
use crate::render::backends::vulkan::resources::{
    BufferId, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, ImageId, QueueType, ResourceAllocator,
};
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier, MemoryBarrierBuilder};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::culling::{cull_group_count, DepthPyramidInfo, ViewFrustum};
use crate::render::features::RenderFeatures;
use crate::render::gpu_types::{CullUniforms, CULL_FLAG_OCCLUSION};
use crate::foundation::math::mat4_to_cols;
use crate::scene::CameraData;

const PYRAMID_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

/// Reduction push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ReduceConstants {
    src_size: [f32; 2],
    dst_size: [f32; 2],
}

unsafe impl bytemuck::Pod for ReduceConstants {}
unsafe impl bytemuck::Zeroable for ReduceConstants {}

/// Fill the cull uniform block for one frame
///
/// Occlusion is dropped from `flags` when there is no pyramid or the depth
/// history can't be trusted, so the shader never samples stale data.
pub fn cull_uniforms(
    camera: &CameraData,
    pyramid: Option<&DepthPyramidInfo>,
    object_count: u32,
    flags: u32,
    history_valid: bool,
) -> CullUniforms {
    let mut flags = flags;
    if pyramid.is_none() || !history_valid {
        flags &= !CULL_FLAG_OCCLUSION;
    }
    let (pyramid_width, pyramid_height) = pyramid.map_or((0.0, 0.0), |p| (p.width as f32, p.height as f32));
    CullUniforms {
        view: mat4_to_cols(&camera.view),
        projection: mat4_to_cols(&camera.projection),
        frustum: ViewFrustum::from_view_projection(&camera.view_projection).to_gpu(),
        pyramid_width,
        pyramid_height,
        z_near: camera.z_near,
        object_count,
        flags,
        _padding: [0; 3],
    }
}

fn reduce_constants(pyramid: &DepthPyramidInfo, depth_extent: vk::Extent2D, level: u32) -> ReduceConstants {
    let src = if level == 0 {
        (depth_extent.width, depth_extent.height)
    } else {
        pyramid.level_extent(level - 1)
    };
    let dst = pyramid.level_extent(level);
    ReduceConstants {
        src_size: [src.0 as f32, src.1 as f32],
        dst_size: [dst.0 as f32, dst.1 as f32],
    }
}

/// Depth pyramid reduction plus per-object visibility
pub struct CullingPass {
    device: Device,
    features: RenderFeatures,
    cull_pipeline: Pipeline,
    reduce_pipeline: Pipeline,
    _cull_layout: DescriptorSetLayout,
    reduce_layout: DescriptorSetLayout,
    sampler: Sampler,
    cull_sets: Vec<vk::DescriptorSet>,
    reduce_sets: Vec<vk::DescriptorSet>,
    uniforms: Vec<BufferId>,
    pyramid: Option<ImageId>,
    pyramid_info: Option<DepthPyramidInfo>,
    depth_extent: vk::Extent2D,
}

impl CullingPass {
    /// Build pipelines, per-slot uniform buffers and the initial pyramid
    pub fn new(setup: &mut PassSetup<'_>, features: RenderFeatures) -> VulkanResult<Self> {
        let device = setup.device.clone();
        let compute = vk::ShaderStageFlags::COMPUTE;

        let cull_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, compute)
            .add_storage_buffer(1, compute)
            .add_storage_buffer(2, compute)
            .add_storage_buffer(3, compute)
            .add_storage_buffer(4, compute)
            .add_combined_image_sampler(5, compute)
            .build(&device)?;
        let reduce_layout = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, compute)
            .add_storage_image(1, compute)
            .build(&device)?;

        let cull_shader = setup.load_shader(&setup.shaders.cull)?;
        let cull_pipeline = create_compute_pipeline(&device, &cull_shader, &[cull_layout.handle()], 0)?;
        let reduce_shader = setup.load_shader(&setup.shaders.depth_reduce)?;
        let reduce_pipeline = create_compute_pipeline(
            &device,
            &reduce_shader,
            &[reduce_layout.handle()],
            std::mem::size_of::<ReduceConstants>() as u32,
        )?;

        let sampler = Sampler::new(&device, vk::Filter::NEAREST)?;
        let cull_sets = allocate_slot_sets(setup.descriptors, cull_layout.handle(), setup.slot_count);
        let uniforms = (0..setup.slot_count)
            .map(|slot| {
                setup.allocator.create_buffer(
                    std::mem::size_of::<CullUniforms>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                    &format!("cull uniforms {slot}"),
                )
            })
            .collect::<Vec<_>>();

        let mut writer = DescriptorWriter::new();
        for (&set, &buffer) in cull_sets.iter().zip(&uniforms) {
            write_whole_buffer(&mut writer, setup.allocator, 0, buffer, vk::DescriptorType::UNIFORM_BUFFER);
            writer.update_set(&device, set);
        }

        let mut pass = Self {
            device,
            features,
            cull_pipeline,
            reduce_pipeline,
            _cull_layout: cull_layout,
            reduce_layout,
            sampler,
            cull_sets,
            reduce_sets: Vec::new(),
            uniforms,
            pyramid: None,
            pyramid_info: None,
            depth_extent: setup.extent,
        };
        pass.create_pyramid(setup)?;
        log::info!(
            "Culling pass ready (frustum: {}, occlusion: {})",
            features.contains(RenderFeatures::FRUSTUM_CULLING),
            features.contains(RenderFeatures::OCCLUSION_CULLING)
        );
        Ok(pass)
    }

    fn create_pyramid(&mut self, setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        if let Some(old) = self.pyramid.take() {
            setup.allocator.destroy_image(old);
        }

        let info = DepthPyramidInfo::for_depth_extent(setup.extent.width, setup.extent.height)
            .map_err(|e| VulkanError::InvalidOperation { reason: e.to_string() })?;
        let id = setup.allocator.create_image(
            vk::Extent2D { width: info.width, height: info.height },
            PYRAMID_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            info.levels,
            "depth pyramid",
        );
        setup.allocator.create_mip_views(id)?;

        let (image, mip_views) = match setup.allocator.image(id) {
            Some(img) => (img.image, img.mip_views.clone()),
            None => return Err(VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() }),
        };
        setup.allocator.immediate_submit(QueueType::Graphics, |device, cmd| {
            let barrier = image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            );
            pipeline_barrier(device, cmd, vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::COMPUTE_SHADER, &[], &[barrier]);
        })?;

        while self.reduce_sets.len() < info.levels as usize {
            self.reduce_sets.push(setup.descriptors.allocate(self.reduce_layout.handle()));
        }

        let mut writer = DescriptorWriter::new();
        for level in 0..info.levels as usize {
            let (source, source_layout) = if level == 0 {
                (setup.depth_view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            } else {
                (mip_views[level - 1], vk::ImageLayout::GENERAL)
            };
            writer
                .write_image(0, source, self.sampler.handle(), source_layout, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .write_image(1, mip_views[level], vk::Sampler::null(), vk::ImageLayout::GENERAL, vk::DescriptorType::STORAGE_IMAGE);
            writer.update_set(&self.device, self.reduce_sets[level]);
        }

        let full_view = setup.allocator.image(id).map(|img| img.view).unwrap_or_default();
        for &set in &self.cull_sets {
            writer.write_image(5, full_view, self.sampler.handle(), vk::ImageLayout::GENERAL, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            writer.update_set(&self.device, set);
        }

        log::debug!("Depth pyramid {}x{} with {} levels", info.width, info.height, info.levels);
        self.pyramid = Some(id);
        self.pyramid_info = Some(info);
        self.depth_extent = setup.extent;
        Ok(())
    }

    /// Write this frame's cull uniforms into the slot's buffer
    pub fn prepare(
        &self,
        allocator: &mut ResourceAllocator,
        slot: usize,
        camera: &CameraData,
        object_count: u32,
        history_valid: bool,
    ) -> VulkanResult<()> {
        let uniforms = cull_uniforms(camera, self.pyramid_info.as_ref(), object_count, self.features.cull_flags(), history_valid);
        allocator.write_buffer(self.uniforms[slot], 0, bytemuck::bytes_of(&uniforms))
    }

    /// Current pyramid dimensions
    pub fn pyramid_info(&self) -> Option<DepthPyramidInfo> {
        self.pyramid_info
    }

    fn occlusion_active(&self, history_valid: bool) -> bool {
        self.features.contains(RenderFeatures::OCCLUSION_CULLING) && history_valid && self.pyramid_info.is_some()
    }

    fn build_pyramid(&self, ctx: &PassContext<'_>) {
        let (Some(info), Some(pyramid)) = (self.pyramid_info, self.pyramid.and_then(|id| ctx.allocator.image(id))) else {
            return;
        };
        let depth_image = ctx.depth_target.0;

        let to_read = image_barrier(
            depth_image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        let pyramid_ready = image_barrier(
            pyramid.image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::SHADER_WRITE,
        );
        pipeline_barrier(
            ctx.device,
            ctx.cmd,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            &[],
            &[to_read, pyramid_ready],
        );

        for level in 0..info.levels {
            self.reduce_pipeline.bind(ctx.cmd, &[self.reduce_sets[level as usize]]);
            self.reduce_pipeline.push_constants(
                ctx.cmd,
                vk::ShaderStageFlags::COMPUTE,
                &reduce_constants(&info, self.depth_extent, level),
            );
            let (gx, gy) = info.level_group_count(level);
            unsafe { ctx.device.cmd_dispatch(ctx.cmd, gx, gy, 1) };

            let level_written = image_barrier(
                pyramid.image,
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
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &[],
                &[level_written],
            );
        }

        let to_attachment = image_barrier(
            depth_image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        pipeline_barrier(
            ctx.device,
            ctx.cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            &[],
            &[to_attachment],
        );
        log::trace!("Depth pyramid built ({} levels)", info.levels);
    }
}

impl RenderPass for CullingPass {
    fn name(&self) -> &'static str {
        "culling"
    }

    fn link_slot(&mut self, device: &Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let mut writer = DescriptorWriter::new();
        write_whole_buffer(&mut writer, allocator, 1, buffers.objects, storage);
        write_whole_buffer(&mut writer, allocator, 2, buffers.mesh_info, storage);
        write_whole_buffer(&mut writer, allocator, 3, buffers.commands, storage);
        write_whole_buffer(&mut writer, allocator, 4, buffers.instance_to_object, storage);
        writer.update_set(device, self.cull_sets[slot]);
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        if self.occlusion_active(ctx.history_valid) {
            self.build_pyramid(ctx);
        }

        self.cull_pipeline.bind(ctx.cmd, &[self.cull_sets[ctx.slot]]);
        unsafe { ctx.device.cmd_dispatch(ctx.cmd, cull_group_count(ctx.object_count), 1, 1) };

        pipeline_barrier(
            ctx.device,
            ctx.cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
            &[MemoryBarrierBuilder::buffer_compute_to_indirect()],
            &[],
        );
        Ok(())
    }

    fn resize(&mut self, setup: &mut PassSetup<'_>) -> VulkanResult<()> {
        self.create_pyramid(setup)
    }

    fn cleanup(&mut self, allocator: &mut ResourceAllocator) {
        if let Some(id) = self.pyramid.take() {
            allocator.destroy_image(id);
        }
        for id in self.uniforms.drain(..) {
            allocator.destroy_buffer(id);
        }
        self.pyramid_info = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::render::gpu_types::CULL_FLAG_FRUSTUM;

    fn camera() -> CameraData {
        CameraData::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), 1.0, 1.5, 0.1, 100.0)
    }

    #[test]
    fn test_occlusion_flag_requires_history_and_pyramid() {
        let pyramid = DepthPyramidInfo::for_depth_extent(800, 600).unwrap();
        let all = CULL_FLAG_FRUSTUM | CULL_FLAG_OCCLUSION;

        let fresh = cull_uniforms(&camera(), Some(&pyramid), 10, all, true);
        assert_eq!(fresh.flags, all);
        assert_eq!(fresh.pyramid_width, 512.0);
        assert_eq!(fresh.pyramid_height, 512.0);
        assert_eq!(fresh.object_count, 10);

        let stale = cull_uniforms(&camera(), Some(&pyramid), 10, all, false);
        assert_eq!(stale.flags, CULL_FLAG_FRUSTUM);

        let missing = cull_uniforms(&camera(), None, 10, all, true);
        assert_eq!(missing.flags, CULL_FLAG_FRUSTUM);
        assert_eq!(missing.pyramid_width, 0.0);
    }

    #[test]
    fn test_cull_uniforms_carry_camera() {
        let cam = camera();
        let uniforms = cull_uniforms(&cam, None, 0, 0, true);
        assert_eq!(uniforms.view, mat4_to_cols(&cam.view));
        assert_eq!(uniforms.z_near, 0.1);
        assert_eq!(uniforms.frustum, ViewFrustum::from_view_projection(&cam.view_projection).to_gpu());
    }

    #[test]
    fn test_reduce_constants_chain_levels() {
        let pyramid = DepthPyramidInfo::for_depth_extent(800, 600).unwrap();
        let depth = vk::Extent2D { width: 800, height: 600 };

        let first = reduce_constants(&pyramid, depth, 0);
        assert_eq!(first.src_size, [800.0, 600.0]);
        assert_eq!(first.dst_size, [512.0, 512.0]);

        let second = reduce_constants(&pyramid, depth, 1);
        assert_eq!(second.src_size, [512.0, 512.0]);
        assert_eq!(second.dst_size, [256.0, 256.0]);
    }

    #[test]
    fn test_reduce_constants_are_push_sized() {
        assert_eq!(std::mem::size_of::<ReduceConstants>(), 16);
    }
}
