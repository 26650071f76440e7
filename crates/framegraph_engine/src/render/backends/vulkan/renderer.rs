//! Frame orchestration
//!
//! [`VulkanRenderer`] ties the frame ring, the mesh bank, the indirect draw
//! buffers and the pass chain together. One call to
//! [`VulkanRenderer::draw_frame`] runs the whole per-frame data flow:
//!
//! ```text
//! translate scene ──(error)──> Skipped
//!       │
//! begin frame ──(out of date)──> Skipped
//!       │
//! write slot buffers -> reset draws / CPU cull -> [TLAS]
//!       │
//! forward:  cull -> forward
//! deferred: cull -> gbuffer -> [shadow] -> lighting
//!       │
//! submit + present
//! ```
//!
//! Field order is teardown order: passes and descriptor pools go before the
//! scheduler, which owns the allocator and the device.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::core::config::{DescriptorConfig, DescriptorKind, PipelineMode, PoolSizeRatio, RendererConfig};
use crate::render::backends::vulkan::mesh_buffers::{build_mesh_buffers, MeshBuffers};
use crate::render::backends::vulkan::passes::{
    CullingPass, DeferredLightingPass, DrawBuffers, ForwardPass, GBufferPass, PassContext, PassSetup, RenderPass,
    RtShadowPass, SlotBuffers,
};
use crate::render::backends::vulkan::resources::{AccelerationStructures, BufferId, DescriptorAllocator, ResourceAllocator};
use crate::render::backends::vulkan::state::sync::{pipeline_barrier, MemoryBarrierBuilder};
use crate::render::backends::vulkan::state::{VulkanFrameBackend, DEPTH_FORMAT};
use crate::render::backends::vulkan::{SurfaceSource, VulkanContext, VulkanError, VulkanResult};
use crate::render::culling::{CullStats, ViewFrustum};
use crate::render::draw_commands::MeshInstanceCounts;
use crate::render::error::{RenderError, RenderResult};
use crate::render::features::RenderFeatures;
use crate::render::frame::{ActiveFrame, FrameScheduler};
use crate::render::gpu_types::{LightData, ObjectData, SceneUniforms};
use crate::render::mesh_bank::{MeshBank, VertexLayout};
use crate::scene::{SceneDataSink, SceneSource, SceneTranslator, TranslateError, TranslatedData};

/// Why a frame produced no image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The swapchain was rebuilt (or the window is minimised)
    SwapchainOutOfDate,
    /// The scene could not be translated
    Scene(TranslateError),
}

/// Outcome of [`VulkanRenderer::draw_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// Recorded, submitted and queued for presentation
    Rendered,
    /// Nothing was recorded
    Skipped(SkipReason),
}

/// Capacity after growing to hold `needed` records
pub fn grown_capacity(current: u32, needed: u32) -> u32 {
    if needed <= current {
        current
    } else {
        needed.next_power_of_two()
    }
}

/// Descriptor pool settings with room for acceleration structures when needed
pub fn descriptor_config(config: &RendererConfig, features: RenderFeatures) -> DescriptorConfig {
    let mut descriptors = config.descriptors.clone();
    let has_tlas = descriptors
        .ratios
        .iter()
        .any(|r| r.kind == DescriptorKind::AccelerationStructure);
    if features.contains(RenderFeatures::RAY_TRACED_SHADOWS) && !has_tlas {
        descriptors
            .ratios
            .push(PoolSizeRatio::new(DescriptorKind::AccelerationStructure, 1.0));
    }
    descriptors
}

/// Per-slot scene buffers
struct FrameData {
    objects: BufferId,
    object_capacity: u32,
    scene: BufferId,
    lights: BufferId,
    light_capacity: u32,
}

impl FrameData {
    fn new(allocator: &mut ResourceAllocator, slot: usize, object_capacity: u32, light_capacity: u32) -> Self {
        let scene = allocator.create_buffer(
            std::mem::size_of::<SceneUniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            &format!("scene uniforms {slot}"),
        );
        Self {
            objects: Self::object_buffer(allocator, slot, object_capacity),
            object_capacity,
            scene,
            lights: Self::light_buffer(allocator, slot, light_capacity),
            light_capacity,
        }
    }

    fn object_buffer(allocator: &mut ResourceAllocator, slot: usize, capacity: u32) -> BufferId {
        allocator.create_buffer(
            (capacity.max(1) as usize * std::mem::size_of::<ObjectData>()) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            &format!("objects {slot}"),
        )
    }

    fn light_buffer(allocator: &mut ResourceAllocator, slot: usize, capacity: u32) -> BufferId {
        allocator.create_buffer(
            (capacity.max(1) as usize * std::mem::size_of::<LightData>()) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            &format!("lights {slot}"),
        )
    }

    /// Grow the object and light buffers; true when either was replaced
    fn reserve(&mut self, allocator: &mut ResourceAllocator, slot: usize, objects: u32, lights: u32) -> bool {
        let mut grew = false;
        let object_capacity = grown_capacity(self.object_capacity, objects);
        if object_capacity != self.object_capacity {
            allocator.destroy_buffer(self.objects);
            self.objects = Self::object_buffer(allocator, slot, object_capacity);
            log::debug!("Slot {} object buffer grown {} -> {}", slot, self.object_capacity, object_capacity);
            self.object_capacity = object_capacity;
            grew = true;
        }
        let light_capacity = grown_capacity(self.light_capacity, lights);
        if light_capacity != self.light_capacity {
            allocator.destroy_buffer(self.lights);
            self.lights = Self::light_buffer(allocator, slot, light_capacity);
            self.light_capacity = light_capacity;
            grew = true;
        }
        grew
    }

    fn slot_buffers(&self, draw: &DrawBuffers, slot: usize) -> SlotBuffers {
        SlotBuffers {
            objects: self.objects,
            scene: self.scene,
            lights: self.lights,
            commands: draw.working(slot),
            instance_to_object: draw.instance_to_object(slot),
            mesh_info: draw.mesh_info(),
        }
    }

    fn destroy(self, allocator: &mut ResourceAllocator) {
        allocator.destroy_buffer(self.objects);
        allocator.destroy_buffer(self.scene);
        allocator.destroy_buffer(self.lights);
    }
}

/// Writes translated scene data into one slot's buffers
struct FrameSink<'a> {
    allocator: &'a mut ResourceAllocator,
    frame: &'a FrameData,
    result: VulkanResult<()>,
}

impl FrameSink<'_> {
    fn write(&mut self, id: BufferId, bytes: &[u8]) {
        if self.result.is_ok() && !bytes.is_empty() {
            self.result = self.allocator.write_buffer(id, 0, bytes);
        }
    }
}

impl SceneDataSink for FrameSink<'_> {
    fn write_objects(&mut self, objects: &[ObjectData]) {
        self.write(self.frame.objects, bytemuck::cast_slice(objects));
    }

    fn write_scene(&mut self, scene: &SceneUniforms) {
        self.write(self.frame.scene, bytemuck::bytes_of(scene));
    }

    fn write_lights(&mut self, lights: &[LightData]) {
        self.write(self.frame.lights, bytemuck::cast_slice(lights));
    }
}

/// The passes one pipeline mode uses, in recording order
#[derive(Default)]
struct PassChain {
    culling: Option<CullingPass>,
    forward: Option<ForwardPass>,
    gbuffer: Option<GBufferPass>,
    shadow: Option<RtShadowPass>,
    lighting: Option<DeferredLightingPass>,
}

impl PassChain {
    fn new(setup: &mut PassSetup<'_>, features: RenderFeatures) -> VulkanResult<Self> {
        let mut chain = Self::default();
        if features.contains(RenderFeatures::GPU_CULLING) {
            chain.culling = Some(CullingPass::new(setup, features)?);
        }
        if features.contains(RenderFeatures::DEFERRED) {
            chain.gbuffer = Some(GBufferPass::new(setup)?);
            if features.contains(RenderFeatures::RAY_TRACED_SHADOWS) {
                chain.shadow = Some(RtShadowPass::new(setup)?);
            }
            chain.lighting = Some(DeferredLightingPass::new(setup)?);
        } else {
            chain.forward = Some(ForwardPass::new(setup)?);
        }
        Ok(chain)
    }

    fn passes_mut(&mut self) -> Vec<&mut dyn RenderPass> {
        let mut passes: Vec<&mut dyn RenderPass> = Vec::new();
        if let Some(pass) = self.culling.as_mut() {
            passes.push(pass);
        }
        if let Some(pass) = self.forward.as_mut() {
            passes.push(pass);
        }
        if let Some(pass) = self.gbuffer.as_mut() {
            passes.push(pass);
        }
        if let Some(pass) = self.shadow.as_mut() {
            passes.push(pass);
        }
        if let Some(pass) = self.lighting.as_mut() {
            passes.push(pass);
        }
        passes
    }

    fn link_slot(&mut self, device: &ash::Device, allocator: &ResourceAllocator, slot: usize, buffers: &SlotBuffers) {
        for pass in self.passes_mut() {
            pass.link_slot(device, allocator, slot, buffers);
        }
    }

    /// Relink G-buffer and shadow mask readers after those images change
    fn link_attachments(&mut self, allocator: &ResourceAllocator) -> VulkanResult<()> {
        let Some(gbuffer) = self.gbuffer.as_ref().and_then(|p| p.gbuffer()) else {
            return Ok(());
        };
        if let Some(shadow) = self.shadow.as_mut() {
            shadow.link_gbuffer(allocator, &gbuffer)?;
        }
        if let Some(lighting) = self.lighting.as_mut() {
            lighting.link_gbuffer(allocator, &gbuffer)?;
            if let Some(view) = self.shadow.as_ref().and_then(|s| s.mask_view(allocator)) {
                lighting.link_shadow_mask(view, vk::ImageLayout::GENERAL);
            }
        }
        Ok(())
    }

    fn record(&mut self, ctx: &PassContext<'_>) -> VulkanResult<()> {
        for pass in self.passes_mut() {
            log::trace!("Recording {} pass", pass.name());
            pass.record(ctx)?;
        }
        Ok(())
    }
}

fn pass_setup<'a>(
    backend: &'a mut VulkanFrameBackend,
    extent: vk::Extent2D,
    descriptors: &'a mut DescriptorAllocator,
    config: &'a RendererConfig,
    vertex_layout: &'a VertexLayout,
    slot_count: usize,
) -> VulkanResult<PassSetup<'a>> {
    let color_format = backend.color_format();
    let depth_view = backend
        .depth_image()
        .map(|depth| depth.view)
        .ok_or_else(|| VulkanError::InvalidOperation { reason: "no depth attachment".to_string() })?;
    let device = backend.device().clone();
    Ok(PassSetup {
        device,
        allocator: backend.allocator_mut(),
        descriptors,
        shaders: &config.shaders,
        slot_count,
        extent,
        color_format,
        depth_format: DEPTH_FORMAT,
        depth_view,
        vertex_layout,
    })
}

/// GPU-driven renderer over a frame ring
pub struct VulkanRenderer {
    passes: Option<PassChain>,
    descriptors: DescriptorAllocator,
    bank: MeshBank,
    mesh_buffers: Option<MeshBuffers>,
    draw: Option<DrawBuffers>,
    acceleration: Option<AccelerationStructures>,
    frames: Vec<FrameData>,
    config: RendererConfig,
    features: RenderFeatures,
    generation: u64,
    last_cull_stats: Option<CullStats>,
    scheduler: FrameScheduler<VulkanFrameBackend>,
}

impl VulkanRenderer {
    /// Create the device, frame ring and per-slot buffers for `surface`
    ///
    /// Meshes are added through [`Self::mesh_bank_mut`]; nothing can be drawn
    /// until [`Self::build_mesh_buffers`] has run.
    pub fn new(surface: &dyn SurfaceSource, config: RendererConfig, vertex_layout: VertexLayout) -> RenderResult<Self> {
        config.validate().map_err(RenderError::InvalidConfig)?;

        let wants_ray_tracing = config.ray_traced_shadows && config.pipeline == PipelineMode::Deferred;
        let context = VulkanContext::new(
            surface,
            &config.application_name,
            config.application_version,
            config.validation_enabled(),
            wants_ray_tracing,
        )?;
        let features = RenderFeatures::resolve(&config, context.physical_device.capabilities);
        log::info!("Rendering on {}", context.physical_device.name());

        let device = context.raw_device();
        let (width, height) = surface.framebuffer_size();
        let (mut backend, extent) = VulkanFrameBackend::new(
            context,
            config.max_frames_in_flight,
            vk::Extent2D { width, height },
            config.present_mode,
        )?;

        let descriptors = DescriptorAllocator::init(device, &descriptor_config(&config, features))?;
        let frames = (0..config.max_frames_in_flight)
            .map(|slot| FrameData::new(backend.allocator_mut(), slot, config.initial_object_capacity, 1))
            .collect();

        let scheduler = FrameScheduler::new(backend, extent);
        let generation = scheduler.swapchain_generation();
        Ok(Self {
            passes: None,
            descriptors,
            bank: MeshBank::new(vertex_layout),
            mesh_buffers: None,
            draw: None,
            acceleration: None,
            frames,
            config,
            features,
            generation,
            last_cull_stats: None,
            scheduler,
        })
    }

    /// Upload the bank, build draw templates and acceleration structures, create passes
    ///
    /// One-shot: the bank rejects further meshes afterwards.
    pub fn build_mesh_buffers(&mut self) -> RenderResult<()> {
        let ray_tracing = self.features.contains(RenderFeatures::RAY_TRACED_SHADOWS);
        let slot_count = self.frames.len();
        let (context, allocator) = self.scheduler.backend_mut().split_mut();

        let mesh_buffers = build_mesh_buffers(allocator, &mut self.bank, ray_tracing)?;
        if ray_tracing {
            let loader = context
                .device
                .acceleration_structure
                .clone()
                .ok_or_else(|| VulkanError::MissingFeature("VK_KHR_acceleration_structure".to_string()))?;
            let mut acceleration = AccelerationStructures::new(loader, slot_count);
            acceleration.build_bottom_levels(allocator, &self.bank, &mesh_buffers)?;
            self.acceleration = Some(acceleration);
        }

        let cpu_culling = !self.features.contains(RenderFeatures::GPU_CULLING);
        let draw = DrawBuffers::build_draw_commands(allocator, &self.bank, slot_count, cpu_culling)?;
        log::info!("{} draw commands for {} meshes", draw.command_count(), self.bank.len());
        self.mesh_buffers = Some(mesh_buffers);
        self.draw = Some(draw);

        self.create_passes()
    }

    fn create_passes(&mut self) -> RenderResult<()> {
        let extent = self.scheduler.extent();
        let mut setup = pass_setup(
            self.scheduler.backend_mut(),
            extent,
            &mut self.descriptors,
            &self.config,
            self.bank.layout(),
            self.frames.len(),
        )?;
        let mut passes = PassChain::new(&mut setup, self.features)?;
        passes.link_attachments(setup.allocator)?;
        self.passes = Some(passes);

        for slot in 0..self.frames.len() {
            self.relink_slot(slot);
        }
        Ok(())
    }

    fn resize_passes(&mut self) -> RenderResult<()> {
        let Some(passes) = self.passes.as_mut() else {
            return Ok(());
        };
        let extent = self.scheduler.extent();
        let mut setup = pass_setup(
            self.scheduler.backend_mut(),
            extent,
            &mut self.descriptors,
            &self.config,
            self.bank.layout(),
            self.frames.len(),
        )?;
        for pass in passes.passes_mut() {
            pass.resize(&mut setup)?;
        }
        passes.link_attachments(setup.allocator)?;
        log::debug!("Passes resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn relink_slot(&mut self, slot: usize) {
        let (Some(passes), Some(draw)) = (self.passes.as_mut(), self.draw.as_ref()) else {
            return;
        };
        let backend = self.scheduler.backend();
        let buffers = self.frames[slot].slot_buffers(draw, slot);
        passes.link_slot(backend.device(), backend.allocator(), slot, &buffers);
    }

    /// Re-reserve instance ranges after the scene population changed
    ///
    /// Waits for the device to go idle; call between frames.
    pub fn update_draw_instance_counts(&mut self, counts: &MeshInstanceCounts) -> RenderResult<()> {
        if self.draw.is_none() {
            return Err(RenderError::NotReady("mesh buffers have not been built".to_string()));
        }
        self.scheduler.wait_idle()?;

        let allocator = self.scheduler.backend_mut().allocator_mut();
        let reallocated = match self.draw.as_mut() {
            Some(draw) => draw.update_draw_instance_counts(allocator, counts)?,
            None => false,
        };
        if reallocated {
            for slot in 0..self.frames.len() {
                self.relink_slot(slot);
            }
        }
        Ok(())
    }

    /// Translate, cull, draw and present one frame
    pub fn draw_frame(&mut self, scene: &dyn SceneSource) -> RenderResult<FrameStatus> {
        if self.passes.is_none() {
            return Err(RenderError::NotReady("call build_mesh_buffers before drawing".to_string()));
        }

        let shadows = self.features.contains(RenderFeatures::RAY_TRACED_SHADOWS);
        let data = match SceneTranslator::new(&self.bank).with_shadows(shadows).translate(scene) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Skipping frame: {}", e);
                return Ok(FrameStatus::Skipped(SkipReason::Scene(e)));
            }
        };
        if let Some(draw) = self.draw.as_ref() {
            draw.draw_set().validate_population(&data.frame.instance_counts)?;
        }

        let Some(frame) = self.scheduler.begin_render_frame()? else {
            return Ok(FrameStatus::Skipped(SkipReason::SwapchainOutOfDate));
        };

        // The slot's fence is reset now; a failed recording still has to be submitted
        if let Err(e) = self.prepare_and_record(&frame, &data) {
            log::error!("Frame {} failed while recording: {}", frame.frame_number, e);
            if let Err(abort) = self.scheduler.abort_render_frame(frame) {
                log::error!("Could not release the failed frame's slot: {}", abort);
            }
            return Err(e);
        }
        self.scheduler.finish_render_frame(frame)?;
        Ok(FrameStatus::Rendered)
    }

    fn prepare_and_record(&mut self, frame: &ActiveFrame, data: &TranslatedData) -> RenderResult<()> {
        if self.scheduler.swapchain_generation() != self.generation {
            self.resize_passes()?;
            self.generation = self.scheduler.swapchain_generation();
        }

        let slot = frame.slot;
        let grew = self.frames[slot].reserve(
            self.scheduler.backend_mut().allocator_mut(),
            slot,
            data.frame.object_count,
            data.frame.light_count,
        );
        if grew {
            self.relink_slot(slot);
        }

        let mut sink = FrameSink {
            allocator: self.scheduler.backend_mut().allocator_mut(),
            frame: &self.frames[slot],
            result: Ok(()),
        };
        sink.write_objects(&data.objects);
        sink.write_scene(&data.uniforms);
        sink.write_lights(&data.lights);
        sink.result?;

        self.record_frame(frame, data)
    }

    fn record_frame(&mut self, frame: &ActiveFrame, data: &TranslatedData) -> RenderResult<()> {
        let (Some(passes), Some(draw), Some(mesh_buffers)) = (self.passes.as_mut(), self.draw.as_ref(), self.mesh_buffers.as_ref())
        else {
            return Err(RenderError::NotReady("mesh buffers have not been built".to_string()));
        };
        let slot = frame.slot;
        let cmd = frame.command_buffer;
        let camera = &data.frame.camera;

        let backend = self.scheduler.backend_mut();
        if let Some(culling) = passes.culling.as_ref() {
            culling.prepare(backend.allocator_mut(), slot, camera, data.frame.object_count, frame.history_valid)?;
            draw.reset_draw_commands(backend.device(), backend.allocator(), cmd, slot);
        } else {
            let frustum = self
                .config
                .culling
                .frustum
                .then(|| ViewFrustum::from_view_projection(&camera.view_projection));
            let stats = draw.cull_on_cpu(backend.allocator_mut(), slot, frustum.as_ref(), &data.objects)?;
            if stats.dropped > 0 {
                log::warn!("{} visible objects found no instance slot", stats.dropped);
            }
            self.last_cull_stats = Some(stats);
            pipeline_barrier(
                backend.device(),
                cmd,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
                &[MemoryBarrierBuilder::buffer_host_to_indirect()],
                &[],
            );
        }

        if let (Some(acceleration), Some(shadow)) = (self.acceleration.as_mut(), passes.shadow.as_mut()) {
            if acceleration.record_top_level(backend.allocator_mut(), cmd, slot, &data.objects)? {
                shadow.link_tlas(slot, acceleration.top_level(slot));
            }
        }

        let backend = self.scheduler.backend();
        let color_target = backend.swapchain_target(frame.image_index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("swapchain image {} does not exist", frame.image_index),
        })?;
        let depth_target = backend
            .depth_image()
            .map(|depth| (depth.image, depth.view))
            .ok_or_else(|| VulkanError::InvalidOperation { reason: "no depth attachment".to_string() })?;

        let ctx = PassContext {
            device: backend.device(),
            allocator: backend.allocator(),
            cmd,
            slot,
            extent: frame.extent,
            color_target,
            depth_target,
            history_valid: frame.history_valid,
            object_count: data.frame.object_count,
            commands: draw.working(slot),
            command_count: draw.command_count(),
            mesh_buffers,
            clear_color: self.config.clear_color,
        };
        passes.record(&ctx)?;
        Ok(())
    }

    /// Record a new framebuffer size; applied at the next frame boundary
    pub fn notify_framebuffer_resized(&mut self, width: u32, height: u32) {
        self.scheduler.notify_framebuffer_resized(width, height);
    }

    /// Block until the GPU has finished every submitted frame
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        self.scheduler.wait_idle()?;
        Ok(())
    }

    /// Mesh bank, read-only
    pub fn mesh_bank(&self) -> &MeshBank {
        &self.bank
    }

    /// Mesh bank for adding meshes before upload
    pub fn mesh_bank_mut(&mut self) -> &mut MeshBank {
        &mut self.bank
    }

    /// Features active for this renderer
    pub fn features(&self) -> RenderFeatures {
        self.features
    }

    /// Configuration the renderer was created with
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.scheduler.extent()
    }

    /// Frames begun so far
    pub fn frame_number(&self) -> u64 {
        self.scheduler.frame_number()
    }

    /// Result of the last CPU culling run (CPU culling mode only)
    pub fn last_cull_stats(&self) -> Option<CullStats> {
        self.last_cull_stats
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.wait_idle() {
            log::error!("Device wait failed during renderer teardown: {}", e);
        }
        let allocator = self.scheduler.backend_mut().allocator_mut();
        if let Some(mut passes) = self.passes.take() {
            for pass in passes.passes_mut() {
                pass.cleanup(allocator);
            }
        }
        if let Some(mut acceleration) = self.acceleration.take() {
            acceleration.destroy(allocator);
        }
        if let Some(mut draw) = self.draw.take() {
            draw.destroy(allocator);
        }
        if let Some(mesh_buffers) = self.mesh_buffers.take() {
            mesh_buffers.destroy(allocator);
        }
        for frame in self.frames.drain(..) {
            frame.destroy(allocator);
        }
        log::debug!("Renderer resources released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_grows_to_power_of_two() {
        assert_eq!(grown_capacity(64, 10), 64);
        assert_eq!(grown_capacity(64, 64), 64);
        assert_eq!(grown_capacity(64, 65), 128);
        assert_eq!(grown_capacity(1, 300), 512);
    }

    #[test]
    fn test_descriptor_config_adds_tlas_ratio_for_shadows() {
        let config = RendererConfig::default();
        let plain = descriptor_config(&config, RenderFeatures::GPU_CULLING);
        assert_eq!(plain, config.descriptors);

        let shadows = descriptor_config(&config, RenderFeatures::DEFERRED | RenderFeatures::RAY_TRACED_SHADOWS);
        let tlas: Vec<_> = shadows
            .ratios
            .iter()
            .filter(|r| r.kind == DescriptorKind::AccelerationStructure)
            .collect();
        assert_eq!(tlas.len(), 1);

        let again = RendererConfig {
            descriptors: shadows.clone(),
            ..RendererConfig::default()
        };
        assert_eq!(descriptor_config(&again, RenderFeatures::RAY_TRACED_SHADOWS).ratios.len(), shadows.ratios.len());
    }
}
