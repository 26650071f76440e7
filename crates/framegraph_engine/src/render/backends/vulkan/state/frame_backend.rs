//! Vulkan implementation of the frame ring
//!
//! [`VulkanFrameBackend`] owns everything the frame scheduler touches: the
//! device context, the resource allocator, the swapchain with its depth
//! attachment, and one [`FrameSlot`] per frame in flight. Field order is the
//! teardown order; the device is idled before any of it is released.
//!
//! Render-finished semaphores belong to swapchain images rather than slots:
//! the presentation engine may still be waiting on the semaphore of the image
//! a slot used last time round.
//!
//! The depth attachment is kept in `DEPTH_ATTACHMENT_OPTIMAL` between frames
//! so the next frame's depth pyramid can read it.

use ash::{vk, Device};

use crate::core::config::PresentModePreference;
use crate::render::backends::vulkan::resources::{AllocatedImage, ImageId, QueueType, ResourceAllocator};
use crate::render::backends::vulkan::state::swapchain::Swapchain;
use crate::render::backends::vulkan::state::sync::{image_barrier, pipeline_barrier, Fence, Semaphore};
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};
use crate::render::frame::{AcquireOutcome, FrameBackend, PresentOutcome};

/// Depth attachment format
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Per-frame command recording and synchronization
pub struct FrameSlot {
    device: Device,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    acquire: Semaphore,
    in_flight: Fence,
}

impl FrameSlot {
    fn new(device: Device, family: u32) -> VulkanResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None).map_err(VulkanError::Api)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(VulkanError::Api(e));
            }
        };

        Ok(Self {
            acquire: Semaphore::new(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
            device,
            command_pool,
            command_buffer,
        })
    }

    /// Primary command buffer
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Device-side state behind [`crate::render::frame::FrameScheduler`]
pub struct VulkanFrameBackend {
    slots: Vec<FrameSlot>,
    render_finished: Vec<Semaphore>,
    swapchain: Option<Swapchain>,
    depth: Option<ImageId>,
    present_mode: PresentModePreference,
    allocator: ResourceAllocator,
    context: VulkanContext,
}

impl VulkanFrameBackend {
    /// Create `slot_count` frame slots, the swapchain and the depth attachment
    pub fn new(
        context: VulkanContext,
        slot_count: usize,
        extent: vk::Extent2D,
        present_mode: PresentModePreference,
    ) -> VulkanResult<(Self, vk::Extent2D)> {
        let allocator = ResourceAllocator::new(&context)?;
        let device = context.raw_device();
        let family = context.graphics_queue_family();
        let slots = (0..slot_count)
            .map(|_| FrameSlot::new(device.clone(), family))
            .collect::<VulkanResult<Vec<_>>>()?;

        let mut backend = Self {
            slots,
            render_finished: Vec::new(),
            swapchain: None,
            depth: None,
            present_mode,
            allocator,
            context,
        };
        let extent = backend.create_swapchain(extent)?;
        backend.create_depth_resource(extent)?;
        log::info!("Frame ring ready with {} slots", slot_count);
        Ok((backend, extent))
    }

    /// Device context
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.context.device.device
    }

    /// Resource allocator
    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    /// Mutable resource allocator
    pub fn allocator_mut(&mut self) -> &mut ResourceAllocator {
        &mut self.allocator
    }

    /// Context and allocator borrowed together
    pub fn split_mut(&mut self) -> (&VulkanContext, &mut ResourceAllocator) {
        (&self.context, &mut self.allocator)
    }

    /// Live swapchain
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// Swapchain color format
    pub fn color_format(&self) -> vk::Format {
        self.swapchain.as_ref().map_or(vk::Format::B8G8R8A8_SRGB, |s| s.format().format)
    }

    /// Image and view of a swapchain image
    pub fn swapchain_target(&self, image_index: u32) -> Option<(vk::Image, vk::ImageView)> {
        let swapchain = self.swapchain.as_ref()?;
        let i = image_index as usize;
        Some((*swapchain.images().get(i)?, *swapchain.image_views().get(i)?))
    }

    /// Depth attachment
    pub fn depth_image(&self) -> Option<&AllocatedImage> {
        self.depth.and_then(|id| self.allocator.image(id))
    }

    // End the slot's command buffer, submit it against the acquire semaphore and present
    fn submit_slot_and_present(&self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome> {
        let device = self.device();
        let frame = &self.slots[slot];
        let cmd = frame.command_buffer;
        let render_finished = self.render_finished[image_index as usize].handle();
        let wait_semaphores = [frame.acquire.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device.end_command_buffer(cmd).map_err(VulkanError::Api)?;
            device
                .queue_submit(self.context.device.graphics_queue, &[submit_info], frame.in_flight.handle())
                .map_err(VulkanError::Api)?;
        }

        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(PresentOutcome::OutOfDate);
        };
        match swapchain.present(self.context.device.present_queue, image_index, render_finished) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }
}

impl FrameBackend for VulkanFrameBackend {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn wait_for_slot(&mut self, slot: usize) -> VulkanResult<()> {
        self.slots[slot].in_flight.wait(u64::MAX)
    }

    fn acquire_image(&mut self, slot: usize) -> VulkanResult<AcquireOutcome> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        match swapchain.acquire_next_image(self.slots[slot].acquire.handle()) {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    fn reset_slot_fence(&mut self, slot: usize) -> VulkanResult<()> {
        self.slots[slot].in_flight.reset()
    }

    fn begin_commands(&mut self, slot: usize, image_index: u32, extent: vk::Extent2D) -> VulkanResult<vk::CommandBuffer> {
        let (image, _) = self.swapchain_target(image_index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("no swapchain image {image_index}"),
        })?;
        let device = self.device();
        let cmd = self.slots[slot].command_buffer;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info).map_err(VulkanError::Api)?;

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        pipeline_barrier(
            device,
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            &[],
            &[image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )],
        );
        Ok(cmd)
    }

    fn submit_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome> {
        let (image, _) = self.swapchain_target(image_index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("no swapchain image {image_index}"),
        })?;
        let device = self.device();
        let cmd = self.slots[slot].command_buffer;

        pipeline_barrier(
            device,
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::AccessFlags::empty(),
            )],
        );

        self.submit_slot_and_present(slot, image_index)
    }

    fn discard_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome> {
        let (image, _) = self.swapchain_target(image_index).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("no swapchain image {image_index}"),
        })?;
        let device = self.device();
        let cmd = self.slots[slot].command_buffer;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info).map_err(VulkanError::Api)?;
        }
        pipeline_barrier(
            device,
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::empty(),
                vk::AccessFlags::empty(),
            )],
        );
        log::debug!("Slot {} recording discarded; presenting image {} unchanged", slot, image_index);
        self.submit_slot_and_present(slot, image_index)
    }

    fn wait_idle(&mut self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle().map_err(VulkanError::Api) }
    }

    fn destroy_depth_resource(&mut self) {
        if let Some(depth) = self.depth.take() {
            self.allocator.destroy_image(depth);
        }
    }

    fn destroy_swapchain(&mut self) {
        self.render_finished.clear();
        self.swapchain = None;
    }

    fn create_swapchain(&mut self, requested: vk::Extent2D) -> VulkanResult<vk::Extent2D> {
        let swapchain = Swapchain::new(&self.context, requested, self.present_mode)?;
        let device = self.context.raw_device();
        self.render_finished = (0..swapchain.image_count())
            .map(|_| Semaphore::new(device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;
        let extent = swapchain.extent();
        self.swapchain = Some(swapchain);
        Ok(extent)
    }

    fn create_depth_resource(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        let depth = self.allocator.create_image(
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
            1,
            "depth",
        );
        let image = self.allocator.image(depth).map_or(vk::Image::null(), |i| i.image);
        self.depth = Some(depth);

        self.allocator.immediate_submit(QueueType::Graphics, |device, cmd| {
            pipeline_barrier(
                device,
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                &[],
                &[image_barrier(
                    image,
                    vk::ImageAspectFlags::DEPTH,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )],
            );
        })
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("Device wait failed during frame ring teardown: {}", e);
        }
        self.destroy_depth_resource();
        self.destroy_swapchain();
    }
}
