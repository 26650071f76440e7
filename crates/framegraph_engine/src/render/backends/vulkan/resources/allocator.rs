//! GPU resource allocator
//!
//! Buffers and images are sub-allocated through `gpu-allocator` and stored in
//! generational arenas; callers hold [`BufferId`] / [`ImageId`] keys rather
//! than raw handles. A default (null) key or a key whose resource was already
//! destroyed is simply ignored by the destroy calls.
//!
//! Allocation failure is unrecoverable for the renderer: the create calls log
//! and panic instead of returning an error.
//!
//! Immediate submission runs one-off command buffers on the graphics or
//! transfer queue and blocks until they finish. Device-local data is only
//! ever initialized through [`ResourceAllocator::create_and_map_buffer`],
//! which stages through a host-visible buffer on the transfer queue.

use ash::{vk, Device};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use slotmap::{new_key_type, SlotMap};

use crate::foundation::logging::fatal;
use crate::render::backends::vulkan::{VulkanContext, VulkanError, VulkanResult};

new_key_type! {
    /// Handle to a buffer owned by [`ResourceAllocator`]
    pub struct BufferId;
    /// Handle to an image owned by [`ResourceAllocator`]
    pub struct ImageId;
}

/// Fence timeout for immediate submissions (ten seconds)
pub const IMMEDIATE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Queue an immediate command runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// Graphics + compute queue
    Graphics,
    /// Transfer queue (aliases graphics when the device has no transfer family)
    Transfer,
}

/// A buffer and its memory
pub struct AllocatedBuffer {
    /// Vulkan handle
    pub buffer: vk::Buffer,
    /// Size requested at creation
    pub size: vk::DeviceSize,
    /// Usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory location
    pub location: MemoryLocation,
    /// Device address, when created with `SHADER_DEVICE_ADDRESS`
    pub device_address: Option<vk::DeviceAddress>,
    allocation: Option<Allocation>,
}

impl AllocatedBuffer {
    /// Persistently mapped contents for host-visible buffers
    pub fn mapped(&self) -> Option<&[u8]> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .map(|slice| &slice[..self.size as usize])
    }

    fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size as usize;
        self.allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .map(|slice| &mut slice[..size])
    }
}

/// An image, its memory and views
pub struct AllocatedImage {
    /// Vulkan handle
    pub image: vk::Image,
    /// View over every mip level
    pub view: vk::ImageView,
    /// One view per mip level (empty until requested)
    pub mip_views: Vec<vk::ImageView>,
    /// Image extent
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Aspect used for views and barriers
    pub aspect: vk::ImageAspectFlags,
    /// Mip level count
    pub mip_levels: u32,
    allocation: Option<Allocation>,
}

struct ImmediateContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
    queue: vk::Queue,
    recording: bool,
}

impl ImmediateContext {
    fn new(device: &Device, family: u32, queue: vk::Queue) -> VulkanResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None).map_err(VulkanError::Api)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { device.allocate_command_buffers(&alloc_info).map_err(VulkanError::Api)?[0] };

        let fence = unsafe {
            device
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { pool, buffer, fence, queue, recording: false })
    }

    unsafe fn destroy(&self, device: &Device) {
        device.destroy_fence(self.fence, None);
        device.destroy_command_pool(self.pool, None);
    }
}

/// Owner of every buffer and image the renderer creates
pub struct ResourceAllocator {
    device: Device,
    allocator: Option<Allocator>,
    buffers: SlotMap<BufferId, AllocatedBuffer>,
    images: SlotMap<ImageId, AllocatedImage>,
    graphics: ImmediateContext,
    transfer: ImmediateContext,
    sharing_families: Vec<u32>,
    buffer_device_address: bool,
}

impl ResourceAllocator {
    /// Create the allocator and immediate-submit contexts for a device
    pub fn new(context: &VulkanContext) -> VulkanResult<Self> {
        let device = context.raw_device();
        let buffer_device_address = context.ray_tracing_enabled();

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance().clone(),
            device: device.clone(),
            physical_device: context.physical_device.device,
            debug_settings: AllocatorDebugSettings::default(),
            buffer_device_address,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(|e| VulkanError::InitializationFailed(format!("gpu-allocator: {e}")))?;

        let families = context.device.families;
        let graphics = ImmediateContext::new(&device, families.graphics, context.device.graphics_queue)?;
        let transfer = ImmediateContext::new(&device, context.device.transfer_family(), context.device.transfer_queue)?;

        let mut sharing_families = vec![families.graphics];
        if let Some(t) = families.transfer {
            sharing_families.push(t);
        }

        log::debug!("Resource allocator ready (buffer device address: {})", buffer_device_address);
        Ok(Self {
            device,
            allocator: Some(allocator),
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            graphics,
            transfer,
            sharing_families,
            buffer_device_address,
        })
    }

    fn allocate(&mut self, name: &str, requirements: vk::MemoryRequirements, location: MemoryLocation, linear: bool) -> Allocation {
        let Some(allocator) = self.allocator.as_mut() else {
            fatal(format!("allocation of '{name}' after allocator teardown"));
        };
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .unwrap_or_else(|e| fatal(format!("failed to allocate {} bytes for '{name}': {e}", requirements.size)))
    }

    fn free(&mut self, allocation: Option<Allocation>) {
        if let (Some(allocator), Some(allocation)) = (self.allocator.as_mut(), allocation) {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free allocation: {}", e);
            }
        }
    }

    /// Create a buffer; aborts on failure
    pub fn create_buffer(&mut self, size: vk::DeviceSize, usage: vk::BufferUsageFlags, location: MemoryLocation, name: &str) -> BufferId {
        let size = size.max(4);
        let mut usage = usage;
        if self.buffer_device_address && usage.intersects(vk::BufferUsageFlags::STORAGE_BUFFER) {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let mut info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        info = if self.sharing_families.len() > 1 {
            info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&self.sharing_families)
        } else {
            info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .unwrap_or_else(|e| fatal(format!("vkCreateBuffer failed for '{name}': {e:?}")));
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocate(name, requirements, location, true);

        unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
            .unwrap_or_else(|e| fatal(format!("vkBindBufferMemory failed for '{name}': {e:?}")));

        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        });

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);
        self.buffers.insert(AllocatedBuffer {
            buffer,
            size,
            usage,
            location,
            device_address,
            allocation: Some(allocation),
        })
    }

    /// Destroy a buffer; null and stale ids are ignored
    pub fn destroy_buffer(&mut self, id: BufferId) {
        let Some(mut buffer) = self.buffers.remove(id) else {
            return;
        };
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free(buffer.allocation.take());
    }

    /// Buffer record
    pub fn buffer(&self, id: BufferId) -> Option<&AllocatedBuffer> {
        self.buffers.get(id)
    }

    /// Vulkan handle, or null for unknown ids
    pub fn buffer_handle(&self, id: BufferId) -> vk::Buffer {
        self.buffers.get(id).map_or(vk::Buffer::null(), |b| b.buffer)
    }

    /// Size in bytes, or zero for unknown ids
    pub fn buffer_size(&self, id: BufferId) -> vk::DeviceSize {
        self.buffers.get(id).map_or(0, |b| b.size)
    }

    /// Copy bytes into a host-visible buffer
    pub fn write_buffer(&mut self, id: BufferId, offset: usize, bytes: &[u8]) -> VulkanResult<()> {
        let buffer = self
            .buffers
            .get_mut(id)
            .ok_or(VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() })?;
        let mapped = buffer.mapped_mut().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "buffer is not host visible".to_string(),
        })?;
        let end = offset + bytes.len();
        if end > mapped.len() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("write of {} bytes at {} overflows buffer of {}", bytes.len(), offset, mapped.len()),
            });
        }
        mapped[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Mapped contents of a host-visible buffer
    pub fn mapped_bytes(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(id).and_then(|b| b.mapped())
    }

    /// Create a device-local buffer initialized with `bytes` via a staging copy
    ///
    /// Blocks until the copy completes on the transfer queue.
    pub fn create_and_map_buffer(&mut self, bytes: &[u8], usage: vk::BufferUsageFlags, name: &str) -> VulkanResult<BufferId> {
        let size = bytes.len() as vk::DeviceSize;
        let destination = self.create_buffer(size, usage | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly, name);
        if bytes.is_empty() {
            return Ok(destination);
        }

        let staging = self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu, &format!("{name} staging"));
        let result = self.write_buffer(staging, 0, bytes).and_then(|_| {
            let src = self.buffer_handle(staging);
            let dst = self.buffer_handle(destination);
            self.immediate_submit(QueueType::Transfer, |device, cmd| unsafe {
                let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
                device.cmd_copy_buffer(cmd, src, dst, &[region]);
            })
        });
        self.destroy_buffer(staging);

        if let Err(e) = result {
            self.destroy_buffer(destination);
            return Err(e);
        }
        log::debug!("Uploaded {} bytes into '{}'", size, name);
        Ok(destination)
    }

    /// Create a 2D image with a view over all mip levels; aborts on failure
    pub fn create_image(
        &mut self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        name: &str,
    ) -> ImageId {
        let mip_levels = mip_levels.max(1);
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: extent.width.max(1), height: extent.height.max(1), depth: 1 })
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None) }
            .unwrap_or_else(|e| fatal(format!("vkCreateImage failed for '{name}': {e:?}")));
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.allocate(name, requirements, MemoryLocation::GpuOnly, false);
        unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .unwrap_or_else(|e| fatal(format!("vkBindImageMemory failed for '{name}': {e:?}")));

        let view = self
            .create_view(image, format, aspect, 0, mip_levels)
            .unwrap_or_else(|e| fatal(format!("image view for '{name}': {e}")));

        log::debug!("Created image '{}' {}x{} {:?} ({} mips)", name, extent.width, extent.height, format, mip_levels);
        self.images.insert(AllocatedImage {
            image,
            view,
            mip_views: Vec::new(),
            extent,
            format,
            aspect,
            mip_levels,
            allocation: Some(allocation),
        })
    }

    fn create_view(&self, image: vk::Image, format: vk::Format, aspect: vk::ImageAspectFlags, base_mip: u32, levels: u32) -> VulkanResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: base_mip,
                level_count: levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.create_image_view(&info, None).map_err(VulkanError::Api) }
    }

    /// Create one view per mip level (no-op if already present)
    pub fn create_mip_views(&mut self, id: ImageId) -> VulkanResult<()> {
        let (image, format, aspect, levels) = match self.images.get(id) {
            Some(img) if img.mip_views.is_empty() => (img.image, img.format, img.aspect, img.mip_levels),
            Some(_) => return Ok(()),
            None => return Err(VulkanError::ResourceNotFound { id: slotmap::Key::data(&id).as_ffi() }),
        };
        let views = (0..levels)
            .map(|level| self.create_view(image, format, aspect, level, 1))
            .collect::<VulkanResult<Vec<_>>>()?;
        if let Some(img) = self.images.get_mut(id) {
            img.mip_views = views;
        }
        Ok(())
    }

    /// Image record
    pub fn image(&self, id: ImageId) -> Option<&AllocatedImage> {
        self.images.get(id)
    }

    /// Destroy an image and its views; null and stale ids are ignored
    pub fn destroy_image(&mut self, id: ImageId) {
        let Some(mut image) = self.images.remove(id) else {
            return;
        };
        unsafe {
            for view in image.mip_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        self.free(image.allocation.take());
    }

    fn immediate(&mut self, queue: QueueType) -> &mut ImmediateContext {
        match queue {
            QueueType::Graphics => &mut self.graphics,
            QueueType::Transfer => &mut self.transfer,
        }
    }

    /// Reset and begin the queue's immediate command buffer
    pub fn start_immediate_command(&mut self, queue: QueueType) -> VulkanResult<vk::CommandBuffer> {
        let device = self.device.clone();
        let ctx = self.immediate(queue);
        if ctx.recording {
            return Err(VulkanError::InvalidOperation {
                reason: format!("immediate command on {queue:?} already recording"),
            });
        }
        unsafe {
            device
                .reset_command_buffer(ctx.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(ctx.buffer, &begin).map_err(VulkanError::Api)?;
        }
        ctx.recording = true;
        Ok(ctx.buffer)
    }

    /// End, submit and wait for the queue's immediate command buffer
    pub fn end_and_submit_immediate_command(&mut self, queue: QueueType) -> VulkanResult<()> {
        let device = self.device.clone();
        let ctx = self.immediate(queue);
        if !ctx.recording {
            return Err(VulkanError::InvalidOperation {
                reason: format!("no immediate command recording on {queue:?}"),
            });
        }
        ctx.recording = false;
        unsafe {
            device.end_command_buffer(ctx.buffer).map_err(VulkanError::Api)?;
            let buffers = [ctx.buffer];
            let submit = vk::SubmitInfo::builder().command_buffers(&buffers).build();
            device.queue_submit(ctx.queue, &[submit], ctx.fence).map_err(VulkanError::Api)?;
            device
                .wait_for_fences(&[ctx.fence], true, IMMEDIATE_TIMEOUT_NS)
                .map_err(VulkanError::Api)?;
            device.reset_fences(&[ctx.fence]).map_err(VulkanError::Api)?;
        }
        Ok(())
    }

    /// Record with `record`, then submit and wait
    pub fn immediate_submit<F>(&mut self, queue: QueueType, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer),
    {
        let cmd = self.start_immediate_command(queue)?;
        record(&self.device, cmd);
        self.end_and_submit_immediate_command(queue)
    }

    /// Device the resources belong to
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Live buffer count
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Live image count
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for ResourceAllocator {
    fn drop(&mut self) {
        let buffer_ids: Vec<BufferId> = self.buffers.keys().collect();
        for id in buffer_ids {
            self.destroy_buffer(id);
        }
        let image_ids: Vec<ImageId> = self.images.keys().collect();
        for id in image_ids {
            self.destroy_image(id);
        }
        unsafe {
            self.graphics.destroy(&self.device);
            self.transfer.destroy(&self.device);
        }
        // Allocator must go before the device
        self.allocator.take();
        log::debug!("Resource allocator destroyed");
    }
}
