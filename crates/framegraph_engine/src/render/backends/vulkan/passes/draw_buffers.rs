//! GPU side of the indirect draw command set
//!
//! Shared between slots: the host-visible template buffer and the mesh-info
//! buffer. Per slot: the working command buffer the culling pass increments
//! and the indirect draws read, and the instance-to-object array. Every
//! frame starts by copying templates over the slot's working buffer.
//!
//! In CPU culling mode the per-slot buffers are host-visible and written
//! directly by [`crate::render::culling::CpuCuller`].

use ash::{vk, Device};
use gpu_allocator::MemoryLocation;

use crate::render::backends::vulkan::resources::{BufferId, ResourceAllocator};
use crate::render::backends::vulkan::state::sync::{pipeline_barrier, MemoryBarrierBuilder};
use crate::render::backends::vulkan::VulkanResult;
use crate::render::culling::{CpuCuller, CullStats, ViewFrustum};
use crate::render::draw_commands::{DrawCommandSet, MeshInstanceCounts};
use crate::render::error::RenderResult;
use crate::render::gpu_types::{DrawIndexedIndirectCommand, GpuMeshInfo, ObjectData};
use crate::render::mesh_bank::MeshBank;

struct SlotDraws {
    working: BufferId,
    instance_to_object: BufferId,
}

/// Template, working, mesh-info and instance buffers
pub struct DrawBuffers {
    set: DrawCommandSet,
    templates: BufferId,
    mesh_info: BufferId,
    slots: Vec<SlotDraws>,
    host_visible: bool,
    instance_capacity: u32,
}

fn command_bytes(count: usize) -> vk::DeviceSize {
    (count.max(1) * std::mem::size_of::<DrawIndexedIndirectCommand>()) as vk::DeviceSize
}

impl DrawBuffers {
    /// Build templates for the bank and allocate every buffer
    ///
    /// `host_visible` keeps working and instance buffers CPU-writable for
    /// the CPU culling mode.
    pub fn build_draw_commands(allocator: &mut ResourceAllocator, bank: &MeshBank, slot_count: usize, host_visible: bool) -> VulkanResult<Self> {
        let set = DrawCommandSet::build(bank);
        let templates = allocator.create_buffer(
            command_bytes(set.len()),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "draw command templates",
        );
        allocator.write_buffer(templates, 0, bytemuck::cast_slice(set.templates()))?;

        let mesh_info = allocator.create_buffer(
            (set.ranges().len().max(1) * std::mem::size_of::<GpuMeshInfo>()) as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
            "mesh info",
        );

        let location = if host_visible { MemoryLocation::CpuToGpu } else { MemoryLocation::GpuOnly };
        let slots = (0..slot_count)
            .map(|slot| SlotDraws {
                working: allocator.create_buffer(
                    command_bytes(set.len()),
                    vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                    location,
                    &format!("draw commands {slot}"),
                ),
                instance_to_object: allocator.create_buffer(
                    std::mem::size_of::<u32>() as vk::DeviceSize,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                    location,
                    &format!("instance to object {slot}"),
                ),
            })
            .collect();

        let mut buffers = Self {
            set,
            templates,
            mesh_info,
            slots,
            host_visible,
            instance_capacity: 1,
        };
        buffers.upload_mesh_info(allocator)?;
        Ok(buffers)
    }

    fn upload_mesh_info(&mut self, allocator: &mut ResourceAllocator) -> VulkanResult<()> {
        let infos = self.set.mesh_infos();
        allocator.write_buffer(self.mesh_info, 0, bytemuck::cast_slice(&infos))
    }

    /// Re-reserve instance ranges for a new population
    ///
    /// Re-uploads templates and mesh info and grows the instance buffers when
    /// needed; returns true when instance buffers were replaced and descriptor
    /// sets must be relinked. The device must be idle.
    pub fn update_draw_instance_counts(&mut self, allocator: &mut ResourceAllocator, counts: &MeshInstanceCounts) -> RenderResult<bool> {
        self.set.update_instance_counts(counts)?;
        allocator.write_buffer(self.templates, 0, bytemuck::cast_slice(self.set.templates()))?;
        self.upload_mesh_info(allocator)?;

        let needed = self.set.instance_buffer_len();
        if needed <= self.instance_capacity {
            return Ok(false);
        }

        let location = if self.host_visible { MemoryLocation::CpuToGpu } else { MemoryLocation::GpuOnly };
        for (slot, draws) in self.slots.iter_mut().enumerate() {
            allocator.destroy_buffer(draws.instance_to_object);
            draws.instance_to_object = allocator.create_buffer(
                needed as vk::DeviceSize * std::mem::size_of::<u32>() as vk::DeviceSize,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                location,
                &format!("instance to object {slot}"),
            );
        }
        log::debug!("Instance-to-object buffers grown from {} to {} entries", self.instance_capacity, needed);
        self.instance_capacity = needed;
        Ok(true)
    }

    /// Copy templates over the slot's working buffer and make it visible to compute
    pub fn reset_draw_commands(&self, device: &Device, allocator: &ResourceAllocator, cmd: vk::CommandBuffer, slot: usize) {
        if self.set.is_empty() {
            return;
        }
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: command_bytes(self.set.len()),
        };
        unsafe {
            device.cmd_copy_buffer(
                cmd,
                allocator.buffer_handle(self.templates),
                allocator.buffer_handle(self.slots[slot].working),
                &[region],
            );
        }
        pipeline_barrier(
            device,
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            &[MemoryBarrierBuilder::buffer_transfer_to_compute()],
            &[],
        );
    }

    /// Run visibility on the CPU straight into the slot's host-visible buffers
    pub fn cull_on_cpu(
        &self,
        allocator: &mut ResourceAllocator,
        slot: usize,
        frustum: Option<&ViewFrustum>,
        objects: &[ObjectData],
    ) -> VulkanResult<CullStats> {
        let mut commands = self.set.templates().to_vec();
        let mut instance_to_object = vec![0u32; self.set.instance_buffer_len() as usize];
        let stats = CpuCuller::cull(frustum, objects, &self.set.mesh_infos(), &self.set, &mut commands, &mut instance_to_object);

        allocator.write_buffer(self.slots[slot].working, 0, bytemuck::cast_slice(&commands))?;
        allocator.write_buffer(self.slots[slot].instance_to_object, 0, bytemuck::cast_slice(&instance_to_object))?;
        Ok(stats)
    }

    /// CPU command set
    pub fn draw_set(&self) -> &DrawCommandSet {
        &self.set
    }

    /// Number of indirect commands
    pub fn command_count(&self) -> u32 {
        self.set.len() as u32
    }

    /// Slot's working command buffer
    pub fn working(&self, slot: usize) -> BufferId {
        self.slots[slot].working
    }

    /// Slot's instance-to-object buffer
    pub fn instance_to_object(&self, slot: usize) -> BufferId {
        self.slots[slot].instance_to_object
    }

    /// Mesh-info buffer
    pub fn mesh_info(&self) -> BufferId {
        self.mesh_info
    }

    /// Release every buffer
    pub fn destroy(&mut self, allocator: &mut ResourceAllocator) {
        allocator.destroy_buffer(self.templates);
        allocator.destroy_buffer(self.mesh_info);
        for draws in self.slots.drain(..) {
            allocator.destroy_buffer(draws.working);
            allocator.destroy_buffer(draws.instance_to_object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_buffer_never_empty() {
        assert_eq!(command_bytes(0), 20);
        assert_eq!(command_bytes(3), 60);
    }
}
