//! GPU copies of the mesh bank's shared vertex and index storage

use ash::vk;

use crate::render::backends::vulkan::resources::{BufferId, ResourceAllocator};
use crate::render::error::RenderResult;
use crate::render::mesh_bank::MeshBank;

/// Device-local vertex and index buffers for every mesh in a bank
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    /// Shared vertex buffer
    pub vertex_buffer: BufferId,
    /// Shared index buffer (u32 indices)
    pub index_buffer: BufferId,
    /// Vertex buffer device address (ray tracing only)
    pub vertex_address: Option<vk::DeviceAddress>,
    /// Index buffer device address (ray tracing only)
    pub index_address: Option<vk::DeviceAddress>,
    /// Bytes per vertex
    pub vertex_stride: u32,
    /// Vertices uploaded
    pub vertex_count: u32,
    /// Indices uploaded
    pub index_count: u32,
}

impl MeshBuffers {
    /// Bind both buffers for indexed drawing
    pub fn bind(&self, device: &ash::Device, allocator: &ResourceAllocator, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[allocator.buffer_handle(self.vertex_buffer)], &[0]);
            device.cmd_bind_index_buffer(cmd, allocator.buffer_handle(self.index_buffer), 0, vk::IndexType::UINT32);
        }
    }

    /// Release both buffers
    pub fn destroy(&self, allocator: &mut ResourceAllocator) {
        allocator.destroy_buffer(self.vertex_buffer);
        allocator.destroy_buffer(self.index_buffer);
    }
}

/// Upload the bank once; later `add_mesh` calls on the bank fail
pub fn build_mesh_buffers(
    allocator: &mut ResourceAllocator,
    bank: &mut MeshBank,
    ray_tracing: bool,
) -> RenderResult<MeshBuffers> {
    bank.seal_for_upload()?;

    let mut vertex_usage = vk::BufferUsageFlags::VERTEX_BUFFER;
    let mut index_usage = vk::BufferUsageFlags::INDEX_BUFFER;
    if ray_tracing {
        let as_input =
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        vertex_usage |= as_input;
        index_usage |= as_input;
    }

    let vertex_buffer = allocator.create_and_map_buffer(bank.vertex_bytes(), vertex_usage, "mesh vertices")?;
    let index_buffer = allocator.create_and_map_buffer(bytemuck::cast_slice(bank.indices()), index_usage, "mesh indices")?;

    let address = |id| allocator.buffer(id).and_then(|b| b.device_address);
    let buffers = MeshBuffers {
        vertex_buffer,
        index_buffer,
        vertex_address: address(vertex_buffer),
        index_address: address(index_buffer),
        vertex_stride: bank.layout().stride,
        vertex_count: bank.vertex_count(),
        index_count: bank.indices().len() as u32,
    };

    log::info!(
        "Uploaded mesh bank: {} meshes, {} vertices, {} indices",
        bank.len(),
        buffers.vertex_count,
        buffers.index_count
    );
    Ok(buffers)
}
