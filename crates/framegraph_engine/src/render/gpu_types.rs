//! GPU-visible data layouts
//!
//! These structs are copied byte-for-byte into storage and uniform buffers,
//! so every field order and padding here mirrors the GLSL declarations in
//! `resources/shaders/common.glsl`.

use crate::foundation::math::{mat4_to_cols, normal_matrix, Mat4, Vec3};

/// `VkDrawIndexedIndirectCommand`, 20 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawIndexedIndirectCommand {
    /// Indices per instance
    pub index_count: u32,
    /// Instances to draw; incremented by culling
    pub instance_count: u32,
    /// First index in the shared index buffer
    pub first_index: u32,
    /// Added to each index before fetching a vertex
    pub vertex_offset: i32,
    /// Base into the instance-to-object array
    pub first_instance: u32,
}

/// Per-instance object record (std430, 160 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectData {
    /// World transform
    pub model: [[f32; 4]; 4],
    /// Inverse-transpose of the model matrix for normals
    pub normal_matrix: [[f32; 4]; 4],
    /// Non-uniform world scale, w unused
    pub scale: [f32; 4],
    /// Mesh id
    pub mesh_id: u32,
    /// Material id
    pub material_id: u32,
    /// Mesh vertex offset in the shared vertex buffer
    pub vertex_offset: u32,
    /// Mesh first index in the shared index buffer
    pub first_index: u32,
}

impl ObjectData {
    /// Pack a world transform and mesh placement
    pub fn new(model: &Mat4, scale: &Vec3, mesh_id: u32, material_id: u32, vertex_offset: u32, first_index: u32) -> Self {
        Self {
            model: mat4_to_cols(model),
            normal_matrix: mat4_to_cols(&normal_matrix(model)),
            scale: [scale.x, scale.y, scale.z, 0.0],
            mesh_id,
            material_id,
            vertex_offset,
            first_index,
        }
    }

    /// World transform as a matrix
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from(self.model)
    }

    /// World scale as a vector
    pub fn scale_vec(&self) -> Vec3 {
        Vec3::new(self.scale[0], self.scale[1], self.scale[2])
    }
}

/// Per-frame camera block (std140, 224 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneUniforms {
    /// View matrix
    pub view: [[f32; 4]; 4],
    /// Projection matrix
    pub projection: [[f32; 4]; 4],
    /// Projection * view
    pub view_projection: [[f32; 4]; 4],
    /// Camera world position, w = 1
    pub camera_position: [f32; 4],
    /// Directional lights in the light buffer
    pub light_count: u32,
    /// Objects in the object buffer
    pub object_count: u32,
    /// Nonzero when the shadow mask is valid this frame
    pub shadows_enabled: u32,
    /// Padding
    pub _padding: u32,
}

/// Directional light (std430, 32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightData {
    /// Direction the light travels, w unused
    pub direction: [f32; 4],
    /// Linear color times intensity, w unused
    pub color: [f32; 4],
}

/// Per-mesh data the culling shader needs (std430, 32 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuMeshInfo {
    /// Object-space bounding sphere `(center, radius)`
    pub sphere: [f32; 4],
    /// Index of the mesh's first draw command
    pub first_command: u32,
    /// Number of draw commands (surfaces)
    pub command_count: u32,
    /// Instance slots reserved for this mesh
    pub reserved_instances: u32,
    /// Padding
    pub _padding: u32,
}

/// Cull flag: test against the view frustum
pub const CULL_FLAG_FRUSTUM: u32 = 1;
/// Cull flag: test against the depth pyramid
pub const CULL_FLAG_OCCLUSION: u32 = 1 << 1;

/// Visibility pass inputs (std140, 256 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullUniforms {
    /// View matrix
    pub view: [[f32; 4]; 4],
    /// Projection matrix
    pub projection: [[f32; 4]; 4],
    /// Normalized frustum planes `(normal, distance)`
    pub frustum: [[f32; 4]; 6],
    /// Depth pyramid base width
    pub pyramid_width: f32,
    /// Depth pyramid base height
    pub pyramid_height: f32,
    /// Near plane distance
    pub z_near: f32,
    /// Objects to test
    pub object_count: u32,
    /// `CULL_FLAG_*` bits
    pub flags: u32,
    /// Padding
    pub _padding: [u32; 3],
}

unsafe impl bytemuck::Pod for DrawIndexedIndirectCommand {}
unsafe impl bytemuck::Zeroable for DrawIndexedIndirectCommand {}

unsafe impl bytemuck::Pod for ObjectData {}
unsafe impl bytemuck::Zeroable for ObjectData {}

unsafe impl bytemuck::Pod for SceneUniforms {}
unsafe impl bytemuck::Zeroable for SceneUniforms {}

unsafe impl bytemuck::Pod for LightData {}
unsafe impl bytemuck::Zeroable for LightData {}

unsafe impl bytemuck::Pod for GpuMeshInfo {}
unsafe impl bytemuck::Zeroable for GpuMeshInfo {}

unsafe impl bytemuck::Pod for CullUniforms {}
unsafe impl bytemuck::Zeroable for CullUniforms {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_gpu_struct_sizes_match_shader_layouts() {
        assert_eq!(size_of::<DrawIndexedIndirectCommand>(), 20);
        assert_eq!(size_of::<ObjectData>(), 160);
        assert_eq!(size_of::<SceneUniforms>(), 224);
        assert_eq!(size_of::<LightData>(), 32);
        assert_eq!(size_of::<GpuMeshInfo>(), 32);
        assert_eq!(size_of::<CullUniforms>(), 256);
    }

    #[test]
    fn test_object_data_round_trips_transform() {
        let model = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let data = ObjectData::new(&model, &Vec3::new(1.0, 1.0, 2.0), 4, 5, 100, 200);
        assert_eq!(data.model_matrix(), model);
        assert_eq!(data.scale_vec(), Vec3::new(1.0, 1.0, 2.0));
        assert_eq!(data.model[3][0], 1.0);
    }
}
