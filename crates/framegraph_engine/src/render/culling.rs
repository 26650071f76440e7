//! Visibility math shared by the GPU culling pass and the CPU reference culler
//!
//! Frustum planes are extracted from a Vulkan-convention view-projection
//! matrix (clip depth in `[0, w]`) and normalized so signed distances are in
//! world units. A sphere is visible iff its center is at least `-radius` from
//! every plane.

use thiserror::Error;

use crate::foundation::math::{BoundingSphere, Mat4, Vec3, Vec4};
use crate::render::draw_commands::DrawCommandSet;
use crate::render::gpu_types::{DrawIndexedIndirectCommand, GpuMeshInfo, ObjectData};

/// Deepest depth pyramid the culling pass supports
pub const MAX_PYRAMID_LEVELS: u32 = 16;

/// Local size of the visibility compute shader
pub const CULL_GROUP_SIZE: u32 = 256;

/// Local size (per axis) of the depth reduction compute shader
pub const PYRAMID_GROUP_SIZE: u32 = 32;

/// Workgroups for the visibility pass; always at least one
pub fn cull_group_count(object_count: u32) -> u32 {
    object_count / CULL_GROUP_SIZE + 1
}

/// Largest power of two not exceeding `value` (zero maps to one)
pub fn previous_power_of_two(value: u32) -> u32 {
    if value == 0 {
        1
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// A plane `dot(normal, p) + distance = 0` with a unit normal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Unit normal pointing into the frustum
    pub normal: Vec3,
    /// Signed offset
    pub distance: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = Vec3::new(row.x, row.y, row.z);
        let length = normal.norm();
        if length <= f32::EPSILON {
            return Self { normal: Vec3::zeros(), distance: row.w };
        }
        Self {
            normal: normal / length,
            distance: row.w / length,
        }
    }

    /// Signed distance from a point (positive on the inside)
    pub fn signed_distance(&self, point: &Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    /// Pack as `vec4(normal, distance)`
    pub fn to_array(&self) -> [f32; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.distance]
    }
}

/// Six planes bounding the camera's view volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewFrustum {
    /// Left, right, bottom, top, near, far
    pub planes: [Plane; 6],
}

impl ViewFrustum {
    /// Extract planes from `projection * view`
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let r0: Vec4 = view_projection.row(0).transpose();
        let r1: Vec4 = view_projection.row(1).transpose();
        let r2: Vec4 = view_projection.row(2).transpose();
        let r3: Vec4 = view_projection.row(3).transpose();

        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    /// True unless the sphere lies entirely behind some plane
    pub fn contains_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.signed_distance(&sphere.center) >= -sphere.radius)
    }

    /// Packed planes for the cull uniform block
    pub fn to_gpu(&self) -> [[f32; 4]; 6] {
        let mut out = [[0.0; 4]; 6];
        for (dst, plane) in out.iter_mut().zip(self.planes.iter()) {
            *dst = plane.to_array();
        }
        out
    }
}

/// Culling setup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CullingError {
    /// Render target too large for the fixed pyramid depth
    #[error("Depth pyramid needs {levels} levels, maximum is {max}", max = MAX_PYRAMID_LEVELS)]
    PyramidTooDeep {
        /// Levels the extent would require
        levels: u32,
    },
}

/// Dimensions of the depth pyramid for a given depth buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthPyramidInfo {
    /// Level 0 width (power of two)
    pub width: u32,
    /// Level 0 height (power of two)
    pub height: u32,
    /// Mip levels
    pub levels: u32,
}

impl DepthPyramidInfo {
    /// Size the pyramid for a depth buffer of `width` x `height`
    pub fn for_depth_extent(width: u32, height: u32) -> Result<Self, CullingError> {
        let width = previous_power_of_two(width);
        let height = previous_power_of_two(height);
        let largest = width.max(height);
        // ceil(log2(largest)) + 1, exact here since largest is a power of two
        let levels = (32 - largest.leading_zeros() - 1) + 1;
        if levels > MAX_PYRAMID_LEVELS {
            return Err(CullingError::PyramidTooDeep { levels });
        }
        Ok(Self { width, height, levels })
    }

    /// Extent of a mip level, never below 1x1
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Reduction workgroups for a level
    pub fn level_group_count(&self, level: u32) -> (u32, u32) {
        let (w, h) = self.level_extent(level);
        (w.div_ceil(PYRAMID_GROUP_SIZE), h.div_ceil(PYRAMID_GROUP_SIZE))
    }
}

/// Outcome of one culling run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullStats {
    /// Objects tested
    pub tested: u32,
    /// Objects that passed and got an instance slot
    pub visible: u32,
    /// Objects that passed but found their mesh's slots exhausted
    pub dropped: u32,
}

/// CPU implementation of the visibility pass
///
/// Writes exactly what `cull.comp` writes: per visible object one instance
/// slot in its mesh's range, taken from the mesh's first command, and an
/// increment of every command of the mesh. Occlusion is not tested.
#[derive(Debug, Default)]
pub struct CpuCuller;

impl CpuCuller {
    /// Reset `commands` from the templates and run visibility for `objects`
    pub fn cull(
        frustum: Option<&ViewFrustum>,
        objects: &[ObjectData],
        meshes: &[GpuMeshInfo],
        draw_set: &DrawCommandSet,
        commands: &mut [DrawIndexedIndirectCommand],
        instance_to_object: &mut [u32],
    ) -> CullStats {
        commands.copy_from_slice(draw_set.templates());
        let mut stats = CullStats::default();

        for (object_index, object) in objects.iter().enumerate() {
            stats.tested += 1;
            let Some(mesh) = meshes.get(object.mesh_id as usize) else {
                continue;
            };
            if mesh.command_count == 0 {
                continue;
            }

            if let Some(frustum) = frustum {
                let local = BoundingSphere::new(
                    Vec3::new(mesh.sphere[0], mesh.sphere[1], mesh.sphere[2]),
                    mesh.sphere[3],
                );
                let world = local.transformed(&object.model_matrix(), &object.scale_vec());
                if !frustum.contains_sphere(&world) {
                    continue;
                }
            }

            let first = mesh.first_command as usize;
            let slot = commands[first].instance_count;
            if slot >= mesh.reserved_instances {
                stats.dropped += 1;
                continue;
            }
            for command in &mut commands[first..first + mesh.command_count as usize] {
                command.instance_count += 1;
            }
            let target = (commands[first].first_instance + slot) as usize;
            if let Some(entry) = instance_to_object.get_mut(target) {
                *entry = object_index as u32;
            }
            stats.visible += 1;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::perspective_vulkan;
    use crate::render::draw_commands::MeshInstanceCounts;
    use crate::render::mesh_bank::{MeshBank, MeshDescriptor, MeshId, VertexLayout};
    use approx::assert_relative_eq;

    fn symmetric_frustum(half_angle: f32) -> ViewFrustum {
        let projection = perspective_vulkan(half_angle * 2.0, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(
            &nalgebra::Point3::new(0.0, 0.0, 10.0),
            &nalgebra::Point3::origin(),
            &Vec3::y(),
        );
        ViewFrustum::from_view_projection(&(projection * view))
    }

    #[test]
    fn test_planes_are_normalized() {
        let frustum = symmetric_frustum(0.5);
        for plane in &frustum.planes {
            assert_relative_eq!(plane.normal.norm(), 1.0, epsilon = 1e-5);
        }
        // Near plane sits 0.1 in front of the camera at z = 10
        assert_relative_eq!(frustum.planes[4].signed_distance(&Vec3::new(0.0, 0.0, 9.9)), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_sphere_at_origin_visible() {
        let frustum = symmetric_frustum(0.5);
        assert!(frustum.contains_sphere(&BoundingSphere::new(Vec3::zeros(), 1.0)));
    }

    #[test]
    fn test_visibility_matches_plane_distance_rule() {
        let half_angle = 0.5_f32;
        let frustum = symmetric_frustum(half_angle);
        let r = 1.0;
        // Camera at z = 10 looking down -z: the right plane at depth 10 sits at x = 10 tan(theta)
        let edge = 10.0 * half_angle.tan();
        let right = frustum.planes[1];

        for &x in &[edge, edge + 0.5 * r, edge + 1.05 * r / half_angle.cos(), edge + 3.0] {
            let sphere = BoundingSphere::new(Vec3::new(x, 0.0, 0.0), r);
            let expected = frustum.planes.iter().all(|p| p.signed_distance(&sphere.center) >= -r);
            assert_eq!(frustum.contains_sphere(&sphere), expected);
        }

        let far_outside = BoundingSphere::new(Vec3::new(edge + 3.0, 0.0, 0.0), r);
        assert!(right.signed_distance(&far_outside.center) < -r);
        assert!(!frustum.contains_sphere(&far_outside));

        let touching = BoundingSphere::new(Vec3::new(edge + 0.5 * r, 0.0, 0.0), r);
        assert!(frustum.contains_sphere(&touching));
    }

    #[test]
    fn test_sphere_behind_camera_rejected() {
        let frustum = symmetric_frustum(0.5);
        assert!(!frustum.contains_sphere(&BoundingSphere::new(Vec3::new(0.0, 0.0, 20.0), 1.0)));
        assert!(!frustum.contains_sphere(&BoundingSphere::new(Vec3::new(0.0, 0.0, -200.0), 1.0)));
    }

    #[test]
    fn test_previous_power_of_two() {
        assert_eq!(previous_power_of_two(0), 1);
        assert_eq!(previous_power_of_two(1), 1);
        assert_eq!(previous_power_of_two(1023), 512);
        assert_eq!(previous_power_of_two(1024), 1024);
        assert_eq!(previous_power_of_two(1920), 1024);
    }

    #[test]
    fn test_pyramid_levels_for_common_extents() {
        let info = DepthPyramidInfo::for_depth_extent(1920, 1080).unwrap();
        assert_eq!((info.width, info.height, info.levels), (1024, 1024, 11));
        assert_eq!(info.level_extent(10), (1, 1));
        assert_eq!(info.level_group_count(0), (32, 32));
        assert_eq!(info.level_group_count(6), (1, 1));

        let info = DepthPyramidInfo::for_depth_extent(800, 300).unwrap();
        assert_eq!((info.width, info.height, info.levels), (512, 256, 10));
        assert_eq!(info.level_extent(9), (1, 1));
    }

    #[test]
    fn test_pyramid_too_deep_is_rejected() {
        assert!(DepthPyramidInfo::for_depth_extent(32768, 16).is_ok());
        assert_eq!(
            DepthPyramidInfo::for_depth_extent(65536, 16),
            Err(CullingError::PyramidTooDeep { levels: 17 })
        );
    }

    #[test]
    fn test_cull_group_count_never_zero() {
        assert_eq!(cull_group_count(0), 1);
        assert_eq!(cull_group_count(255), 1);
        assert_eq!(cull_group_count(256), 2);
    }

    fn one_mesh_set(reserved: u32) -> (DrawCommandSet, Vec<GpuMeshInfo>) {
        let mut bank = MeshBank::new(VertexLayout { stride: 12, attributes: Vec::new() });
        let sphere = BoundingSphere::new(Vec3::zeros(), 1.0);
        bank.add_mesh(&[[0.0f32; 3]; 3], &[0, 1, 2], MeshDescriptor::new("m").with_bounds(sphere))
            .unwrap();
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(0), reserved)].into_iter().collect();
        set.update_instance_counts(&counts).unwrap();
        let infos = set.mesh_infos();
        (set, infos)
    }

    fn object_at(x: f32) -> ObjectData {
        let model = Mat4::new_translation(&Vec3::new(x, 0.0, 0.0));
        ObjectData::new(&model, &Vec3::repeat(1.0), 0, 0, 0, 0)
    }

    #[test]
    fn test_cpu_culler_counts_only_visible_objects() {
        let (set, infos) = one_mesh_set(3);
        let frustum = symmetric_frustum(0.5);
        let objects = [object_at(0.0), object_at(500.0), object_at(1.0)];
        let mut commands = vec![DrawIndexedIndirectCommand::default(); set.len()];
        let mut instances = vec![u32::MAX; set.instance_buffer_len() as usize];

        let stats = CpuCuller::cull(Some(&frustum), &objects, &infos, &set, &mut commands, &mut instances);

        assert_eq!(stats, CullStats { tested: 3, visible: 2, dropped: 0 });
        assert_eq!(commands[0].instance_count, 2);
        assert_eq!(&instances[..2], &[0, 2]);
        assert_eq!(instances[2], u32::MAX);
    }

    #[test]
    fn test_cpu_culler_resets_counts_each_run() {
        let (set, infos) = one_mesh_set(2);
        let objects = [object_at(0.0), object_at(0.5)];
        let mut commands = vec![DrawIndexedIndirectCommand::default(); set.len()];
        let mut instances = vec![0; set.instance_buffer_len() as usize];

        CpuCuller::cull(None, &objects, &infos, &set, &mut commands, &mut instances);
        CpuCuller::cull(None, &objects, &infos, &set, &mut commands, &mut instances);
        assert_eq!(commands[0].instance_count, 2);
    }

    #[test]
    fn test_cpu_culler_never_writes_past_reservation() {
        let (set, infos) = one_mesh_set(1);
        let objects = [object_at(0.0), object_at(0.1), object_at(0.2)];
        let mut commands = vec![DrawIndexedIndirectCommand::default(); set.len()];
        let mut instances = vec![0; set.instance_buffer_len() as usize];

        let stats = CpuCuller::cull(None, &objects, &infos, &set, &mut commands, &mut instances);
        assert_eq!(stats.visible, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(commands[0].instance_count, 1);
    }

    #[test]
    fn test_cpu_culler_empty_scene() {
        let bank = MeshBank::new(VertexLayout::position_normal_uv());
        let set = DrawCommandSet::build(&bank);
        let mut commands: Vec<DrawIndexedIndirectCommand> = Vec::new();
        let mut instances = vec![0; set.instance_buffer_len() as usize];
        let stats = CpuCuller::cull(None, &[], &[], &set, &mut commands, &mut instances);
        assert_eq!(stats, CullStats::default());
    }
}
