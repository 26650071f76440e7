//! Read-only scene interface the renderer consumes each frame
//!
//! The renderer never owns gameplay state. Anything that can list its
//! renderables, lights and cameras implements [`SceneSource`]; the
//! translator turns that into GPU buffer contents.

use crate::foundation::math::{Mat4, Point3, Vec3};
use crate::render::draw_commands::MeshInstanceCounts;
use crate::render::mesh_bank::MeshId;

/// One drawable instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderableInstance {
    /// Mesh in the renderer's bank
    pub mesh_id: MeshId,
    /// Object-to-world transform
    pub world_transform: Mat4,
    /// Accumulated non-uniform scale (for bounding sphere radius)
    pub world_scale: Vec3,
    /// Material id forwarded to shading
    pub material_id: u32,
}

impl RenderableInstance {
    /// Instance with a unit-scale transform
    pub fn new(mesh_id: MeshId, world_transform: Mat4) -> Self {
        Self {
            mesh_id,
            world_transform,
            world_scale: Vec3::repeat(1.0),
            material_id: 0,
        }
    }

    /// Builder-style scale
    pub fn with_scale(mut self, world_scale: Vec3) -> Self {
        self.world_scale = world_scale;
        self
    }

    /// Builder-style material
    pub fn with_material(mut self, material_id: u32) -> Self {
        self.material_id = material_id;
        self
    }
}

/// Infinitely distant light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels (normalized on translation)
    pub direction: Vec3,
    /// Linear color times intensity
    pub color: Vec3,
}

impl DirectionalLight {
    /// Create a light
    pub fn new(direction: Vec3, color: Vec3) -> Self {
        Self { direction, color }
    }
}

/// Camera matrices for one view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraData {
    /// World-to-view
    pub view: Mat4,
    /// View-to-clip (Vulkan clip space)
    pub projection: Mat4,
    /// `projection * view`
    pub view_projection: Mat4,
    /// Eye position in world space
    pub position: Vec3,
    /// Near plane distance, used by occlusion culling
    pub z_near: f32,
}

impl CameraData {
    /// Combine view and projection
    pub fn new(view: Mat4, projection: Mat4, position: Vec3, z_near: f32) -> Self {
        Self {
            view,
            projection,
            view_projection: projection * view,
            position,
            z_near,
        }
    }

    /// Right-handed look-at camera with a Vulkan perspective projection
    pub fn look_at(eye: Vec3, target: Vec3, fovy: f32, aspect: f32, near: f32, far: f32) -> Self {
        let view = Mat4::look_at_rh(&Point3::from(eye), &Point3::from(target), &Vec3::y());
        let projection = crate::foundation::math::perspective_vulkan(fovy, aspect, near, far);
        Self::new(view, projection, eye, near)
    }
}

/// Scene data the renderer reads once per frame
pub trait SceneSource {
    /// Every drawable instance
    fn renderables(&self) -> Vec<RenderableInstance>;

    /// Directional lights
    fn directional_lights(&self) -> Vec<DirectionalLight>;

    /// Cameras; the first one is rendered
    fn cameras(&self) -> Vec<CameraData>;

    /// Instances per mesh
    fn mesh_instance_counts(&self) -> MeshInstanceCounts {
        let mut counts = MeshInstanceCounts::new();
        for renderable in self.renderables() {
            *counts.entry(renderable.mesh_id).or_insert(0) += 1;
        }
        counts
    }
}

/// Plain in-memory scene
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    /// Drawables
    pub renderables: Vec<RenderableInstance>,
    /// Lights
    pub lights: Vec<DirectionalLight>,
    /// Cameras
    pub cameras: Vec<CameraData>,
}

impl StaticScene {
    /// Empty scene
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a drawable
    pub fn add_renderable(&mut self, renderable: RenderableInstance) {
        self.renderables.push(renderable);
    }

    /// Add a light
    pub fn add_light(&mut self, light: DirectionalLight) {
        self.lights.push(light);
    }

    /// Add a camera
    pub fn add_camera(&mut self, camera: CameraData) {
        self.cameras.push(camera);
    }
}

impl SceneSource for StaticScene {
    fn renderables(&self) -> Vec<RenderableInstance> {
        self.renderables.clone()
    }

    fn directional_lights(&self) -> Vec<DirectionalLight> {
        self.lights.clone()
    }

    fn cameras(&self) -> Vec<CameraData> {
        self.cameras.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_instance_counts_group_by_mesh() {
        let mut scene = StaticScene::new();
        for mesh in [0, 1, 0, 0, 3] {
            scene.add_renderable(RenderableInstance::new(MeshId(mesh), Mat4::identity()));
        }
        let counts = scene.mesh_instance_counts();
        assert_eq!(counts.get(&MeshId(0)), Some(&3));
        assert_eq!(counts.get(&MeshId(1)), Some(&1));
        assert_eq!(counts.get(&MeshId(2)), None);
        assert_eq!(counts.get(&MeshId(3)), Some(&1));
    }

    #[test]
    fn test_look_at_places_target_in_front() {
        let camera = CameraData::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::zeros(), 1.0, 1.5, 0.1, 50.0);
        let clip = camera.view_projection * nalgebra::Vector4::new(0.0, 0.0, 0.0, 1.0);
        let ndc_z = clip.z / clip.w;
        assert!(clip.w > 0.0);
        assert!((0.0..=1.0).contains(&ndc_z));
        assert_relative_eq!(clip.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(camera.z_near, 0.1);
    }
}
