//! Math utilities and types
//!
//! Provides the nalgebra aliases used across the renderer plus a few
//! helpers for packing matrices into GPU-visible structs.

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix3, Matrix4,
    Quaternion,
    Unit,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a transform from position only
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Builder-style scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Builder-style rotation
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Compose translation * rotation * scale
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
}

/// Bounding sphere in object space
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct BoundingSphere {
    /// Sphere center
    pub center: Vec3,
    /// Sphere radius
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Smallest axis-aligned-box-derived sphere enclosing the given positions
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut min = Vec3::repeat(f32::MAX);
        let mut max = Vec3::repeat(f32::MIN);
        let mut points_vec = Vec::new();
        for p in points {
            min = min.inf(p);
            max = max.sup(p);
            points_vec.push(*p);
        }
        if points_vec.is_empty() {
            return Self::default();
        }
        let center = (min + max) * 0.5;
        let radius = points_vec
            .iter()
            .map(|p| (p - center).norm())
            .fold(0.0_f32, f32::max);
        Self { center, radius }
    }

    /// Transform into world space; the radius grows with the largest scale axis
    pub fn transformed(&self, world: &Mat4, scale: &Vec3) -> Self {
        let center = world.transform_point(&Point3::from(self.center)).coords;
        let max_scale = scale.x.abs().max(scale.y.abs()).max(scale.z.abs());
        Self {
            center,
            radius: self.radius * max_scale,
        }
    }

    /// Pack as `vec4(center, radius)`
    pub fn to_array(&self) -> [f32; 4] {
        [self.center.x, self.center.y, self.center.z, self.radius]
    }
}

/// Column-major array form of a matrix, the layout GLSL expects
pub fn mat4_to_cols(m: &Mat4) -> [[f32; 4]; 4] {
    (*m).into()
}

/// Inverse-transpose of the upper 3x3, widened back to 4x4 for std430 packing
pub fn normal_matrix(model: &Mat4) -> Mat4 {
    let upper: Mat3 = model.fixed_view::<3, 3>(0, 0).into_owned();
    let inv_t = upper
        .try_inverse()
        .map(|m| m.transpose())
        .unwrap_or_else(Mat3::identity);
    inv_t.to_homogeneous()
}

/// Right-handed perspective projection for Vulkan clip space
///
/// nalgebra produces OpenGL clip space (y up, depth in `[-1, 1]`); this flips
/// y and remaps depth to `[0, 1]`.
pub fn perspective_vulkan(fovy: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    #[rustfmt::skip]
    let correction = Mat4::new(
        1.0,  0.0, 0.0, 0.0,
        0.0, -1.0, 0.0, 0.0,
        0.0,  0.0, 0.5, 0.5,
        0.0,  0.0, 0.0, 1.0,
    );
    correction * nalgebra::Perspective3::new(aspect, fovy, near, far).to_homogeneous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn test_transform_matrix_applies_scale_then_translation() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).with_scale(Vec3::new(2.0, 2.0, 2.0));
        let p = t.to_matrix().transform_point(&Point3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Point3::new(3.0, 2.0, 3.0), epsilon = EPSILON);
    }

    #[test]
    fn test_bounding_sphere_from_points() {
        let points = [Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)];
        let sphere = BoundingSphere::from_points(points.iter());
        assert_relative_eq!(sphere.center, Vec3::new(0.0, 0.5, 0.0), epsilon = EPSILON);
        assert_relative_eq!(sphere.radius, (1.0_f32 + 0.25).sqrt(), epsilon = EPSILON);
    }

    #[test]
    fn test_bounding_sphere_transformed_uses_largest_scale() {
        let sphere = BoundingSphere::new(Vec3::zeros(), 1.0);
        let scale = Vec3::new(1.0, 3.0, 2.0);
        let world = Transform::from_position(Vec3::new(0.0, 0.0, -5.0)).with_scale(scale).to_matrix();
        let moved = sphere.transformed(&world, &scale);
        assert_relative_eq!(moved.center, Vec3::new(0.0, 0.0, -5.0), epsilon = EPSILON);
        assert_relative_eq!(moved.radius, 3.0, epsilon = EPSILON);
    }

    #[test]
    fn test_normal_matrix_of_uniform_scale_is_inverse_scale() {
        let model = Mat4::new_scaling(2.0);
        let n = normal_matrix(&model);
        assert_relative_eq!(n[(0, 0)], 0.5, epsilon = EPSILON);
        assert_relative_eq!(n[(3, 3)], 1.0, epsilon = EPSILON);
    }

    #[test]
    fn test_perspective_vulkan_depth_range() {
        let proj = perspective_vulkan(1.0, 1.0, 0.1, 100.0);
        let near = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -100.0, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-4);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-4);

        let up = proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y < 0.0);
    }
}
