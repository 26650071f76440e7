//! Append-only mesh bank
//!
//! Every mesh shares one vertex buffer and one index buffer. Offsets into
//! those buffers are assigned when a mesh is added and never change, which is
//! what lets indirect draw commands be built once from the bank's topology.
//!
//! Vertices are stored as raw bytes with a declared [`VertexLayout`], so one
//! bank serves any vertex struct that matches the layout's stride.

use std::collections::HashMap;
use thiserror::Error;

use crate::foundation::math::{BoundingSphere, Vec3};

/// Stable mesh identifier, the insertion index into the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

impl MeshId {
    /// Index into the bank's mesh list
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Format of a single vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    /// Two 32-bit floats
    Float2,
    /// Three 32-bit floats
    Float3,
    /// Four 32-bit floats
    Float4,
    /// Four normalized bytes
    Unorm4x8,
}

impl VertexFormat {
    /// Size in bytes
    pub fn size(self) -> u32 {
        match self {
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
            Self::Unorm4x8 => 4,
        }
    }
}

/// One attribute inside a vertex record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    /// Attribute format
    pub format: VertexFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Stride and attributes of the vertices stored in a bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    /// Bytes per vertex
    pub stride: u32,
    /// Attributes in location order
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Position, normal and texture coordinate, tightly packed (32 bytes)
    pub fn position_normal_uv() -> Self {
        Self {
            stride: 32,
            attributes: vec![
                VertexAttribute { location: 0, format: VertexFormat::Float3, offset: 0 },
                VertexAttribute { location: 1, format: VertexFormat::Float3, offset: 12 },
                VertexAttribute { location: 2, format: VertexFormat::Float2, offset: 24 },
            ],
        }
    }

    /// Offset of a `Float3` position at location 0, if the layout has one
    pub fn position_offset(&self) -> Option<u32> {
        self.attributes
            .iter()
            .find(|a| a.location == 0 && a.format == VertexFormat::Float3)
            .map(|a| a.offset)
    }

    /// Check that every attribute fits inside the stride
    pub fn is_consistent(&self) -> bool {
        self.stride > 0
            && self
                .attributes
                .iter()
                .all(|a| a.offset + a.format.size() <= self.stride)
    }
}

/// Draw range of one surface as supplied by the asset loader (relative to the mesh's indices)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    /// First index relative to the mesh's own index list
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Material id
    pub material_id: u32,
    /// Material instance id
    pub material_instance_id: u32,
}

/// Metadata supplied with a mesh's vertices and indices
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDescriptor {
    /// Unique mesh name
    pub name: String,
    /// Object-space bounds; computed from positions when absent
    pub bounding_sphere: Option<BoundingSphere>,
    /// Surfaces; an empty list means one surface over all indices with material 0
    pub surfaces: Vec<SurfaceDescriptor>,
}

impl MeshDescriptor {
    /// Descriptor with a single surface covering the whole mesh
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bounding_sphere: None,
            surfaces: Vec::new(),
        }
    }

    /// Builder-style bounding sphere
    pub fn with_bounds(mut self, sphere: BoundingSphere) -> Self {
        self.bounding_sphere = Some(sphere);
        self
    }

    /// Builder-style surface
    pub fn with_surface(mut self, surface: SurfaceDescriptor) -> Self {
        self.surfaces.push(surface);
        self
    }
}

/// A surface as stored in the bank, with an absolute first index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceLite {
    /// First index into the shared index buffer
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Material id
    pub material_id: u32,
    /// Material instance id
    pub material_instance_id: u32,
}

/// A mesh as stored in the bank
#[derive(Debug, Clone, PartialEq)]
pub struct MeshLite {
    /// Mesh name
    pub name: String,
    /// Object-space bounds
    pub bounding_sphere: BoundingSphere,
    /// First vertex in the shared vertex buffer
    pub vertex_offset: u32,
    /// Number of vertices
    pub vertex_count: u32,
    /// Index-buffer offset at insertion time
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Surfaces in draw order
    pub surfaces: Vec<SurfaceLite>,
}

/// Mesh bank errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshBankError {
    /// Vertex struct size does not match the bank's layout
    #[error("Vertex stride mismatch: bank expects {expected} bytes, got {actual}")]
    StrideMismatch {
        /// Layout stride
        expected: u32,
        /// Supplied vertex size
        actual: u32,
    },

    /// A mesh with this name already exists
    #[error("Duplicate mesh name: {0}")]
    DuplicateName(String),

    /// Meshes cannot be added once the shared buffers were uploaded
    #[error("Mesh bank already uploaded; meshes can no longer be added")]
    AlreadyUploaded,

    /// Mesh has no vertices or no indices
    #[error("Mesh '{0}' has no geometry")]
    EmptyMesh(String),

    /// A surface range runs past the mesh's indices
    #[error("Surface {surface} of mesh '{mesh}' exceeds its {available} indices")]
    SurfaceOutOfRange {
        /// Mesh name
        mesh: String,
        /// Surface position in the descriptor
        surface: usize,
        /// Indices the mesh has
        available: u32,
    },

    /// An index references a vertex the mesh does not have
    #[error("Mesh '{mesh}' index {index} exceeds vertex count {vertex_count}")]
    IndexOutOfRange {
        /// Mesh name
        mesh: String,
        /// Offending index value
        index: u32,
        /// Vertices the mesh has
        vertex_count: u32,
    },
}

/// Append-only collection of meshes sharing vertex and index storage
#[derive(Debug, Clone)]
pub struct MeshBank {
    layout: VertexLayout,
    vertices: Vec<u8>,
    indices: Vec<u32>,
    meshes: Vec<MeshLite>,
    by_name: HashMap<String, MeshId>,
    uploaded: bool,
}

impl MeshBank {
    /// Create an empty bank for the given vertex layout
    pub fn new(layout: VertexLayout) -> Self {
        debug_assert!(layout.is_consistent(), "vertex attributes exceed the stride");
        Self {
            layout,
            vertices: Vec::new(),
            indices: Vec::new(),
            meshes: Vec::new(),
            by_name: HashMap::new(),
            uploaded: false,
        }
    }

    /// Add a mesh from typed vertices
    pub fn add_mesh<V: bytemuck::Pod>(
        &mut self,
        vertices: &[V],
        indices: &[u32],
        descriptor: MeshDescriptor,
    ) -> Result<MeshId, MeshBankError> {
        let actual = std::mem::size_of::<V>() as u32;
        if actual != self.layout.stride {
            return Err(MeshBankError::StrideMismatch {
                expected: self.layout.stride,
                actual,
            });
        }
        self.add_mesh_bytes(bytemuck::cast_slice(vertices), indices, descriptor)
    }

    /// Add a mesh from raw vertex bytes laid out per the bank's [`VertexLayout`]
    pub fn add_mesh_bytes(
        &mut self,
        vertex_bytes: &[u8],
        indices: &[u32],
        descriptor: MeshDescriptor,
    ) -> Result<MeshId, MeshBankError> {
        if self.uploaded {
            return Err(MeshBankError::AlreadyUploaded);
        }
        if self.by_name.contains_key(&descriptor.name) {
            return Err(MeshBankError::DuplicateName(descriptor.name));
        }
        let stride = self.layout.stride as usize;
        if vertex_bytes.len() % stride != 0 {
            return Err(MeshBankError::StrideMismatch {
                expected: self.layout.stride,
                actual: (vertex_bytes.len() % stride) as u32,
            });
        }
        let vertex_count = (vertex_bytes.len() / stride) as u32;
        if vertex_count == 0 || indices.is_empty() {
            return Err(MeshBankError::EmptyMesh(descriptor.name));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= vertex_count) {
            return Err(MeshBankError::IndexOutOfRange {
                mesh: descriptor.name,
                index: bad,
                vertex_count,
            });
        }

        let index_count = indices.len() as u32;
        let surfaces_in = if descriptor.surfaces.is_empty() {
            vec![SurfaceDescriptor {
                first_index: 0,
                index_count,
                material_id: 0,
                material_instance_id: 0,
            }]
        } else {
            descriptor.surfaces.clone()
        };

        for (i, s) in surfaces_in.iter().enumerate() {
            if s.index_count == 0 || s.first_index.saturating_add(s.index_count) > index_count {
                return Err(MeshBankError::SurfaceOutOfRange {
                    mesh: descriptor.name,
                    surface: i,
                    available: index_count,
                });
            }
        }

        let vertex_offset = (self.vertices.len() / stride) as u32;
        let first_index = self.indices.len() as u32;

        let bounding_sphere = descriptor
            .bounding_sphere
            .unwrap_or_else(|| self.compute_bounds(vertex_bytes));

        let surfaces = surfaces_in
            .iter()
            .map(|s| SurfaceLite {
                first_index: s.first_index + first_index,
                index_count: s.index_count,
                material_id: s.material_id,
                material_instance_id: s.material_instance_id,
            })
            .collect();

        self.vertices.extend_from_slice(vertex_bytes);
        self.indices.extend_from_slice(indices);

        let id = MeshId(self.meshes.len() as u32);
        log::debug!(
            "Mesh '{}' -> {:?}: {} vertices at {}, {} indices at {}",
            descriptor.name, id, vertex_count, vertex_offset, index_count, first_index
        );
        self.by_name.insert(descriptor.name.clone(), id);
        self.meshes.push(MeshLite {
            name: descriptor.name,
            bounding_sphere,
            vertex_offset,
            vertex_count,
            first_index,
            index_count,
            surfaces,
        });
        Ok(id)
    }

    fn compute_bounds(&self, vertex_bytes: &[u8]) -> BoundingSphere {
        let Some(offset) = self.layout.position_offset() else {
            log::warn!("Vertex layout has no Float3 position at location 0; using a unit bounding sphere");
            return BoundingSphere::new(Vec3::zeros(), 1.0);
        };
        let offset = offset as usize;
        let positions: Vec<Vec3> = vertex_bytes
            .chunks_exact(self.layout.stride as usize)
            .map(|v| {
                let p: [f32; 3] = bytemuck::pod_read_unaligned(&v[offset..offset + 12]);
                Vec3::new(p[0], p[1], p[2])
            })
            .collect();
        BoundingSphere::from_points(positions.iter())
    }

    /// Look a mesh up by name
    pub fn mesh_id(&self, name: &str) -> Option<MeshId> {
        self.by_name.get(name).copied()
    }

    /// Mesh by id
    pub fn mesh(&self, id: MeshId) -> Option<&MeshLite> {
        self.meshes.get(id.index())
    }

    /// All meshes in insertion order
    pub fn meshes(&self) -> &[MeshLite] {
        &self.meshes
    }

    /// Number of meshes
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// True when no mesh was added
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Total surfaces across all meshes (one draw command each)
    pub fn surface_count(&self) -> usize {
        self.meshes.iter().map(|m| m.surfaces.len()).sum()
    }

    /// Vertex layout
    pub fn layout(&self) -> &VertexLayout {
        &self.layout
    }

    /// Concatenated vertex bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertices
    }

    /// Concatenated indices (relative to each mesh's vertex offset)
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Total vertex count
    pub fn vertex_count(&self) -> u32 {
        (self.vertices.len() / self.layout.stride as usize) as u32
    }

    /// Whether the shared buffers were uploaded
    pub fn is_uploaded(&self) -> bool {
        self.uploaded
    }

    /// Freeze the bank for upload; a second call fails
    pub fn seal_for_upload(&mut self) -> Result<(), MeshBankError> {
        if self.uploaded {
            return Err(MeshBankError::AlreadyUploaded);
        }
        self.uploaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default)]
    struct TestVertex {
        position: [f32; 3],
        normal: [f32; 3],
        uv: [f32; 2],
    }

    unsafe impl bytemuck::Pod for TestVertex {}
    unsafe impl bytemuck::Zeroable for TestVertex {}

    fn vertices(n: usize) -> Vec<TestVertex> {
        (0..n)
            .map(|i| TestVertex {
                position: [i as f32, 0.0, 0.0],
                ..Default::default()
            })
            .collect()
    }

    fn triangle_fan_indices(vertex_count: u32, triangles: u32) -> Vec<u32> {
        (0..triangles)
            .flat_map(|t| [0, (t + 1) % vertex_count, (t + 2) % vertex_count])
            .collect()
    }

    #[test]
    fn test_vertex_offsets_are_running_sums() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        let sizes = [3usize, 8, 5];
        let mut ids = Vec::new();
        for (i, &n) in sizes.iter().enumerate() {
            let indices = triangle_fan_indices(n as u32, 1);
            ids.push(bank.add_mesh(&vertices(n), &indices, MeshDescriptor::new(format!("m{i}"))).unwrap());
        }

        let mut expected = 0u32;
        for (id, &n) in ids.iter().zip(sizes.iter()) {
            assert_eq!(bank.mesh(*id).unwrap().vertex_offset, expected);
            expected += n as u32;
        }
        assert_eq!(bank.vertex_count(), expected);
    }

    #[test]
    fn test_surface_first_index_is_offset_at_insertion() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        bank.add_mesh(&vertices(4), &triangle_fan_indices(4, 2), MeshDescriptor::new("quad")).unwrap();

        let descriptor = MeshDescriptor::new("two_surfaces")
            .with_surface(SurfaceDescriptor { first_index: 0, index_count: 3, material_id: 1, material_instance_id: 0 })
            .with_surface(SurfaceDescriptor { first_index: 3, index_count: 6, material_id: 2, material_instance_id: 7 });
        let id = bank.add_mesh(&vertices(6), &triangle_fan_indices(6, 3), descriptor).unwrap();

        let mesh = bank.mesh(id).unwrap();
        assert_eq!(mesh.first_index, 6);
        assert_eq!(mesh.surfaces[0].first_index, 6);
        assert_eq!(mesh.surfaces[1].first_index, 9);
        assert_eq!(mesh.surfaces[1].material_instance_id, 7);
        assert_eq!(bank.surface_count(), 3);
    }

    #[test]
    fn test_lookup_by_name_matches_returned_id() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        let a = bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("a")).unwrap();
        let b = bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("b")).unwrap();
        assert_eq!(bank.mesh_id("a"), Some(a));
        assert_eq!(bank.mesh_id("b"), Some(b));
        assert_eq!(bank.mesh_id("c"), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("a")).unwrap();
        let err = bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("a")).unwrap_err();
        assert_eq!(err, MeshBankError::DuplicateName("a".to_string()));
        assert_eq!(bank.len(), 1);
    }

    #[test]
    fn test_stride_mismatch_rejected() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        let err = bank.add_mesh(&[[0.0f32; 3]; 3], &[0, 1, 2], MeshDescriptor::new("a")).unwrap_err();
        assert_eq!(err, MeshBankError::StrideMismatch { expected: 32, actual: 12 });
    }

    #[test]
    fn test_add_after_upload_rejected() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("a")).unwrap();
        bank.seal_for_upload().unwrap();
        assert_eq!(bank.seal_for_upload(), Err(MeshBankError::AlreadyUploaded));
        let err = bank.add_mesh(&vertices(3), &[0, 1, 2], MeshDescriptor::new("b")).unwrap_err();
        assert_eq!(err, MeshBankError::AlreadyUploaded);
    }

    #[test]
    fn test_bad_ranges_rejected() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        let err = bank.add_mesh(&vertices(3), &[0, 1, 3], MeshDescriptor::new("a")).unwrap_err();
        assert!(matches!(err, MeshBankError::IndexOutOfRange { index: 3, .. }));

        let descriptor = MeshDescriptor::new("b")
            .with_surface(SurfaceDescriptor { first_index: 2, index_count: 3, material_id: 0, material_instance_id: 0 });
        let err = bank.add_mesh(&vertices(3), &[0, 1, 2], descriptor).unwrap_err();
        assert!(matches!(err, MeshBankError::SurfaceOutOfRange { surface: 0, available: 3, .. }));
        assert!(bank.is_empty());
        assert!(bank.vertex_bytes().is_empty());
    }

    #[test]
    fn test_bounds_computed_from_positions() {
        let mut bank = MeshBank::new(VertexLayout::position_normal_uv());
        let id = bank.add_mesh(&vertices(5), &[0, 1, 2, 2, 3, 4], MeshDescriptor::new("line")).unwrap();
        let sphere = bank.mesh(id).unwrap().bounding_sphere;
        assert_relative_eq!(sphere.center.x, 2.0, epsilon = 1e-5);
        assert_relative_eq!(sphere.radius, 2.0, epsilon = 1e-5);
    }
}
