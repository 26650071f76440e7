//! Indirect draw command templates and instance accounting
//!
//! One command per (mesh, surface) in bank order. Culling increments
//! `instance_count` on the GPU; the templates built here are what the working
//! buffer is reset to at the start of every frame.
//!
//! `first_instance` carves the flat instance-to-object array into one range
//! per mesh. Each range is sized by the mesh's *population* (not its visible
//! count), so [`DrawCommandSet::update_instance_counts`] has to run whenever
//! the population changes. [`DrawCommandSet::validate_population`] enforces
//! that ordering before a frame is culled.

use std::collections::HashMap;
use thiserror::Error;

use crate::render::gpu_types::{DrawIndexedIndirectCommand, GpuMeshInfo};
use crate::render::mesh_bank::{MeshBank, MeshId};

/// Instance count per mesh; meshes that are absent count as zero
pub type MeshInstanceCounts = HashMap<MeshId, u32>;

/// Command range owned by one mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshCommandRange {
    /// First command index
    pub first_command: u32,
    /// Number of commands (the mesh's surface count)
    pub command_count: u32,
}

/// Draw command accounting errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrawCommandError {
    /// A count refers to a mesh the bank does not have
    #[error("Instance count given for unknown mesh {0:?}")]
    UnknownMesh(MeshId),

    /// Population grew past the reserved instance range
    #[error("Instance counts out of date: mesh {mesh:?} has {current} instances but {reserved} are reserved")]
    InstanceCountsOutOfDate {
        /// Offending mesh
        mesh: MeshId,
        /// Slots reserved by the last update
        reserved: u32,
        /// Current population
        current: u32,
    },

    /// Total population does not fit a 32-bit instance index
    #[error("Instance population overflows at mesh {0:?}")]
    PopulationOverflow(MeshId),
}

/// CPU-side indirect draw commands for a mesh bank
#[derive(Debug, Clone, Default)]
pub struct DrawCommandSet {
    templates: Vec<DrawIndexedIndirectCommand>,
    ranges: Vec<MeshCommandRange>,
    spheres: Vec<[f32; 4]>,
    reserved: Vec<u32>,
    total_instances: u32,
}

impl DrawCommandSet {
    /// Build one template per surface in bank order
    pub fn build(bank: &MeshBank) -> Self {
        let mut templates = Vec::with_capacity(bank.surface_count());
        let mut ranges = Vec::with_capacity(bank.len());
        let mut spheres = Vec::with_capacity(bank.len());

        for mesh in bank.meshes() {
            ranges.push(MeshCommandRange {
                first_command: templates.len() as u32,
                command_count: mesh.surfaces.len() as u32,
            });
            spheres.push(mesh.bounding_sphere.to_array());
            templates.extend(mesh.surfaces.iter().map(|surface| DrawIndexedIndirectCommand {
                index_count: surface.index_count,
                instance_count: 0,
                first_index: surface.first_index,
                vertex_offset: mesh.vertex_offset as i32,
                first_instance: 0,
            }));
        }

        log::debug!("Built {} draw command templates for {} meshes", templates.len(), ranges.len());

        Self {
            reserved: vec![0; ranges.len()],
            templates,
            ranges,
            spheres,
            total_instances: 0,
        }
    }

    /// Reassign `first_instance` ranges from per-mesh population counts
    ///
    /// Returns the total instance count, which is the required length of the
    /// instance-to-object array.
    pub fn update_instance_counts(&mut self, counts: &MeshInstanceCounts) -> Result<u32, DrawCommandError> {
        if let Some(unknown) = counts.keys().find(|id| id.index() >= self.ranges.len()) {
            return Err(DrawCommandError::UnknownMesh(*unknown));
        }

        let mut firsts = Vec::with_capacity(self.ranges.len());
        let mut running = 0u32;
        for mesh_index in 0..self.ranges.len() {
            let mesh = MeshId(mesh_index as u32);
            let count = counts.get(&mesh).copied().unwrap_or(0);
            firsts.push((running, count));
            running = running.checked_add(count).ok_or(DrawCommandError::PopulationOverflow(mesh))?;
        }

        // Nothing is touched until the whole population is known to fit
        for (mesh_index, (range, (first, count))) in self.ranges.iter().zip(firsts).enumerate() {
            let start = range.first_command as usize;
            let end = start + range.command_count as usize;
            for command in &mut self.templates[start..end] {
                command.first_instance = first;
                command.instance_count = 0;
            }
            self.reserved[mesh_index] = count;
        }

        self.total_instances = running;
        log::debug!("Reserved {} instance slots across {} meshes", running, self.ranges.len());
        Ok(running)
    }

    /// Fail if any mesh's current population exceeds its reservation
    pub fn validate_population(&self, current: &MeshInstanceCounts) -> Result<(), DrawCommandError> {
        for (&mesh, &count) in current {
            let Some(&reserved) = self.reserved.get(mesh.index()) else {
                return Err(DrawCommandError::UnknownMesh(mesh));
            };
            if count > reserved {
                return Err(DrawCommandError::InstanceCountsOutOfDate {
                    mesh,
                    reserved,
                    current: count,
                });
            }
        }
        Ok(())
    }

    /// Command templates in bank order
    pub fn templates(&self) -> &[DrawIndexedIndirectCommand] {
        &self.templates
    }

    /// Per-mesh command ranges
    pub fn ranges(&self) -> &[MeshCommandRange] {
        &self.ranges
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True for an empty bank
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Reserved instance slots for a mesh
    pub fn reserved(&self, mesh: MeshId) -> u32 {
        self.reserved.get(mesh.index()).copied().unwrap_or(0)
    }

    /// Sum of reserved instance slots
    pub fn total_instances(&self) -> u32 {
        self.total_instances
    }

    /// Elements to allocate for the instance-to-object buffer (never zero)
    pub fn instance_buffer_len(&self) -> u32 {
        self.total_instances.max(1)
    }

    /// Per-mesh culling records
    pub fn mesh_infos(&self) -> Vec<GpuMeshInfo> {
        self.ranges
            .iter()
            .zip(&self.spheres)
            .zip(&self.reserved)
            .map(|((range, sphere), &reserved)| GpuMeshInfo {
                sphere: *sphere,
                first_command: range.first_command,
                command_count: range.command_count,
                reserved_instances: reserved,
                _padding: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mesh_bank::{MeshDescriptor, SurfaceDescriptor, VertexLayout};

    fn bank_with_surfaces(surfaces_per_mesh: &[u32]) -> MeshBank {
        let mut bank = MeshBank::new(VertexLayout { stride: 12, attributes: Vec::new() });
        for (i, &surfaces) in surfaces_per_mesh.iter().enumerate() {
            let vertices = vec![[0.0f32; 3]; 3];
            let indices: Vec<u32> = (0..surfaces).flat_map(|_| [0, 1, 2]).collect();
            let mut descriptor = MeshDescriptor::new(format!("mesh{i}"));
            for s in 0..surfaces {
                descriptor = descriptor.with_surface(SurfaceDescriptor {
                    first_index: s * 3,
                    index_count: 3,
                    material_id: s,
                    material_instance_id: 0,
                });
            }
            bank.add_mesh(&vertices, &indices, descriptor).unwrap();
        }
        bank
    }

    #[test]
    fn test_templates_follow_bank_order() {
        let bank = bank_with_surfaces(&[1, 2, 1]);
        let set = DrawCommandSet::build(&bank);
        assert_eq!(set.len(), 4);

        let expected_first_index = [0, 3, 6, 9];
        let expected_vertex_offset = [0, 3, 3, 6];
        for (i, command) in set.templates().iter().enumerate() {
            assert_eq!(command.index_count, 3);
            assert_eq!(command.instance_count, 0);
            assert_eq!(command.first_index, expected_first_index[i]);
            assert_eq!(command.vertex_offset, expected_vertex_offset[i]);
            assert_eq!(command.first_instance, 0);
        }
        assert_eq!(set.ranges()[1], MeshCommandRange { first_command: 1, command_count: 2 });
    }

    #[test]
    fn test_first_instance_is_prefix_sum_of_counts() {
        let bank = bank_with_surfaces(&[1, 2, 1, 1]);
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(0), 5), (MeshId(1), 3), (MeshId(3), 7)].into_iter().collect();

        let total = set.update_instance_counts(&counts).unwrap();
        assert_eq!(total, 15);
        assert_eq!(set.instance_buffer_len(), 15);

        let firsts: Vec<u32> = set.templates().iter().map(|c| c.first_instance).collect();
        // mesh1 has two surfaces sharing one range; mesh2 has no instances
        assert_eq!(firsts, vec![0, 5, 5, 8, 8]);
        assert_eq!(set.reserved(MeshId(2)), 0);
        assert_eq!(set.reserved(MeshId(3)), 7);
    }

    #[test]
    fn test_population_growth_without_update_fails_loudly() {
        let bank = bank_with_surfaces(&[1, 1]);
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(0), 2), (MeshId(1), 2)].into_iter().collect();
        set.update_instance_counts(&counts).unwrap();

        let shrunk: MeshInstanceCounts = [(MeshId(0), 1)].into_iter().collect();
        assert!(set.validate_population(&shrunk).is_ok());

        let grown: MeshInstanceCounts = [(MeshId(0), 2), (MeshId(1), 3)].into_iter().collect();
        assert_eq!(
            set.validate_population(&grown),
            Err(DrawCommandError::InstanceCountsOutOfDate { mesh: MeshId(1), reserved: 2, current: 3 })
        );
    }

    #[test]
    fn test_population_overflow_rejected_without_partial_update() {
        let bank = bank_with_surfaces(&[1, 1, 1]);
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(0), 3), (MeshId(1), 4)].into_iter().collect();
        set.update_instance_counts(&counts).unwrap();

        let huge: MeshInstanceCounts = [(MeshId(0), 10), (MeshId(1), u32::MAX - 5), (MeshId(2), 1)].into_iter().collect();
        assert_eq!(set.update_instance_counts(&huge), Err(DrawCommandError::PopulationOverflow(MeshId(1))));

        let firsts: Vec<u32> = set.templates().iter().map(|c| c.first_instance).collect();
        assert_eq!(firsts, vec![0, 3, 7]);
        assert_eq!(set.reserved(MeshId(1)), 4);
        assert_eq!(set.total_instances(), 7);
    }

    #[test]
    fn test_unknown_mesh_rejected() {
        let bank = bank_with_surfaces(&[1]);
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(4), 1)].into_iter().collect();
        assert_eq!(set.update_instance_counts(&counts), Err(DrawCommandError::UnknownMesh(MeshId(4))));
    }

    #[test]
    fn test_empty_bank_produces_no_commands() {
        let bank = MeshBank::new(VertexLayout::position_normal_uv());
        let mut set = DrawCommandSet::build(&bank);
        assert!(set.is_empty());
        assert_eq!(set.update_instance_counts(&MeshInstanceCounts::new()).unwrap(), 0);
        assert_eq!(set.instance_buffer_len(), 1);
        assert!(set.mesh_infos().is_empty());
    }

    #[test]
    fn test_mesh_infos_carry_ranges_and_reservations() {
        let bank = bank_with_surfaces(&[2, 1]);
        let mut set = DrawCommandSet::build(&bank);
        let counts: MeshInstanceCounts = [(MeshId(0), 4), (MeshId(1), 1)].into_iter().collect();
        set.update_instance_counts(&counts).unwrap();
        let infos = set.mesh_infos();
        assert_eq!(infos[0].first_command, 0);
        assert_eq!(infos[0].command_count, 2);
        assert_eq!(infos[0].reserved_instances, 4);
        assert_eq!(infos[1].first_command, 2);
        assert_eq!(infos[1].reserved_instances, 1);
    }
}
