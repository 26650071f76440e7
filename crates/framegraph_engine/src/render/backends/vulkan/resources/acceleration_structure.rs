//! Ray tracing acceleration structures
//!
//! One bottom-level structure per mesh, built once with an immediate command
//! after the mesh bank is uploaded. One top-level structure per frame slot,
//! rebuilt every frame from the object transforms inside the frame's command
//! buffer. Top-level storage grows in powers of two; a regrow replaces the
//! handle, which the caller has to relink into its descriptor sets.

use ash::extensions::khr::AccelerationStructure as AccelerationStructureLoader;
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::foundation::math::Mat4;
use crate::render::backends::vulkan::mesh_buffers::MeshBuffers;
use crate::render::backends::vulkan::resources::allocator::{BufferId, QueueType, ResourceAllocator};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::gpu_types::ObjectData;
use crate::render::mesh_bank::MeshBank;

/// Scratch sizes above this are logged as a warning
pub const SCRATCH_SOFT_LIMIT: vk::DeviceSize = 256 * 1024 * 1024;

/// Scratch address alignment; covers every known `minAccelerationStructureScratchOffsetAlignment`
const SCRATCH_ALIGNMENT: vk::DeviceSize = 256;

/// Smallest top-level instance capacity
const MIN_TOP_LEVEL_CAPACITY: u32 = 16;

/// Object indices travel in the 24-bit instance custom index
pub const MAX_TOP_LEVEL_OBJECTS: usize = 1 << 24;

/// Row-major 3x4 transform as acceleration structure instances expect it
pub fn transform_matrix(model: &Mat4) -> vk::TransformMatrixKHR {
    let mut matrix = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            matrix[row * 4 + col] = model[(row, col)];
        }
    }
    vk::TransformMatrixKHR { matrix }
}

/// Instance capacity for a top level holding `count` instances
pub fn top_level_capacity(count: u32) -> u32 {
    count.max(1).next_power_of_two().max(MIN_TOP_LEVEL_CAPACITY)
}

/// Reject populations whose object indices do not fit the instance custom index
pub fn check_top_level_objects(count: usize) -> VulkanResult<()> {
    if count > MAX_TOP_LEVEL_OBJECTS {
        return Err(VulkanError::InvalidOperation {
            reason: format!("{count} objects exceed the {MAX_TOP_LEVEL_OBJECTS} a top-level structure can index"),
        });
    }
    Ok(())
}

/// A slot's top level must be replaced when it is missing or too small
fn needs_new_top_level(capacity: Option<u32>, count: u32) -> bool {
    capacity.map_or(true, |capacity| capacity < count)
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (value + alignment - 1) / alignment * alignment
}

struct BuiltStructure {
    handle: vk::AccelerationStructureKHR,
    buffer: BufferId,
    address: vk::DeviceAddress,
}

struct TopLevel {
    structure: BuiltStructure,
    instance_buffer: BufferId,
    instance_address: vk::DeviceAddress,
    scratch: BufferId,
    scratch_address: vk::DeviceAddress,
    capacity: u32,
}

/// Bottom-level structures per mesh and a top level per frame slot
pub struct AccelerationStructures {
    loader: AccelerationStructureLoader,
    bottom: Vec<Option<BuiltStructure>>,
    top: Vec<Option<TopLevel>>,
}

impl AccelerationStructures {
    /// Empty set for `slot_count` frame slots
    pub fn new(loader: AccelerationStructureLoader, slot_count: usize) -> Self {
        Self {
            loader,
            bottom: Vec::new(),
            top: (0..slot_count).map(|_| None).collect(),
        }
    }

    fn create_structure(
        &self,
        allocator: &mut ResourceAllocator,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> VulkanResult<BuiltStructure> {
        let buffer = allocator.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        );
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(allocator.buffer_handle(buffer))
            .size(size)
            .ty(ty);
        let handle = match unsafe { self.loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                allocator.destroy_buffer(buffer);
                return Err(VulkanError::Api(e));
            }
        };
        let address = unsafe {
            self.loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle),
            )
        };
        Ok(BuiltStructure { handle, buffer, address })
    }

    fn destroy_structure(&self, allocator: &mut ResourceAllocator, structure: BuiltStructure) {
        unsafe { self.loader.destroy_acceleration_structure(structure.handle, None) };
        allocator.destroy_buffer(structure.buffer);
    }

    fn create_scratch(allocator: &mut ResourceAllocator, size: vk::DeviceSize, name: &str) -> VulkanResult<(BufferId, vk::DeviceAddress)> {
        if size > SCRATCH_SOFT_LIMIT {
            log::warn!("Acceleration structure scratch for {} is {} MiB", name, size >> 20);
        }
        let scratch = allocator.create_buffer(
            size + SCRATCH_ALIGNMENT,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        );
        let address = allocator
            .buffer(scratch)
            .and_then(|b| b.device_address)
            .ok_or_else(|| VulkanError::MissingFeature("buffer device address".to_string()))?;
        Ok((scratch, align_up(address, SCRATCH_ALIGNMENT)))
    }

    /// Build one bottom-level structure per mesh; blocks until done
    pub fn build_bottom_levels(&mut self, allocator: &mut ResourceAllocator, bank: &MeshBank, buffers: &MeshBuffers) -> VulkanResult<()> {
        let (Some(vertex_address), Some(index_address)) = (buffers.vertex_address, buffers.index_address) else {
            return Err(VulkanError::MissingFeature("mesh buffers without device addresses".to_string()));
        };
        let position_offset = bank.layout().position_offset().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "vertex layout has no Float3 position at location 0".to_string(),
        })?;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_address + position_offset as vk::DeviceAddress,
            })
            .vertex_stride(buffers.vertex_stride as vk::DeviceSize)
            .max_vertex(buffers.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_address })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();

        // Geometry and ranges per mesh, surfaces with no triangles dropped
        let mut builds: Vec<(usize, Vec<vk::AccelerationStructureGeometryKHR>, Vec<vk::AccelerationStructureBuildRangeInfoKHR>)> =
            Vec::new();
        for (index, mesh) in bank.meshes().iter().enumerate() {
            let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = mesh
                .surfaces
                .iter()
                .filter(|s| s.index_count >= 3)
                .map(|s| vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: s.index_count / 3,
                    primitive_offset: s.first_index * std::mem::size_of::<u32>() as u32,
                    first_vertex: mesh.vertex_offset,
                    transform_offset: 0,
                })
                .collect();
            if !ranges.is_empty() {
                builds.push((index, vec![geometry; ranges.len()], ranges));
            }
        }

        self.bottom = (0..bank.len()).map(|_| None).collect();
        let mut targets = Vec::with_capacity(builds.len());
        let mut max_scratch = 0;
        for (index, geometries, ranges) in &builds {
            let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(geometries)
                .build();
            let counts: Vec<u32> = ranges.iter().map(|r| r.primitive_count).collect();
            let sizes = unsafe {
                self.loader
                    .get_acceleration_structure_build_sizes(vk::AccelerationStructureBuildTypeKHR::DEVICE, &info, &counts)
            };
            max_scratch = max_scratch.max(sizes.build_scratch_size);
            let name = format!("blas {}", bank.meshes()[*index].name);
            let structure = self.create_structure(allocator, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, sizes.acceleration_structure_size, &name)?;
            targets.push(structure.handle);
            self.bottom[*index] = Some(structure);
        }
        if builds.is_empty() {
            return Ok(());
        }

        let built = targets.len();
        let (scratch, scratch_address) = Self::create_scratch(allocator, max_scratch, "blas scratch")?;
        let loader = self.loader.clone();
        let result = allocator.immediate_submit(QueueType::Graphics, move |device, cmd| unsafe {
            for ((_, geometries, ranges), target) in builds.iter().zip(&targets) {
                let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .geometries(geometries)
                    .dst_acceleration_structure(*target)
                    .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address })
                    .build();
                loader.cmd_build_acceleration_structures(cmd, std::slice::from_ref(&info), &[ranges.as_slice()]);

                // Scratch is shared, so builds run one after another
                let barrier = vk::MemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                    .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                    .build();
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        });
        allocator.destroy_buffer(scratch);
        result?;

        log::info!("Built {} bottom-level acceleration structures", built);
        Ok(())
    }

    /// Instance records for every object whose mesh has a bottom level
    fn instances(&self, objects: &[ObjectData]) -> Vec<vk::AccelerationStructureInstanceKHR> {
        objects
            .iter()
            .enumerate()
            .filter_map(|(index, object)| {
                let blas = self.bottom.get(object.mesh_id as usize)?.as_ref()?;
                Some(vk::AccelerationStructureInstanceKHR {
                    transform: transform_matrix(&object.model_matrix()),
                    instance_custom_index_and_mask: vk::Packed24_8::new(index as u32, 0xff),
                    instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                        0,
                        vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                    ),
                    acceleration_structure_reference: vk::AccelerationStructureReferenceKHR { device_handle: blas.address },
                })
            })
            .collect()
    }

    fn top_level_build_info(geometry: &vk::AccelerationStructureGeometryKHR) -> vk::AccelerationStructureBuildGeometryInfoKHRBuilder<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(geometry))
    }

    fn instance_geometry(instance_address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR {
        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address })
            .build();
        vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build()
    }

    fn create_top_level(&self, allocator: &mut ResourceAllocator, slot: usize, capacity: u32) -> VulkanResult<TopLevel> {
        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as vk::DeviceSize;
        let instance_buffer = allocator.create_buffer(
            instance_size * capacity as vk::DeviceSize,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            &format!("tlas instances {slot}"),
        );
        let instance_address = allocator
            .buffer(instance_buffer)
            .and_then(|b| b.device_address)
            .ok_or_else(|| VulkanError::MissingFeature("buffer device address".to_string()))?;

        let geometry = Self::instance_geometry(instance_address);
        let info = Self::top_level_build_info(&geometry).build();
        let sizes = unsafe {
            self.loader
                .get_acceleration_structure_build_sizes(vk::AccelerationStructureBuildTypeKHR::DEVICE, &info, &[capacity])
        };

        let structure = self.create_structure(
            allocator,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
            &format!("tlas {slot}"),
        )?;
        let (scratch, scratch_address) = Self::create_scratch(allocator, sizes.build_scratch_size, &format!("tlas scratch {slot}"))?;
        log::debug!("Top-level acceleration structure for slot {} sized for {} instances", slot, capacity);

        Ok(TopLevel {
            structure,
            instance_buffer,
            instance_address,
            scratch,
            scratch_address,
            capacity,
        })
    }

    /// Record this slot's top-level rebuild; returns true when the handle changed
    ///
    /// The slot's previous frame must have completed. Fails without recording
    /// anything when the object count overflows the instance custom index.
    pub fn record_top_level(
        &mut self,
        allocator: &mut ResourceAllocator,
        cmd: vk::CommandBuffer,
        slot: usize,
        objects: &[ObjectData],
    ) -> VulkanResult<bool> {
        check_top_level_objects(objects.len())?;
        let instances = self.instances(objects);
        let count = instances.len() as u32;

        let needs_regrow = needs_new_top_level(self.top[slot].as_ref().map(|t| t.capacity), count);
        if needs_regrow {
            if let Some(old) = self.top[slot].take() {
                self.destroy_top_level(allocator, old);
            }
            let top = self.create_top_level(allocator, slot, top_level_capacity(count))?;
            self.top[slot] = Some(top);
        }
        let Some(top) = self.top[slot].as_ref() else {
            return Ok(needs_regrow);
        };

        let bytes = unsafe {
            std::slice::from_raw_parts(
                instances.as_ptr() as *const u8,
                instances.len() * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        allocator.write_buffer(top.instance_buffer, 0, bytes)?;

        let geometry = Self::instance_geometry(top.instance_address);
        let info = Self::top_level_build_info(&geometry)
            .dst_acceleration_structure(top.structure.handle)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: top.scratch_address })
            .build();
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        let device = allocator.device();
        unsafe {
            self.loader
                .cmd_build_acceleration_structures(cmd, std::slice::from_ref(&info), &[std::slice::from_ref(&range)]);
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
                .build();
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        log::trace!("Recorded top-level rebuild with {} instances", count);
        Ok(needs_regrow)
    }

    /// This slot's top-level handle, null before the first build
    pub fn top_level(&self, slot: usize) -> vk::AccelerationStructureKHR {
        self.top
            .get(slot)
            .and_then(|t| t.as_ref())
            .map_or(vk::AccelerationStructureKHR::null(), |t| t.structure.handle)
    }

    /// Number of meshes with a bottom-level structure
    pub fn bottom_level_count(&self) -> usize {
        self.bottom.iter().flatten().count()
    }

    fn destroy_top_level(&self, allocator: &mut ResourceAllocator, top: TopLevel) {
        allocator.destroy_buffer(top.instance_buffer);
        allocator.destroy_buffer(top.scratch);
        self.destroy_structure(allocator, top.structure);
    }

    /// Release every structure; the device must be idle
    pub fn destroy(&mut self, allocator: &mut ResourceAllocator) {
        let tops: Vec<TopLevel> = self.top.iter_mut().filter_map(Option::take).collect();
        for top in tops {
            self.destroy_top_level(allocator, top);
        }
        let bottoms: Vec<BuiltStructure> = self.bottom.drain(..).flatten().collect();
        for structure in bottoms {
            self.destroy_structure(allocator, structure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn test_transform_matrix_is_row_major() {
        let model = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0)) * Mat4::new_nonuniform_scaling(&Vec3::new(4.0, 5.0, 6.0));
        let t = transform_matrix(&model);
        assert_eq!(t.matrix, [4.0, 0.0, 0.0, 1.0, 0.0, 5.0, 0.0, 2.0, 0.0, 0.0, 6.0, 3.0]);
    }

    #[test]
    fn test_top_level_capacity_grows_in_powers_of_two() {
        assert_eq!(top_level_capacity(0), MIN_TOP_LEVEL_CAPACITY);
        assert_eq!(top_level_capacity(16), 16);
        assert_eq!(top_level_capacity(17), 32);
        assert_eq!(top_level_capacity(1000), 1024);
    }

    #[test]
    fn test_object_count_limited_to_custom_index_range() {
        assert!(check_top_level_objects(0).is_ok());
        assert!(check_top_level_objects(MAX_TOP_LEVEL_OBJECTS).is_ok());
        assert!(matches!(
            check_top_level_objects(MAX_TOP_LEVEL_OBJECTS + 1),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_top_level_replaced_only_when_missing_or_too_small() {
        assert!(needs_new_top_level(None, 0));
        assert!(needs_new_top_level(Some(16), 17));
        assert!(!needs_new_top_level(Some(16), 16));
        assert!(!needs_new_top_level(Some(32), 3));
    }

    #[test]
    fn test_scratch_alignment() {
        assert_eq!(align_up(0, SCRATCH_ALIGNMENT), 0);
        assert_eq!(align_up(1, SCRATCH_ALIGNMENT), 256);
        assert_eq!(align_up(512, SCRATCH_ALIGNMENT), 512);
    }
}
