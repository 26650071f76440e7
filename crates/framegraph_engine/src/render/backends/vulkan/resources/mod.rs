//! Vulkan resource management
//!
//! Buffer/image allocation with staged upload, descriptor layouts, pools and
//! writes, and ray tracing acceleration structures.

/// Buffer and image allocation, immediate submission
pub mod allocator;

/// Descriptor layouts, growable pools and batched writes
pub mod descriptor_set;

/// Bottom- and top-level acceleration structures
pub mod acceleration_structure;

pub use acceleration_structure::AccelerationStructures;
pub use allocator::{AllocatedBuffer, AllocatedImage, BufferId, ImageId, QueueType, ResourceAllocator};
pub use descriptor_set::{DescriptorAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
