//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering, state and passes,
//! with [`VulkanRenderer`] driving them one frame at a time.

/// Vulkan initialization types (context, surface source, window)
pub mod initialization;

/// Buffers, images, descriptors and acceleration structures
pub mod resources;

/// Shader modules and pipelines
pub mod rendering;

/// Swapchain, synchronization and the frame ring backend
pub mod state;

/// Render passes and their per-slot bindings
pub mod passes;

/// Shared vertex and index buffers for the mesh bank
pub mod mesh_buffers;

/// Frame orchestration
pub mod renderer;

pub use renderer::{FrameStatus, SkipReason, VulkanRenderer};

pub use initialization::context::{PhysicalDeviceInfo, SurfaceSource, VulkanContext, VulkanError, VulkanResult};
#[cfg(feature = "window")]
pub use initialization::window::Window;

pub use mesh_buffers::MeshBuffers;
