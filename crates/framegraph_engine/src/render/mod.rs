//! # Rendering
//!
//! GPU-driven frame execution on Vulkan. The backend-neutral pieces live
//! here and are unit tested without a device:
//!
//! - **Mesh bank**: one shared vertex/index pool with per-mesh ranges
//! - **Draw commands**: one indirect command per surface with reserved instance ranges
//! - **Culling**: frustum planes, the depth pyramid and a CPU fallback culler
//! - **Frame ring**: the frames-in-flight scheduler over a [`frame::FrameBackend`]
//! - **Features**: which passes run on the selected device
//!
//! The Vulkan backend under [`backends::vulkan`] records and submits frames.

pub mod backends;
pub mod culling;
pub mod draw_commands;
pub mod error;
pub mod features;
pub mod frame;
pub mod gpu_types;
pub mod mesh_bank;

pub use backends::vulkan::{FrameStatus, SkipReason, SurfaceSource, VulkanRenderer};
pub use culling::{CpuCuller, CullStats, DepthPyramidInfo, ViewFrustum};
pub use draw_commands::{DrawCommandSet, MeshInstanceCounts};
pub use error::{RenderError, RenderResult};
pub use features::{DeviceCapabilities, RenderFeatures};
pub use frame::{ActiveFrame, FrameScheduler};
pub use mesh_bank::{MeshBank, MeshDescriptor, MeshId, SurfaceDescriptor, VertexAttribute, VertexFormat, VertexLayout};
