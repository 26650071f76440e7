//! Vulkan state management: swapchain, frame ring and synchronization

pub mod frame_backend;
pub mod swapchain;
pub mod sync;

pub use frame_backend::{FrameSlot, VulkanFrameBackend, DEPTH_FORMAT};
pub use swapchain::Swapchain;
pub use sync::{image_barrier, image_barrier_levels, pipeline_barrier, Fence, MemoryBarrierBuilder, Semaphore};
