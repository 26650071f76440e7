//! Backend implementations for the render module
//!
//! Vulkan 1.3 is the only backend.

/// Vulkan rendering backend implementation
pub mod vulkan;
