//! Instance, device and surface setup

pub mod context;
/// GLFW window implementing [`context::SurfaceSource`]
#[cfg(feature = "window")]
pub mod window;

pub use context::*;
#[cfg(feature = "window")]
pub use window::*;
