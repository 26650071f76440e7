//! Foundation utilities shared by the renderer and scene code
//!
//! - `math`: nalgebra aliases, transforms, bounding spheres and the Vulkan projection
//! - `logging`: `env_logger` setup and the fatal-error helper

pub mod logging;
pub mod math;
