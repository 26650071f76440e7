//! # Framegraph Engine
//!
//! A GPU-driven frame execution engine on Vulkan 1.3.
//!
//! ## Features
//!
//! - **Indirect Drawing**: one indexed-indirect command per mesh surface, filled by culling
//! - **GPU Culling**: frustum and hierarchical-Z occlusion culling in compute
//! - **Frames in Flight**: a fenced ring of per-frame command buffers and buffers
//! - **Forward and Deferred**: G-buffer, fullscreen lighting and optional ray-query shadows
//! - **Scene Boundary**: renderers read snapshots through [`scene::SceneSource`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use framegraph_engine::prelude::*;
//!
//! fn run(surface: &dyn SurfaceSource, scene: &dyn SceneSource) -> Result<(), RenderError> {
//!     let config = RendererConfig::new("demo").with_pipeline(PipelineMode::Deferred);
//!     let mut renderer = VulkanRenderer::new(surface, config, VertexLayout::position_normal_uv())?;
//!
//!     // add meshes through renderer.mesh_bank_mut(), then upload once
//!     renderer.build_mesh_buffers()?;
//!
//!     loop {
//!         match renderer.draw_frame(scene)? {
//!             FrameStatus::Rendered => {}
//!             FrameStatus::Skipped(reason) => log::debug!("skipped: {:?}", reason),
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::Config,
        core::config::{CullingConfig, PipelineMode, RendererConfig, ShaderConfig},
        foundation::math::{BoundingSphere, Mat4, Transform, Vec3},
        render::{
            FrameStatus, MeshBank, MeshDescriptor, MeshId, RenderError, RenderFeatures, RenderResult, SkipReason,
            SurfaceDescriptor, SurfaceSource, VertexLayout, VulkanRenderer,
        },
        scene::{CameraData, DirectionalLight, RenderableInstance, SceneSource, StaticScene},
    };
}
