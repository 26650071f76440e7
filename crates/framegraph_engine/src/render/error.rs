//! Renderer-level errors

use thiserror::Error;

use crate::render::backends::vulkan::VulkanError;
use crate::render::culling::CullingError;
use crate::render::draw_commands::DrawCommandError;
use crate::render::mesh_bank::{MeshBankError, MeshId};
use crate::scene::translator::TranslateError;

/// Errors surfaced by [`crate::render::backends::vulkan::VulkanRenderer`]
#[derive(Error, Debug)]
pub enum RenderError {
    /// Vulkan call or setup failure
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// Mesh bank rejected an edit
    #[error(transparent)]
    MeshBank(#[from] MeshBankError),

    /// Culling setup failure
    #[error(transparent)]
    Culling(#[from] CullingError),

    /// Scene data could not be translated this frame
    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// Population grew without a call to `update_draw_instance_counts`
    #[error("Instance counts out of date: mesh {mesh:?} has {current} instances but {reserved} are reserved")]
    InstanceCountsOutOfDate {
        /// Offending mesh
        mesh: MeshId,
        /// Reserved slots
        reserved: u32,
        /// Current population
        current: u32,
    },

    /// Per-mesh instance counts sum past `u32::MAX`
    #[error("Instance population overflows at mesh {0:?}")]
    PopulationOverflow(MeshId),

    /// A mesh id outside the bank
    #[error("Unknown mesh {0:?}")]
    UnknownMesh(MeshId),

    /// Configuration rejected by validation
    #[error("Invalid renderer configuration: {0}")]
    InvalidConfig(String),

    /// Called in the wrong order (e.g. drawing before mesh upload)
    #[error("Renderer not ready: {0}")]
    NotReady(String),
}

impl From<DrawCommandError> for RenderError {
    fn from(err: DrawCommandError) -> Self {
        match err {
            DrawCommandError::UnknownMesh(mesh) => Self::UnknownMesh(mesh),
            DrawCommandError::InstanceCountsOutOfDate { mesh, reserved, current } => {
                Self::InstanceCountsOutOfDate { mesh, reserved, current }
            }
            DrawCommandError::PopulationOverflow(mesh) => Self::PopulationOverflow(mesh),
        }
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;
