//! Core engine settings shared by every subsystem

pub mod config;

pub use config::{
    CullingConfig, DescriptorConfig, DescriptorKind, PipelineMode, PoolSizeRatio,
    PresentModePreference, RendererConfig, ShaderConfig,
};
