//! # Renderer Configuration
//!
//! Serializable settings for the frame-graph renderer: frames in flight,
//! pipeline composition, culling switches, descriptor pool sizing and
//! shader locations. Every struct has sensible defaults so a config file
//! only needs to name the values it changes.
//!
//! ```no_run
//! use framegraph_engine::core::config::{RendererConfig, PipelineMode};
//! use framegraph_engine::config::Config;
//!
//! let config = RendererConfig::load_or_default("renderer.toml")
//!     .unwrap_or_default()
//!     .with_pipeline(PipelineMode::Deferred)
//!     .with_max_frames_in_flight(3);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};

pub use crate::config::{Config, ConfigError};

/// Hard upper bound on sets per descriptor pool
pub const MAX_DESCRIPTOR_SETS_PER_POOL: u32 = 4092;

/// Which pass chain the renderer composes each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipelineMode {
    /// cull -> shadow -> forward
    #[default]
    Forward,
    /// cull -> shadow -> G-buffer -> deferred lighting
    Deferred,
}

/// Preferred swapchain present mode; falls back to FIFO when unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PresentModePreference {
    /// Low-latency triple buffering
    #[default]
    Mailbox,
    /// Vsync, always supported
    Fifo,
    /// No vsync, may tear
    Immediate,
}

/// Descriptor types a pool reserves space for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// Uniform buffer
    UniformBuffer,
    /// Storage buffer
    StorageBuffer,
    /// Combined image sampler
    CombinedImageSampler,
    /// Storage image
    StorageImage,
    /// Top-level acceleration structure
    AccelerationStructure,
}

/// Ratio of descriptors of one kind per allocated set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolSizeRatio {
    /// Descriptor kind
    pub kind: DescriptorKind,
    /// Descriptors of this kind reserved per set
    pub ratio: f32,
}

impl PoolSizeRatio {
    /// Create a new ratio entry
    pub fn new(kind: DescriptorKind, ratio: f32) -> Self {
        Self { kind, ratio }
    }
}

/// Descriptor pool growth settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Sets in the first pool
    pub initial_sets_per_pool: u32,
    /// Cap for pool growth
    pub max_sets_per_pool: u32,
    /// Per-kind descriptor ratios
    pub ratios: Vec<PoolSizeRatio>,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            initial_sets_per_pool: 64,
            max_sets_per_pool: MAX_DESCRIPTOR_SETS_PER_POOL,
            ratios: vec![
                PoolSizeRatio::new(DescriptorKind::UniformBuffer, 2.0),
                PoolSizeRatio::new(DescriptorKind::StorageBuffer, 4.0),
                PoolSizeRatio::new(DescriptorKind::CombinedImageSampler, 4.0),
                PoolSizeRatio::new(DescriptorKind::StorageImage, 1.0),
            ],
        }
    }
}

impl DescriptorConfig {
    /// Validate the descriptor settings
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_sets_per_pool == 0 {
            return Err("Initial descriptor sets per pool must be at least 1".to_string());
        }
        if self.max_sets_per_pool > MAX_DESCRIPTOR_SETS_PER_POOL {
            return Err(format!(
                "Descriptor pools are capped at {} sets, got {}",
                MAX_DESCRIPTOR_SETS_PER_POOL, self.max_sets_per_pool
            ));
        }
        if self.initial_sets_per_pool > self.max_sets_per_pool {
            return Err("Initial pool size exceeds the pool size cap".to_string());
        }
        if let Some(bad) = self.ratios.iter().find(|r| !(r.ratio > 0.0)) {
            return Err(format!("Descriptor ratio for {:?} must be positive", bad.kind));
        }
        Ok(())
    }
}

/// GPU visibility settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullingConfig {
    /// Run visibility in a compute pass; `false` uses the CPU reference culler
    pub gpu: bool,
    /// Reject objects outside the view frustum
    pub frustum: bool,
    /// Reject objects hidden by last frame's depth pyramid
    pub occlusion: bool,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            gpu: true,
            frustum: true,
            occlusion: true,
        }
    }
}

/// # Shader Configuration
///
/// SPIR-V file names for every pass plus the directory they live in.
/// Shader compilation is external; these are read as opaque binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Directory containing the compiled `.spv` files
    pub directory: PathBuf,
    /// Visibility compute shader
    pub cull: String,
    /// Depth pyramid reduction compute shader
    pub depth_reduce: String,
    /// Forward pass vertex shader
    pub forward_vertex: String,
    /// Forward pass fragment shader
    pub forward_fragment: String,
    /// G-buffer vertex shader
    pub gbuffer_vertex: String,
    /// G-buffer fragment shader
    pub gbuffer_fragment: String,
    /// Fullscreen triangle vertex shader
    pub fullscreen_vertex: String,
    /// Deferred lighting fragment shader
    pub lighting_fragment: String,
    /// Ray-query shadow compute shader
    pub shadow_compute: String,
}

impl ShaderConfig {
    /// Common locations searched when the configured directory is missing
    pub const SEARCH_DIRS: [&'static str; 5] = [
        "target/shaders/",
        "shaders/",
        "resources/shaders/",
        "../shaders/",
        "./",
    ];

    /// Create shader config rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::with_path_resolution()
        }
    }

    /// Default file names with the first search directory that holds the cull shader
    ///
    /// Lets applications run from the workspace root or the crate directory.
    pub fn with_path_resolution() -> Self {
        let cull = "cull.comp.spv".to_string();
        let directory = Self::SEARCH_DIRS
            .iter()
            .map(PathBuf::from)
            .find(|dir| dir.join(&cull).exists())
            .unwrap_or_else(|| PathBuf::from(Self::SEARCH_DIRS[0]));

        Self {
            directory,
            cull,
            depth_reduce: "depth_reduce.comp.spv".to_string(),
            forward_vertex: "forward.vert.spv".to_string(),
            forward_fragment: "forward.frag.spv".to_string(),
            gbuffer_vertex: "gbuffer.vert.spv".to_string(),
            gbuffer_fragment: "gbuffer.frag.spv".to_string(),
            fullscreen_vertex: "fullscreen.vert.spv".to_string(),
            lighting_fragment: "deferred_lighting.frag.spv".to_string(),
            shadow_compute: "shadow_rt.comp.spv".to_string(),
        }
    }

    /// Full path for a shader file name
    pub fn path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }

    /// Every configured shader file name
    pub fn files(&self) -> [&str; 9] {
        [
            &self.cull,
            &self.depth_reduce,
            &self.forward_vertex,
            &self.forward_fragment,
            &self.gbuffer_vertex,
            &self.gbuffer_fragment,
            &self.fullscreen_vertex,
            &self.lighting_fragment,
            &self.shadow_compute,
        ]
    }

    /// Validate that the shader directory exists
    ///
    /// Individual files are checked when their pass loads them.
    pub fn validate(&self) -> Result<(), String> {
        if !Path::new(&self.directory).is_dir() {
            return Err(format!("Shader directory not found: {}", self.directory.display()));
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution()
    }
}

/// # Renderer Configuration
///
/// Top-level settings consumed by [`crate::render::backends::vulkan::VulkanRenderer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Number of frame slots in the ring
    pub max_frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers (`None` follows the build type)
    pub enable_validation: Option<bool>,
    /// Pass chain composition
    pub pipeline: PipelineMode,
    /// Visibility settings
    pub culling: CullingConfig,
    /// Descriptor pool sizing
    pub descriptors: DescriptorConfig,
    /// Shader locations
    pub shaders: ShaderConfig,
    /// Request ray-traced shadows when the device supports ray queries
    pub ray_traced_shadows: bool,
    /// Objects the per-frame object buffers are first sized for
    pub initial_object_capacity: u32,
    /// Preferred present mode
    pub present_mode: PresentModePreference,
    /// Clear color for the swapchain image
    pub clear_color: [f32; 4],
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            max_frames_in_flight: 2,
            enable_validation: None,
            pipeline: PipelineMode::default(),
            culling: CullingConfig::default(),
            descriptors: DescriptorConfig::default(),
            shaders: ShaderConfig::default(),
            ray_traced_shadows: false,
            initial_object_capacity: 1024,
            present_mode: PresentModePreference::default(),
            clear_color: [0.02, 0.02, 0.03, 1.0],
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Choose forward or deferred composition
    pub fn with_pipeline(mut self, pipeline: PipelineMode) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Set culling switches
    pub fn with_culling(mut self, culling: CullingConfig) -> Self {
        self.culling = culling;
        self
    }

    /// Set custom shader configuration
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Request ray-traced shadows
    pub fn with_ray_traced_shadows(mut self, enabled: bool) -> Self {
        self.ray_traced_shadows = enabled;
        self
    }

    /// Resolved validation flag
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        if self.max_frames_in_flight == 0 {
            return Err("Max frames in flight must be at least 1".to_string());
        }

        if self.max_frames_in_flight > 8 {
            return Err("Max frames in flight should not exceed 8".to_string());
        }

        if self.initial_object_capacity == 0 {
            return Err("Initial object capacity must be at least 1".to_string());
        }

        if self.culling.occlusion && !self.culling.gpu {
            log::warn!("Occlusion culling needs the GPU culling pass; CPU culling will ignore it");
        }

        self.descriptors.validate()?;

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Framegraph Engine Application")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.pipeline, PipelineMode::Forward);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frames_in_flight_bounds() {
        assert!(RendererConfig::default().with_max_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_max_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::default().with_max_frames_in_flight(3).validate().is_ok());
    }

    #[test]
    fn test_descriptor_ratio_must_be_positive() {
        let mut config = RendererConfig::default();
        config.descriptors.ratios.push(PoolSizeRatio::new(DescriptorKind::StorageImage, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_cap_enforced() {
        let mut config = RendererConfig::default();
        config.descriptors.max_sets_per_pool = MAX_DESCRIPTOR_SETS_PER_POOL + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            application_name = "demo"
            max_frames_in_flight = 3
            pipeline = "Deferred"

            [culling]
            occlusion = false
        "#;
        let config: RendererConfig = toml::from_str(text).unwrap();
        assert_eq!(config.application_name, "demo");
        assert_eq!(config.max_frames_in_flight, 3);
        assert_eq!(config.pipeline, PipelineMode::Deferred);
        assert!(config.culling.gpu);
        assert!(!config.culling.occlusion);
        assert_eq!(config.descriptors, DescriptorConfig::default());
    }

    #[test]
    fn test_ron_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("framegraph_cfg_{}.ron", std::process::id()));
        let config = RendererConfig::new("ron-test").with_ray_traced_shadows(true);
        config.save_to_file(&path).unwrap();
        let loaded = RendererConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = RendererConfig::load_from_file("renderer.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }
}
