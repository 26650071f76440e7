//! Resolved renderer feature set
//!
//! The config says what the application asks for; the device says what it
//! can do. [`RenderFeatures::resolve`] intersects the two once at startup and
//! every pass reads the result instead of re-deriving it.

use bitflags::bitflags;

use crate::core::config::{PipelineMode, RendererConfig};
use crate::render::gpu_types::{CULL_FLAG_FRUSTUM, CULL_FLAG_OCCLUSION};

bitflags! {
    /// Features active for the lifetime of a renderer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderFeatures: u32 {
        /// Cull and fill indirect commands on the GPU
        const GPU_CULLING = 1 << 0;
        /// Frustum test in the visibility pass
        const FRUSTUM_CULLING = 1 << 1;
        /// Depth pyramid test in the visibility pass
        const OCCLUSION_CULLING = 1 << 2;
        /// G-buffer plus fullscreen lighting instead of forward shading
        const DEFERRED = 1 << 3;
        /// Ray-query shadow mask for the lighting pass
        const RAY_TRACED_SHADOWS = 1 << 4;
        /// Uploads go through a dedicated transfer queue
        const TRANSFER_QUEUE = 1 << 5;
    }
}

/// What the selected device supports beyond the baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// acceleration_structure + ray_query + deferred_host_operations
    pub ray_tracing: bool,
    /// A queue family with TRANSFER but not GRAPHICS
    pub dedicated_transfer: bool,
}

impl RenderFeatures {
    /// Intersect the requested configuration with device capabilities
    pub fn resolve(config: &RendererConfig, caps: DeviceCapabilities) -> Self {
        let mut features = Self::empty();

        if config.culling.gpu {
            features |= Self::GPU_CULLING;
            if config.culling.frustum {
                features |= Self::FRUSTUM_CULLING;
            }
            if config.culling.occlusion {
                features |= Self::OCCLUSION_CULLING;
            }
        }

        if config.pipeline == PipelineMode::Deferred {
            features |= Self::DEFERRED;
        }

        if config.ray_traced_shadows {
            if !caps.ray_tracing {
                log::warn!("Ray traced shadows requested but the device lacks ray query support; disabled");
            } else if !features.contains(Self::DEFERRED) {
                log::warn!("Ray traced shadows need the G-buffer position target; disabled in forward mode");
            } else {
                features |= Self::RAY_TRACED_SHADOWS;
            }
        }

        if caps.dedicated_transfer {
            features |= Self::TRANSFER_QUEUE;
        }

        log::info!("Render features: {:?}", features);
        features
    }

    /// `CULL_FLAG_*` bits for the cull uniform block
    pub fn cull_flags(self) -> u32 {
        let mut flags = 0;
        if self.contains(Self::FRUSTUM_CULLING) {
            flags |= CULL_FLAG_FRUSTUM;
        }
        if self.contains(Self::OCCLUSION_CULLING) {
            flags |= CULL_FLAG_OCCLUSION;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CullingConfig;

    #[test]
    fn test_default_config_resolves_gpu_culling_forward() {
        let features = RenderFeatures::resolve(&RendererConfig::default(), DeviceCapabilities::default());
        assert!(features.contains(RenderFeatures::GPU_CULLING | RenderFeatures::FRUSTUM_CULLING));
        assert!(features.contains(RenderFeatures::OCCLUSION_CULLING));
        assert!(!features.contains(RenderFeatures::DEFERRED));
        assert_eq!(features.cull_flags(), CULL_FLAG_FRUSTUM | CULL_FLAG_OCCLUSION);
    }

    #[test]
    fn test_cpu_culling_disables_culling_flags() {
        let config = RendererConfig::default().with_culling(CullingConfig {
            gpu: false,
            frustum: true,
            occlusion: true,
        });
        let features = RenderFeatures::resolve(&config, DeviceCapabilities::default());
        assert!(!features.contains(RenderFeatures::GPU_CULLING));
        assert_eq!(features.cull_flags(), 0);
    }

    #[test]
    fn test_ray_traced_shadows_need_device_support() {
        let config = RendererConfig::default()
            .with_pipeline(PipelineMode::Deferred)
            .with_ray_traced_shadows(true);

        let without = RenderFeatures::resolve(&config, DeviceCapabilities::default());
        assert!(without.contains(RenderFeatures::DEFERRED));
        assert!(!without.contains(RenderFeatures::RAY_TRACED_SHADOWS));

        let caps = DeviceCapabilities { ray_tracing: true, dedicated_transfer: true };
        let with = RenderFeatures::resolve(&config, caps);
        assert!(with.contains(RenderFeatures::RAY_TRACED_SHADOWS | RenderFeatures::TRANSFER_QUEUE));

        let forward = RendererConfig::default().with_ray_traced_shadows(true);
        assert!(!RenderFeatures::resolve(&forward, caps).contains(RenderFeatures::RAY_TRACED_SHADOWS));
    }
}
