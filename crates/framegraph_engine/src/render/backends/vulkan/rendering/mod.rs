//! Shader modules and pipeline construction

pub mod shader;

pub use shader::{create_compute_pipeline, GraphicsPipelineBuilder, Pipeline, ShaderModule};
