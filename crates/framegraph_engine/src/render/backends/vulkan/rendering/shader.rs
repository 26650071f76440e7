//! Shader modules and pipeline creation
//!
//! SPIR-V is loaded from disk (compilation is a build-time concern) and
//! wrapped in RAII modules. Graphics pipelines target dynamic rendering, so
//! they are built against attachment formats instead of a render pass.
//! Viewport and scissor are always dynamic.

use ash::{vk, Device};
use std::ffi::CStr;
use std::path::Path;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};
use crate::render::mesh_bank::{VertexFormat, VertexLayout};

/// Entry point every shader stage uses
pub const SHADER_ENTRY: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// SPIR-V shader module wrapper with automatic resource management
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(VulkanError::InitializationFailed(format!(
                "SPIR-V length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        // Copy into u32 words; file buffers carry no alignment guarantee
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.create_shader_module(&create_info, None).map_err(VulkanError::Api)? };
        log::debug!("Created shader module from {} words", words.len());
        Ok(Self { device: device.clone(), module })
    }

    /// Load shader from SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| VulkanError::ShaderLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(device, &bytes).map_err(|e| VulkanError::ShaderLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Create shader stage create info
    pub fn create_stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(SHADER_ENTRY)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

fn create_layout(device: &Device, set_layouts: &[vk::DescriptorSetLayout], push_constants: &[vk::PushConstantRange]) -> VulkanResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constants);
    unsafe { device.create_pipeline_layout(&layout_info, None).map_err(VulkanError::Api) }
}

/// Pipeline and layout with RAII cleanup
pub struct Pipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Bind the pipeline and `sets` starting at set 0
    pub fn bind(&self, cmd: vk::CommandBuffer, sets: &[vk::DescriptorSet]) {
        unsafe {
            self.device.cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
            if !sets.is_empty() {
                self.device
                    .cmd_bind_descriptor_sets(cmd, self.bind_point, self.layout, 0, sets, &[]);
            }
        }
    }

    /// Push constants visible to `stages`
    pub fn push_constants<T: bytemuck::Pod>(&self, cmd: vk::CommandBuffer, stages: vk::ShaderStageFlags, value: &T) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, self.layout, stages, 0, bytemuck::bytes_of(value));
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Build a compute pipeline from one shader
pub fn create_compute_pipeline(
    device: &Device,
    shader: &ShaderModule,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> VulkanResult<Pipeline> {
    let ranges: Vec<vk::PushConstantRange> = (push_constant_size > 0)
        .then(|| vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: push_constant_size,
        })
        .into_iter()
        .collect();
    let layout = create_layout(device, set_layouts, &ranges)?;

    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(shader.create_stage_info(vk::ShaderStageFlags::COMPUTE))
        .layout(layout)
        .build();
    let pipelines = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) };
    match pipelines {
        Ok(pipelines) => Ok(Pipeline {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(VulkanError::Api(e))
        }
    }
}

/// Vulkan format of a vertex attribute
pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Unorm4x8 => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Binding 0 description and attributes for a bank layout
pub fn vertex_input(layout: &VertexLayout) -> (vk::VertexInputBindingDescription, Vec<vk::VertexInputAttributeDescription>) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: layout.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = layout
        .attributes
        .iter()
        .map(|a| vk::VertexInputAttributeDescription {
            location: a.location,
            binding: 0,
            format: vertex_format(a.format),
            offset: a.offset,
        })
        .collect();
    (binding, attributes)
}

/// Graphics pipeline builder for dynamic rendering
pub struct GraphicsPipelineBuilder<'a> {
    vertex: &'a ShaderModule,
    fragment: &'a ShaderModule,
    vertex_layout: Option<&'a VertexLayout>,
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    depth_test: bool,
    depth_write: bool,
    cull_mode: vk::CullModeFlags,
    set_layouts: Vec<vk::DescriptorSetLayout>,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    /// Start a pipeline from a vertex and fragment shader
    pub fn new(vertex: &'a ShaderModule, fragment: &'a ShaderModule) -> Self {
        Self {
            vertex,
            fragment,
            vertex_layout: None,
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            depth_test: false,
            depth_write: false,
            cull_mode: vk::CullModeFlags::BACK,
            set_layouts: Vec::new(),
        }
    }

    /// Read vertices with this layout from binding 0; fullscreen passes skip this
    pub fn vertex_layout(mut self, layout: &'a VertexLayout) -> Self {
        self.vertex_layout = Some(layout);
        self
    }

    /// Color attachment formats in location order
    pub fn color_formats(mut self, formats: &[vk::Format]) -> Self {
        self.color_formats = formats.to_vec();
        self
    }

    /// Depth attachment with LESS test and writes
    pub fn depth(mut self, format: vk::Format) -> Self {
        self.depth_format = format;
        self.depth_test = true;
        self.depth_write = true;
        self
    }

    /// Face culling mode
    pub fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    /// Descriptor set layouts in set order
    pub fn set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    /// Create the pipeline
    pub fn build(self, device: &Device) -> VulkanResult<Pipeline> {
        let shader_stages = [
            self.vertex.create_stage_info(vk::ShaderStageFlags::VERTEX),
            self.fragment.create_stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let (binding, attributes) = match self.vertex_layout {
            Some(layout) => {
                let (binding, attributes) = vertex_input(layout);
                (vec![binding], attributes)
            }
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = self
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
                    .build()
            })
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format);

        let layout = create_layout(device, &self.set_layouts, &[])?;
        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) };
        match pipelines {
            Ok(pipelines) => Ok(Pipeline {
                device: device.clone(),
                pipeline: pipelines[0],
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(VulkanError::Api(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_input_matches_layout() {
        let layout = VertexLayout::position_normal_uv();
        let (binding, attributes) = vertex_input(&layout);
        assert_eq!(binding.stride, 32);
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn test_shader_entry_name() {
        assert_eq!(SHADER_ENTRY.to_bytes(), b"main");
    }
}
