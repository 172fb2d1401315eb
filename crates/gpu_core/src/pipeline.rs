//! Graphics pipeline creation
//!
//! A pipeline is described by owned data ([`PipelineConfig`] plus a
//! [`VertexInput`]) and two SPIR-V blobs. [`PipelineBuilder`] turns that
//! description into a [`PipelineData`] (pipeline + layout) for either a render
//! pass or dynamic rendering. Pipelines are cheap to rebuild; [`PipelineSet`]
//! keeps the recipes so everything can be rebuilt after the swapchain changes.

use ash::vk;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::config::{RenderingMode, ShaderConfig};
use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;
use crate::vulkan::render_pass::RenderPass;
use crate::vulkan::swapchain::Swapchain;

/// Face culling modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    /// No culling
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    Back,
}

impl CullMode {
    /// Vulkan cull flags
    pub const fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
        }
    }
}

/// Polygon rasterization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    /// Solid triangles
    Fill,
    /// Wireframe; needs `fill_mode_non_solid`
    Line,
    /// Point cloud; needs `fill_mode_non_solid`
    Point,
}

impl PolygonMode {
    /// Vulkan polygon mode
    pub const fn to_vk(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
            Self::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Blending applied to every color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Opaque
    None,
    /// `src.a * src + (1 - src.a) * dst`
    Alpha,
    /// `src.a * src + dst`
    Additive,
}

impl BlendMode {
    /// Color blend attachment state writing all channels
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .color_blend_op(vk::BlendOp::ADD)
            .alpha_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO);

        match self {
            Self::None => state.blend_enable(false).build(),
            Self::Alpha => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .build(),
            Self::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .build(),
        }
    }
}

/// Fixed-function state for a graphics pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Primitive assembly
    pub topology: vk::PrimitiveTopology,
    /// Fill, line or point rasterization
    pub polygon_mode: PolygonMode,
    /// Face culling
    pub cull_mode: CullMode,
    /// Winding of front faces
    pub front_face: vk::FrontFace,
    /// Rasterized line width
    pub line_width: f32,
    /// Color attachment blending
    pub blend_mode: BlendMode,
    /// Enable depth testing
    pub depth_test: bool,
    /// Enable depth writing
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare: vk::CompareOp,
    /// States set at record time; viewport and scissor always are
    pub dynamic_states: Vec<vk::DynamicState>,
    /// Subpass index within the render pass
    pub subpass: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: vk::FrontFace::CLOCKWISE,
            line_width: 1.0,
            blend_mode: BlendMode::None,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            subpass: 0,
        }
    }
}

impl PipelineConfig {
    /// Opaque, depth-tested, back-face-culled triangles
    pub fn model() -> Self {
        Self::default()
    }

    /// Line lists for debug geometry
    pub fn line_list() -> Self {
        Self { topology: vk::PrimitiveTopology::LINE_LIST, cull_mode: CullMode::None, ..Self::default() }
    }

    /// Meshes drawn as edges
    pub fn wireframe() -> Self {
        Self { polygon_mode: PolygonMode::Line, cull_mode: CullMode::None, ..Self::default() }
    }

    /// Background cube without depth interaction
    pub fn skybox() -> Self {
        Self { depth_test: false, depth_write: false, ..Self::default() }
    }

    /// Screen-space overlay
    pub fn ui() -> Self {
        Self { depth_test: false, depth_write: false, blend_mode: BlendMode::Alpha, ..Self::default() }
    }

    /// Fullscreen triangle generated in the vertex shader
    pub fn fullscreen() -> Self {
        Self { cull_mode: CullMode::None, depth_test: false, depth_write: false, ..Self::default() }
    }

    /// Post-process pass reading the first subpass's output; needs a render
    /// pass with at least two subpasses
    pub fn second_subpass() -> Self {
        Self { subpass: 1, ..Self::fullscreen() }
    }

    /// Additive particles in the second subpass; needs a render pass with at
    /// least two subpasses
    pub fn particles() -> Self {
        Self {
            subpass: 1,
            cull_mode: CullMode::None,
            depth_write: false,
            blend_mode: BlendMode::Additive,
            ..Self::default()
        }
    }

    /// Whether the device must support non-solid fill modes
    pub fn needs_non_solid_fill(&self) -> bool {
        self.polygon_mode != PolygonMode::Fill
    }

    /// Dynamic states with viewport and scissor guaranteed present
    pub fn resolved_dynamic_states(&self) -> Vec<vk::DynamicState> {
        let mut states = self.dynamic_states.clone();
        for required in [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR] {
            if !states.contains(&required) {
                states.push(required);
            }
        }
        states
    }

    fn rasterization_state(&self) -> vk::PipelineRasterizationStateCreateInfo {
        vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(self.polygon_mode.to_vk())
            .line_width(self.line_width)
            .cull_mode(self.cull_mode.to_vk())
            .front_face(self.front_face)
            .depth_bias_enable(false)
            .build()
    }

    fn depth_stencil_state(&self) -> vk::PipelineDepthStencilStateCreateInfo {
        vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_compare)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false)
            .build()
    }
}

/// Vertex buffer bindings and attributes of a mesh format
#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    /// Buffer bindings
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    /// Attributes read from the bindings
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexInput {
    /// No vertex buffers; geometry comes from the vertex shader
    pub fn empty() -> Self {
        Self::default()
    }

    /// One per-vertex binding of `V` with tightly packed attributes at
    /// consecutive locations
    ///
    /// Fails when a format has no known size or the attributes do not fit in `V`.
    pub fn interleaved<V: bytemuck::Pod>(formats: &[vk::Format]) -> VulkanResult<Self> {
        let stride = std::mem::size_of::<V>() as u32;
        let mut offset = 0;
        let mut attributes = Vec::with_capacity(formats.len());
        for (location, &format) in formats.iter().enumerate() {
            let size = format_size(format)
                .ok_or_else(|| VulkanError::InvalidArgument(format!("unsupported vertex format {format:?}")))?;
            attributes.push(vk::VertexInputAttributeDescription { location: location as u32, binding: 0, format, offset });
            offset += size;
        }
        if offset > stride {
            return Err(VulkanError::InvalidArgument(format!(
                "vertex attributes need {offset} bytes but the vertex is {stride} bytes"
            )));
        }

        Ok(Self {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes,
        })
    }

    /// Stride of the first binding
    pub fn stride(&self) -> u32 {
        self.bindings.first().map_or(0, |binding| binding.stride)
    }
}

/// Byte size of a vertex attribute format, `None` for formats vertices do not use
pub const fn format_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R32_SFLOAT | vk::Format::R8G8B8A8_UNORM => Some(4),
        vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32_SFLOAT => Some(12),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Position, color, normal and texture coordinates
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Vertex color
    pub color: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Texture coordinates
    pub uv: [f32; 2],
}

/// Colored line endpoint
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LineVertex {
    /// Position
    pub position: [f32; 3],
    /// Color
    pub color: [f32; 3],
}

/// Position only
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PositionVertex {
    /// Position
    pub position: [f32; 3],
}

/// Screen-space overlay vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UiVertex {
    /// Screen position
    pub position: [f32; 2],
    /// Texture coordinates
    pub uv: [f32; 2],
    /// RGBA color
    pub color: [f32; 4],
}

/// Supplies the mesh format and fixed-function state for a pipeline
pub trait PipelineProvider {
    /// Vertex bindings and attributes
    fn vertex_input(&self) -> VulkanResult<VertexInput>;

    /// Fixed-function state
    fn pipeline_config(&self) -> PipelineConfig;
}

/// Built-in pipeline flavors with their standard vertex formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Lit meshes ([`ModelVertex`])
    Model,
    /// Debug lines ([`LineVertex`])
    Line,
    /// Meshes as edges ([`ModelVertex`])
    Wireframe,
    /// Skybox cube ([`PositionVertex`])
    Skybox,
    /// Overlay ([`UiVertex`])
    Ui,
    /// Fullscreen triangle, no vertex buffer
    Fullscreen,
}

impl PipelineProvider for PipelineKind {
    fn vertex_input(&self) -> VulkanResult<VertexInput> {
        const VEC2: vk::Format = vk::Format::R32G32_SFLOAT;
        const VEC3: vk::Format = vk::Format::R32G32B32_SFLOAT;
        const VEC4: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

        match self {
            Self::Model | Self::Wireframe => VertexInput::interleaved::<ModelVertex>(&[VEC3, VEC3, VEC3, VEC2]),
            Self::Line => VertexInput::interleaved::<LineVertex>(&[VEC3, VEC3]),
            Self::Skybox => VertexInput::interleaved::<PositionVertex>(&[VEC3]),
            Self::Ui => VertexInput::interleaved::<UiVertex>(&[VEC2, VEC2, VEC4]),
            Self::Fullscreen => Ok(VertexInput::empty()),
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        match self {
            Self::Model => PipelineConfig::model(),
            Self::Line => PipelineConfig::line_list(),
            Self::Wireframe => PipelineConfig::wireframe(),
            Self::Skybox => PipelineConfig::skybox(),
            Self::Ui => PipelineConfig::ui(),
            Self::Fullscreen => PipelineConfig::fullscreen(),
        }
    }
}

/// SPIR-V shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Arc<Device>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Arc<Device>, bytes: &[u8]) -> VulkanResult<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|err| VulkanError::Shader(format!("invalid SPIR-V: {err}")))?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device: Arc::clone(device), module })
    }

    /// Load a shader module from a SPIR-V file
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|err| VulkanError::Shader(format!("failed to read {}: {err}", path.display())))?;
        Self::from_bytes(device, &bytes)
    }

    /// Shader module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage info with the `main` entry point
    pub fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_shader_module(self.module, None);
        }
    }
}

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Push constant range sized to `T`
pub const fn push_constant_range<T>(stages: vk::ShaderStageFlags) -> vk::PushConstantRange {
    vk::PushConstantRange { stage_flags: stages, offset: 0, size: std::mem::size_of::<T>() as u32 }
}

/// Attachment setup a pipeline is compiled against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineTarget {
    /// Classic render pass; the subpass comes from [`PipelineConfig::subpass`]
    RenderPass {
        /// Render pass handle
        render_pass: vk::RenderPass,
        /// Subpasses in the render pass
        subpass_count: u32,
        /// Color attachments written by the subpass
        color_attachment_count: u32,
    },
    /// Dynamic rendering with these attachment formats
    Dynamic {
        /// Color attachment formats
        color_formats: Vec<vk::Format>,
        /// Depth attachment format
        depth_format: vk::Format,
    },
}

impl PipelineTarget {
    /// Whatever the swapchain renders with
    pub fn for_swapchain(swapchain: &Swapchain) -> Self {
        match swapchain.forward_pass() {
            Some(render_pass) => Self::from_render_pass(render_pass),
            None => Self::Dynamic { color_formats: vec![swapchain.format()], depth_format: swapchain.depth_format() },
        }
    }

    /// Target a render pass wrapper
    pub fn from_render_pass(render_pass: &RenderPass) -> Self {
        Self::RenderPass {
            render_pass: render_pass.handle(),
            subpass_count: render_pass.subpass_count(),
            color_attachment_count: render_pass.color_attachment_count(),
        }
    }

    /// Number of color attachments the pipeline writes
    pub fn color_attachment_count(&self) -> usize {
        match self {
            Self::RenderPass { color_attachment_count, .. } => *color_attachment_count as usize,
            Self::Dynamic { color_formats, .. } => color_formats.len(),
        }
    }

    /// Reject a config whose subpass does not exist in this target
    pub fn validate(&self, config: &PipelineConfig) -> VulkanResult<()> {
        match self {
            Self::RenderPass { subpass_count, .. } if config.subpass >= *subpass_count => {
                Err(VulkanError::invalid(format!(
                    "subpass {} requested but the render pass has {subpass_count}",
                    config.subpass
                )))
            }
            Self::Dynamic { .. } if config.subpass != 0 => Err(VulkanError::invalid(format!(
                "subpass {} requested but dynamic rendering has no subpasses",
                config.subpass
            ))),
            _ => Ok(()),
        }
    }
}

/// One blend state per color attachment of `target`
fn color_blend_attachments(config: &PipelineConfig, target: &PipelineTarget) -> Vec<vk::PipelineColorBlendAttachmentState> {
    vec![config.blend_mode.attachment_state(); target.color_attachment_count()]
}

/// Recipe for a graphics pipeline
#[derive(Clone)]
pub struct PipelineBuilder {
    device: Arc<Device>,
    vertex_spv: Vec<u8>,
    fragment_spv: Vec<u8>,
    config: PipelineConfig,
    vertex_input: VertexInput,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constants: Option<vk::PushConstantRange>,
    target: Option<PipelineTarget>,
}

impl PipelineBuilder {
    /// Start from two SPIR-V blobs with the default config and no vertex input
    pub fn new(device: &Arc<Device>, vertex_spv: &[u8], fragment_spv: &[u8]) -> Self {
        Self {
            device: Arc::clone(device),
            vertex_spv: vertex_spv.to_vec(),
            fragment_spv: fragment_spv.to_vec(),
            config: PipelineConfig::default(),
            vertex_input: VertexInput::empty(),
            set_layouts: Vec::new(),
            push_constants: None,
            target: None,
        }
    }

    /// Read `{name}.spv` shaders through `shaders`
    pub fn from_shader_names(
        device: &Arc<Device>,
        shaders: &ShaderConfig,
        vertex: &str,
        fragment: &str,
    ) -> VulkanResult<Self> {
        let read = |name: &str| {
            let path = shaders.resolve(name);
            std::fs::read(&path).map_err(|err| VulkanError::Shader(format!("failed to read {}: {err}", path.display())))
        };
        Ok(Self::new(device, &read(vertex)?, &read(fragment)?))
    }

    /// Take vertex input and config from a provider
    pub fn provider(mut self, provider: &dyn PipelineProvider) -> VulkanResult<Self> {
        self.vertex_input = provider.vertex_input()?;
        self.config = provider.pipeline_config();
        Ok(self)
    }

    /// Replace the fixed-function config
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the vertex input
    #[must_use]
    pub fn vertex_input(mut self, vertex_input: VertexInput) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    /// Descriptor set layouts, in set order
    #[must_use]
    pub fn descriptor_set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    /// One push constant range sized to `T`
    #[must_use]
    pub fn push_constants<T>(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.push_constants = Some(push_constant_range::<T>(stages));
        self
    }

    /// Compile against a render pass
    #[must_use]
    pub fn render_pass(mut self, render_pass: &RenderPass) -> Self {
        self.target = Some(PipelineTarget::from_render_pass(render_pass));
        self
    }

    /// Compile for dynamic rendering
    #[must_use]
    pub fn dynamic_rendering(mut self, color_formats: &[vk::Format], depth_format: vk::Format) -> Self {
        self.target = Some(PipelineTarget::Dynamic { color_formats: color_formats.to_vec(), depth_format });
        self
    }

    /// Compile against `target`
    #[must_use]
    pub fn target(mut self, target: PipelineTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Current fixed-function config
    pub const fn pipeline_config(&self) -> &PipelineConfig {
        &self.config
    }

    fn check(&self) -> VulkanResult<&PipelineTarget> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("pipeline has no render pass or dynamic rendering target"))?;
        target.validate(&self.config)?;

        if matches!(target, PipelineTarget::Dynamic { .. }) && self.device.rendering_mode() != RenderingMode::Dynamic {
            return Err(VulkanError::invalid("dynamic rendering was not enabled on the device"));
        }
        if self.config.needs_non_solid_fill() && !self.device.supports_wireframe() {
            return Err(VulkanError::invalid("device does not support non-solid polygon modes"));
        }
        if let Some(range) = self.push_constants {
            let limit = self.device.properties().limits.max_push_constants_size;
            if range.size > limit {
                return Err(VulkanError::invalid(format!(
                    "push constants of {} bytes exceed the device limit of {limit}",
                    range.size
                )));
            }
        }
        Ok(target)
    }

    /// Create the pipeline layout and pipeline
    pub fn build(&self) -> VulkanResult<PipelineData> {
        let target = self.check()?;
        let device = self.device.handle();

        let vertex_shader = ShaderModule::from_bytes(&self.device, &self.vertex_spv)?;
        let fragment_shader = ShaderModule::from_bytes(&self.device, &self.fragment_spv)?;
        let stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let push_constant_ranges: Vec<vk::PushConstantRange> = self.push_constants.into_iter().collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(VulkanError::Api)?;

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&self.vertex_input.bindings)
            .vertex_attribute_descriptions(&self.vertex_input.attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.config.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterizer = self.config.rasterization_state();
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = self.config.depth_stencil_state();
        let color_blend_attachments = color_blend_attachments(&self.config, target);
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);
        let dynamic_states = self.config.resolved_dynamic_states();
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let (color_formats, depth_format) = match target {
            PipelineTarget::Dynamic { color_formats, depth_format } => (color_formats.as_slice(), *depth_format),
            PipelineTarget::RenderPass { .. } => (&[][..], vk::Format::UNDEFINED),
        };
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout);
        let pipeline_info = match target {
            PipelineTarget::RenderPass { render_pass, .. } => {
                pipeline_info.render_pass(*render_pass).subpass(self.config.subpass)
            }
            PipelineTarget::Dynamic { .. } => pipeline_info.push_next(&mut rendering_info),
        };

        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(VulkanError::Api(err));
            }
        };

        log::debug!(
            "Created pipeline ({:?}, {:?}, cull {:?}, blend {:?})",
            self.config.topology,
            self.config.polygon_mode,
            self.config.cull_mode,
            self.config.blend_mode
        );
        Ok(PipelineData { device: Arc::clone(&self.device), pipeline, layout })
    }
}

/// Graphics pipeline and its layout with RAII cleanup
pub struct PipelineData {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl PipelineData {
    /// Pipeline handle
    pub const fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout handle
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Bind as the graphics pipeline
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        }
    }

    /// Bind descriptor sets starting at `first_set`
    pub fn bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
    }

    /// Push `value` at offset 0
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        command_buffer: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_push_constants(command_buffer, self.layout, stages, 0, bytemuck::bytes_of(value));
        }
    }
}

impl Drop for PipelineData {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
            self.device.handle().destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Something [`PipelineSet`] can build and rebuild against a new target
pub trait PipelineRecipe {
    /// What a successful build produces
    type Pipeline;

    /// Create the pipeline
    fn build(&self) -> VulkanResult<Self::Pipeline>;

    /// Point later builds at `target`
    fn retarget(&mut self, target: &PipelineTarget);
}

impl PipelineRecipe for PipelineBuilder {
    type Pipeline = PipelineData;

    fn build(&self) -> VulkanResult<PipelineData> {
        PipelineBuilder::build(self)
    }

    fn retarget(&mut self, target: &PipelineTarget) {
        self.target = Some(target.clone());
    }
}

struct PipelineEntry<R: PipelineRecipe> {
    recipe: R,
    data: Option<R::Pipeline>,
}

/// Named pipelines that can be rebuilt together
pub struct PipelineSet<R: PipelineRecipe = PipelineBuilder> {
    entries: HashMap<String, PipelineEntry<R>>,
}

impl<R: PipelineRecipe> Default for PipelineSet<R> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<R: PipelineRecipe> PipelineSet<R> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build `recipe` and store it under `name`, replacing any previous entry
    ///
    /// The previous pipeline is only released once the new one has been
    /// built; a failed build leaves it in place.
    pub fn insert(&mut self, name: impl Into<String>, recipe: R) -> VulkanResult<&R::Pipeline> {
        let name = name.into();
        let data = recipe.build()?;
        log::info!("Pipeline '{name}' built");

        let entry = PipelineEntry { recipe, data: None };
        let slot = match self.entries.entry(name) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                *slot = entry;
                slot
            }
            Entry::Vacant(vacant) => vacant.insert(entry),
        };
        Ok(slot.data.insert(data))
    }

    /// Pipeline stored under `name`
    pub fn get(&self, name: &str) -> Option<&R::Pipeline> {
        self.entries.get(name).and_then(|entry| entry.data.as_ref())
    }

    /// Drop the pipeline stored under `name`
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Number of stored pipelines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no pipelines are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild every pipeline against `target`, releasing each old
    /// pipeline before its replacement is created
    pub fn rebuild_all(&mut self, target: &PipelineTarget) -> VulkanResult<()> {
        for (name, entry) in &mut self.entries {
            entry.data = None;
            entry.recipe.retarget(target);
            entry.data = Some(entry.recipe.build()?);
            log::debug!("Pipeline '{name}' rebuilt");
        }
        log::info!("Rebuilt {} pipelines", self.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_default_is_model() {
        let config = PipelineConfig::default();
        assert_eq!(config, PipelineConfig::model());
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.polygon_mode, PolygonMode::Fill);
        assert_eq!(config.cull_mode, CullMode::Back);
        assert_eq!(config.front_face, vk::FrontFace::CLOCKWISE);
        assert_eq!(config.depth_compare, vk::CompareOp::LESS);
        assert!(config.depth_test && config.depth_write);
        assert_eq!(config.blend_mode, BlendMode::None);
        assert_eq!(config.subpass, 0);
        assert_relative_eq!(config.line_width, 1.0);
    }

    #[test]
    fn test_presets() {
        assert_eq!(PipelineConfig::line_list().topology, vk::PrimitiveTopology::LINE_LIST);
        assert!(PipelineConfig::wireframe().needs_non_solid_fill());
        assert!(!PipelineConfig::model().needs_non_solid_fill());

        let skybox = PipelineConfig::skybox();
        assert!(!skybox.depth_test && !skybox.depth_write);
        assert_eq!(skybox.cull_mode, CullMode::Back);

        let ui = PipelineConfig::ui();
        assert!(!ui.depth_test);
        assert_eq!(ui.blend_mode, BlendMode::Alpha);

        let second = PipelineConfig::second_subpass();
        assert_eq!(second.subpass, 1);
        assert_eq!(second.cull_mode, CullMode::None);
        assert!(!second.depth_test);

        let particles = PipelineConfig::particles();
        assert_eq!(particles.subpass, 1);
        assert_eq!(particles.blend_mode, BlendMode::Additive);
        assert!(!particles.depth_write);
    }

    #[test]
    fn test_viewport_and_scissor_always_dynamic() {
        let config = PipelineConfig { dynamic_states: vec![vk::DynamicState::LINE_WIDTH], ..PipelineConfig::default() };
        let states = config.resolved_dynamic_states();
        assert_eq!(
            states,
            vec![vk::DynamicState::LINE_WIDTH, vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
        assert_eq!(PipelineConfig::default().resolved_dynamic_states().len(), 2);
    }

    #[test]
    fn test_blend_states() {
        let opaque = BlendMode::None.attachment_state();
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);

        let alpha = BlendMode::Alpha.attachment_state();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);

        let additive = BlendMode::Additive.attachment_state();
        assert_eq!(additive.dst_color_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn test_fixed_function_states_follow_config() {
        let raster = PipelineConfig::wireframe().rasterization_state();
        assert_eq!(raster.polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::NONE);

        let depth = PipelineConfig::skybox().depth_stencil_state();
        assert_eq!(depth.depth_test_enable, vk::FALSE);
        assert_eq!(depth.depth_write_enable, vk::FALSE);
        assert_eq!(depth.stencil_test_enable, vk::FALSE);
    }

    #[test]
    fn test_standard_vertex_formats_are_packed() {
        let kinds = [
            (PipelineKind::Model, std::mem::size_of::<ModelVertex>()),
            (PipelineKind::Line, std::mem::size_of::<LineVertex>()),
            (PipelineKind::Skybox, std::mem::size_of::<PositionVertex>()),
            (PipelineKind::Ui, std::mem::size_of::<UiVertex>()),
        ];
        for (kind, size) in kinds {
            let input = kind.vertex_input().unwrap();
            assert_eq!(input.stride() as usize, size, "{kind:?}");

            let last = input.attributes.last().unwrap();
            assert_eq!((last.offset + format_size(last.format).unwrap()) as usize, size, "{kind:?}");
            for (location, attribute) in input.attributes.iter().enumerate() {
                assert_eq!(attribute.location as usize, location);
                assert_eq!(attribute.binding, 0);
            }
        }
    }

    #[test]
    fn test_model_vertex_offsets() {
        let input = PipelineKind::Model.vertex_input().unwrap();
        let offsets: Vec<u32> = input.attributes.iter().map(|attribute| attribute.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36]);
        assert_eq!(input.stride(), 44);
    }

    #[test]
    fn test_fullscreen_has_no_vertex_input() {
        let input = PipelineKind::Fullscreen.vertex_input().unwrap();
        assert!(input.bindings.is_empty());
        assert!(input.attributes.is_empty());
        assert_eq!(input.stride(), 0);
        assert!(!PipelineKind::Fullscreen.pipeline_config().depth_test);
    }

    #[test]
    fn test_kind_configs() {
        assert_eq!(PipelineKind::Wireframe.pipeline_config().polygon_mode, PolygonMode::Line);
        assert_eq!(PipelineKind::Line.pipeline_config().topology, vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(PipelineKind::Ui.pipeline_config().blend_mode, BlendMode::Alpha);
    }

    #[test]
    fn test_push_constant_range_sized_to_type() {
        #[allow(dead_code)]
        struct Push {
            transform: [[f32; 4]; 4],
            color: [f32; 4],
        }
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let range = push_constant_range::<Push>(stages);
        assert_eq!(range.size, 80);
        assert_eq!(range.offset, 0);
        assert_eq!(range.stage_flags, stages);
    }

    #[test]
    fn test_entry_point_is_main() {
        assert_eq!(ENTRY_POINT.to_str().unwrap(), "main");
    }

    #[test]
    fn test_unknown_vertex_format_is_rejected() {
        assert_eq!(format_size(vk::Format::R32G32B32_SFLOAT), Some(12));
        assert_eq!(format_size(vk::Format::D32_SFLOAT), None);

        let result = VertexInput::interleaved::<ModelVertex>(&[vk::Format::R32G32B32_SFLOAT, vk::Format::D32_SFLOAT]);
        assert!(matches!(result, Err(VulkanError::InvalidArgument(_))));
    }

    #[test]
    fn test_attributes_larger_than_vertex_are_rejected() {
        let vec4 = vk::Format::R32G32B32A32_SFLOAT;
        let result = VertexInput::interleaved::<PositionVertex>(&[vec4]);
        assert!(matches!(result, Err(VulkanError::InvalidArgument(_))));

        // A shorter read of a larger vertex is fine.
        let partial = VertexInput::interleaved::<ModelVertex>(&[vk::Format::R32G32B32_SFLOAT]).unwrap();
        assert_eq!(partial.stride(), 44);
    }

    fn single_subpass_pass() -> PipelineTarget {
        PipelineTarget::RenderPass { render_pass: vk::RenderPass::null(), subpass_count: 1, color_attachment_count: 1 }
    }

    #[test]
    fn test_subpass_must_exist_in_target() {
        let forward = single_subpass_pass();
        assert!(forward.validate(&PipelineConfig::model()).is_ok());
        assert!(matches!(
            forward.validate(&PipelineConfig::particles()),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(forward.validate(&PipelineConfig::second_subpass()).is_err());

        let two_subpasses =
            PipelineTarget::RenderPass { render_pass: vk::RenderPass::null(), subpass_count: 2, color_attachment_count: 1 };
        assert!(two_subpasses.validate(&PipelineConfig::particles()).is_ok());

        let dynamic = PipelineTarget::Dynamic {
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: vk::Format::D32_SFLOAT,
        };
        assert!(dynamic.validate(&PipelineConfig::ui()).is_ok());
        assert!(dynamic.validate(&PipelineConfig::second_subpass()).is_err());
    }

    #[test]
    fn test_blend_state_per_color_attachment() {
        let config = PipelineConfig::ui();
        assert_eq!(color_blend_attachments(&config, &single_subpass_pass()).len(), 1);

        let gbuffer = PipelineTarget::Dynamic {
            color_formats: vec![
                vk::Format::R16G16B16A16_SFLOAT,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::Format::R8G8B8A8_UNORM,
            ],
            depth_format: vk::Format::D32_SFLOAT,
        };
        let states = color_blend_attachments(&config, &gbuffer);
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|state| state.blend_enable == vk::TRUE));

        let depth_only = PipelineTarget::Dynamic { color_formats: Vec::new(), depth_format: vk::Format::D32_SFLOAT };
        assert!(color_blend_attachments(&config, &depth_only).is_empty());
    }

    type BuildLog = Rc<RefCell<Vec<String>>>;

    struct LoggedPipeline {
        name: &'static str,
        log: BuildLog,
    }

    impl Drop for LoggedPipeline {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("drop {}", self.name));
        }
    }

    struct LoggedRecipe {
        name: &'static str,
        fails: bool,
        target: Option<PipelineTarget>,
        log: BuildLog,
    }

    impl LoggedRecipe {
        fn new(name: &'static str, log: &BuildLog) -> Self {
            Self { name, fails: false, target: None, log: Rc::clone(log) }
        }

        fn failing(name: &'static str, log: &BuildLog) -> Self {
            Self { fails: true, ..Self::new(name, log) }
        }
    }

    impl PipelineRecipe for LoggedRecipe {
        type Pipeline = LoggedPipeline;

        fn build(&self) -> VulkanResult<LoggedPipeline> {
            if self.fails {
                self.log.borrow_mut().push(format!("fail {}", self.name));
                return Err(VulkanError::Shader(format!("{} does not compile", self.name)));
            }
            self.log.borrow_mut().push(format!("build {}", self.name));
            Ok(LoggedPipeline { name: self.name, log: Rc::clone(&self.log) })
        }

        fn retarget(&mut self, target: &PipelineTarget) {
            self.target = Some(target.clone());
        }
    }

    #[test]
    fn test_failed_replacement_keeps_previous_pipeline() {
        let log = BuildLog::default();
        let mut set = PipelineSet::new();
        set.insert("scene", LoggedRecipe::new("v1", &log)).unwrap();

        assert!(set.insert("scene", LoggedRecipe::failing("v2", &log)).is_err());
        assert_eq!(set.get("scene").map(|pipeline| pipeline.name), Some("v1"));
        assert_eq!(set.len(), 1);
        assert_eq!(*log.borrow(), vec!["build v1", "fail v2"]);
    }

    #[test]
    fn test_replacement_is_built_before_old_is_dropped() {
        let log = BuildLog::default();
        let mut set = PipelineSet::new();
        set.insert("scene", LoggedRecipe::new("v1", &log)).unwrap();
        let replaced = set.insert("scene", LoggedRecipe::new("v2", &log)).unwrap();
        assert_eq!(replaced.name, "v2");
        assert_eq!(*log.borrow(), vec!["build v1", "build v2", "drop v1"]);
    }

    #[test]
    fn test_rebuild_all_releases_before_rebuilding() {
        let log = BuildLog::default();
        let mut set = PipelineSet::new();
        set.insert("scene", LoggedRecipe::new("scene", &log)).unwrap();
        log.borrow_mut().clear();

        let target = single_subpass_pass();
        set.rebuild_all(&target).unwrap();
        assert_eq!(*log.borrow(), vec!["drop scene", "build scene"]);
        assert_eq!(set.entries["scene"].recipe.target, Some(target));
        assert!(set.remove("scene"));
        assert!(set.is_empty());
    }
}
