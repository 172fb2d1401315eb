//! # Renderer Configuration
//!
//! Serializable settings threaded through `Device`, `Renderer` and the
//! descriptor/pipeline helpers. Files are TOML or RON, picked by extension.
//! Nothing here is global: each subsystem receives the struct it needs.

use ash::vk;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration trait
pub trait Config: Serialize + DeserializeOwned + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match extension(path) {
            Some("toml") => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            Some("ron") => ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match extension(path) {
            Some("toml") => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            Some("ron") => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load from `path` when it exists, otherwise fall back to defaults
    fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of its accepted range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Smallest accepted frames-in-flight depth
pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
/// Largest accepted frames-in-flight depth
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// How color/depth attachments are bound while recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RenderingMode {
    /// Classic render pass with one framebuffer per swapchain image
    #[default]
    RenderPass,
    /// Vulkan 1.3 dynamic rendering with explicit layout barriers
    Dynamic,
}

/// Shader lookup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Directory holding compiled `.spv` files
    pub directory: PathBuf,
}

impl ShaderConfig {
    /// Create a shader configuration rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    /// Path of the compiled binary for shader `name`
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.spv"))
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::new("target/shaders")
    }
}

/// Serializable mirror of the descriptor types the pools are sized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// `UNIFORM_BUFFER`
    UniformBuffer,
    /// `UNIFORM_BUFFER_DYNAMIC`
    UniformBufferDynamic,
    /// `STORAGE_BUFFER`
    StorageBuffer,
    /// `STORAGE_BUFFER_DYNAMIC`
    StorageBufferDynamic,
    /// `COMBINED_IMAGE_SAMPLER`
    CombinedImageSampler,
    /// `SAMPLED_IMAGE`
    SampledImage,
    /// `SAMPLER`
    Sampler,
    /// `STORAGE_IMAGE`
    StorageImage,
    /// `INPUT_ATTACHMENT`
    InputAttachment,
}

impl DescriptorKind {
    /// The Vulkan descriptor type
    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }
}

/// One `{type, count}` entry of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizeConfig {
    /// Descriptor type
    pub kind: DescriptorKind,
    /// Number of descriptors of that type
    pub count: u32,
}

/// Default sizing for descriptor pools created from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    /// Maximum number of sets the pool hands out
    pub max_sets: u32,
    /// Per-type descriptor capacity
    pub pool_sizes: Vec<PoolSizeConfig>,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: 1000,
            pool_sizes: vec![
                PoolSizeConfig { kind: DescriptorKind::UniformBuffer, count: 1000 },
                PoolSizeConfig { kind: DescriptorKind::UniformBufferDynamic, count: 1000 },
                PoolSizeConfig { kind: DescriptorKind::StorageBuffer, count: 1000 },
                PoolSizeConfig { kind: DescriptorKind::CombinedImageSampler, count: 1000 },
            ],
        }
    }
}

/// # Vulkan Renderer Configuration
///
/// Application metadata, frame pacing and debug features for `Device` and `Renderer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// CPU-ahead-of-GPU depth, 2 to 4
    pub max_frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Present with FIFO when set
    pub vsync: bool,
    /// Attachment binding style
    pub rendering_mode: RenderingMode,
    /// Color attachment clear value
    pub clear_color: [f32; 4],
    /// Depth attachment clear value
    pub clear_depth: f32,
    /// Shader lookup
    pub shaders: ShaderConfig,
    /// Default descriptor pool sizing
    pub descriptor_pool: DescriptorPoolConfig,
    /// Default log filter
    pub log_level: String,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            max_frames_in_flight: MIN_FRAMES_IN_FLIGHT,
            enable_validation: None,
            vsync: true,
            rendering_mode: RenderingMode::RenderPass,
            clear_color: [0.35, 0.35, 0.35, 0.0],
            clear_depth: 1.0,
            shaders: ShaderConfig::default(),
            descriptor_pool: DescriptorPoolConfig::default(),
            log_level: "info".to_string(),
        }
    }

    /// Set application version
    #[must_use]
    pub const fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set maximum frames in flight
    #[must_use]
    pub const fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Select the present mode policy
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Select render pass or dynamic rendering
    #[must_use]
    pub const fn with_rendering_mode(mut self, mode: RenderingMode) -> Self {
        self.rendering_mode = mode;
        self
    }

    /// Set the color clear value
    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set custom shader configuration
    #[must_use]
    pub fn with_shaders(mut self, shaders: ShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }

        if !(MIN_FRAMES_IN_FLIGHT..=MAX_FRAMES_IN_FLIGHT).contains(&self.max_frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "max frames in flight must be between {MIN_FRAMES_IN_FLIGHT} and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.max_frames_in_flight
            )));
        }

        if self.descriptor_pool.max_sets == 0 {
            return Err(ConfigError::Invalid("descriptor pool needs at least one set".to_string()));
        }

        if !(0.0..=1.0).contains(&self.clear_depth) {
            return Err(ConfigError::Invalid(format!("clear depth {} outside [0, 1]", self.clear_depth)));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("gpu_core application")
    }
}

impl Config for RendererConfig {}
