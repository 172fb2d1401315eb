//! Error types shared by every GPU component

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The Vulkan loader could not be opened
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Instance, device, swapchain or pipeline construction failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No physical device satisfies the queue, extension and surface requirements
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No memory type satisfies the requested property mask
    #[error("No suitable memory type for bits {type_bits:#b} with {properties:?}")]
    NoSuitableMemoryType {
        /// Memory type bits allowed by the resource
        type_bits: u32,
        /// Required property flags
        properties: vk::MemoryPropertyFlags,
    },

    /// None of the candidate formats supports the requested features
    #[error("No supported format among candidates")]
    UnsupportedFormat,

    /// The device was lost; there is no recovery path
    #[error("Device lost")]
    DeviceLost,

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// A caller-supplied size, format or layout cannot be represented
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A host access fell outside the buffer
    #[error("Access of {size} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        /// Byte offset of the access
        offset: u64,
        /// Byte length of the access
        size: u64,
        /// Total buffer size
        capacity: u64,
    },

    /// Descriptor pool has no room for another set of the requested shape
    #[error("Descriptor pool exhausted")]
    PoolExhausted,

    /// Shader binary could not be read or parsed
    #[error("Shader error: {0}")]
    Shader(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Window system error
    #[error("Window error: {0}")]
    Window(String),
}

impl VulkanError {
    /// Maps a raw result from a device-wide wait, promoting `ERROR_DEVICE_LOST`
    pub fn from_wait(result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost
        } else {
            Self::Api(result)
        }
    }

    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
