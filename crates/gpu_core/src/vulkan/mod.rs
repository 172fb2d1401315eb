//! Vulkan wrappers
//!
//! Every wrapper owns its handles and releases them in `Drop`, holding an
//! `Arc<Device>` so the logical device outlives everything created from it.

/// Instance and validation messenger
pub mod instance;
/// Presentation surface
pub mod surface;
/// Physical and logical device, queues and the submission lock
pub mod device;
/// Memory type and format selection
pub mod memory;
/// Host-visible and device-local buffers
pub mod buffer;
/// Descriptor set layouts, pools and writers
pub mod descriptors;
/// Semaphores and fences
pub mod sync;
/// Command pools
pub mod commands;
/// Image views and the depth attachment
pub mod image;
/// Render pass and framebuffers
pub mod render_pass;
/// Swapchain and per-frame synchronization
pub mod swapchain;

pub use buffer::{BufferLayout, BufferSpec, GpuBuffer, MappedRegion, WHOLE_SIZE};
pub use commands::CommandPool;
pub use descriptors::{
    DescriptorPool, DescriptorPoolBuilder, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    PoolBudget,
};
pub use device::{Device, PhysicalDeviceInfo, QueueFamilies};
pub use image::{DepthBuffer, ImageView};
pub use instance::VulkanInstance;
pub use render_pass::{Framebuffer, RenderPass};
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainSettings, SwapchainSupport};
pub use sync::{Fence, FrameSync, Semaphore};
