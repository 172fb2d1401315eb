//! # GPU Core
//!
//! Vulkan device, buffer, descriptor, swapchain and frame-synchronization
//! core for a real-time renderer.
//!
//! - **Device**: instance, surface, physical device selection, queues and a
//!   submission lock shared by every thread that touches the queue
//! - **Buffers**: alignment-correct instance indexing, mapping, flush/invalidate
//! - **Descriptors**: layout builder, budgeted pool, batched writer
//! - **Swapchain**: images, depth, render pass or dynamic rendering, per-frame sync
//! - **Renderer**: begin/end frame with transparent swapchain recreation
//! - **Pipelines**: config presets, vertex formats and a rebuildable builder
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpu_core::prelude::*;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::new("demo");
//!     let mut window = GlfwWindow::new("demo", 1280, 720)?;
//!     let device = Arc::new(Device::new(&mut window, &config)?);
//!     let mut renderer = Renderer::new(&device, &window, &config)?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         if let Some(frame) = renderer.begin_frame(&mut window)? {
//!             renderer.begin_rendering(&frame)?;
//!             renderer.end_rendering(&frame)?;
//!             renderer.end_frame(&mut window, frame)?;
//!         }
//!     }
//!     renderer.wait_idle()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod renderer;
pub mod vulkan;
pub mod window;

pub use error::{VulkanError, VulkanResult};

/// Common imports for renderer users
pub mod prelude {
    pub use crate::config::{
        Config, ConfigError, DescriptorPoolConfig, RendererConfig, RenderingMode, ShaderConfig,
    };
    pub use crate::error::{VulkanError, VulkanResult};
    pub use crate::frame::{AcquireStatus, FrameLoop, FrameScheduler, FrameTarget, PresentStatus};
    pub use crate::pipeline::{
        BlendMode, CullMode, PipelineBuilder, PipelineConfig, PipelineData, PipelineKind, PipelineProvider,
        PipelineRecipe, PipelineSet, PipelineTarget, PolygonMode, VertexInput,
    };
    pub use crate::renderer::{CommandBufferLevel, FrameContext, Renderer};
    pub use crate::vulkan::{
        BufferSpec, DescriptorPool, DescriptorSetLayout, DescriptorWriter, Device, GpuBuffer, Swapchain, WHOLE_SIZE,
    };
    pub use crate::window::{GlfwWindow, RenderWindow};
}
