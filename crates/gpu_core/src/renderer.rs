//! Frame lifecycle on top of the swapchain
//!
//! ```text
//! let frame = renderer.begin_frame(&mut window)?;   // None: skip this tick
//! renderer.begin_rendering(&frame)?;
//! ... bind pipeline, draw ...
//! renderer.end_rendering(&frame)?;
//! renderer.end_frame(&mut window, frame)?;
//! ```
//!
//! Command buffers belong to swapchain images, semaphores and fences to frame
//! slots; see [`crate::frame`]. Render systems record only into the
//! [`FrameContext`] handed out by the current `begin_frame`.

use ash::vk;
use std::sync::Arc;

use crate::config::RendererConfig;
use crate::error::{VulkanError, VulkanResult};
use crate::frame::{FrameLoop, FrameTarget};
use crate::vulkan::commands::CommandPool;
use crate::vulkan::device::Device;
use crate::vulkan::image::subresource_range;
use crate::vulkan::memory;
use crate::vulkan::swapchain::Swapchain;
use crate::window::RenderWindow;

/// How frame command buffers are begun
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandBufferLevel {
    /// Recorded and submitted once per frame
    #[default]
    Primary,
    /// Begun with `SIMULTANEOUS_USE` so it may be pending more than once
    Secondary,
}

impl CommandBufferLevel {
    /// Usage flags for `vkBeginCommandBuffer`
    pub const fn begin_flags(self) -> vk::CommandBufferUsageFlags {
        match self {
            Self::Primary => vk::CommandBufferUsageFlags::empty(),
            Self::Secondary => vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
        }
    }
}

/// The frame currently being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Command buffer owned by the acquired image
    pub command_buffer: vk::CommandBuffer,
    /// Frame slot whose semaphores and fence guard this frame
    pub frame_index: usize,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Swapchain extent while this frame was acquired
    pub extent: vk::Extent2D,
}

/// Drives acquire, record, submit and present for one window
pub struct Renderer {
    command_pool: CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    frames: FrameLoop<Swapchain>,
    level: CommandBufferLevel,
    current: Option<FrameContext>,
    clear_color: [f32; 4],
    clear_depth: f32,
    device: Arc<Device>,
}

impl Renderer {
    /// Create the swapchain and per-image command buffers
    pub fn new(device: &Arc<Device>, window: &dyn RenderWindow, config: &RendererConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|err| VulkanError::InitializationFailed(err.to_string()))?;

        let swapchain = Swapchain::from_config(device, config, window.framebuffer_extent())?;
        let command_pool = CommandPool::new(device, device.queue_families().graphics)?;

        let mut renderer = Self {
            command_pool,
            command_buffers: Vec::new(),
            frames: FrameLoop::new(swapchain),
            level: CommandBufferLevel::Primary,
            current: None,
            clear_color: config.clear_color,
            clear_depth: config.clear_depth,
            device: Arc::clone(device),
        };
        renderer.sync_command_buffers()?;

        log::info!(
            "Renderer ready: {} frames in flight, {} command buffers",
            config.max_frames_in_flight,
            renderer.command_buffers.len()
        );
        Ok(renderer)
    }

    /// Begin frame command buffers with `level`'s usage flags
    #[must_use]
    pub const fn with_command_buffer_level(mut self, level: CommandBufferLevel) -> Self {
        self.level = level;
        self
    }

    /// One command buffer per swapchain image, reallocated when the count changes
    fn sync_command_buffers(&mut self) -> VulkanResult<()> {
        let image_count = self.frames.target()?.image_count();
        if self.command_buffers.len() == image_count {
            return Ok(());
        }
        self.command_pool.free_command_buffers(&self.command_buffers);
        self.command_buffers.clear();
        self.command_buffers = self
            .command_pool
            .allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, image_count as u32)?;
        log::debug!("Allocated {image_count} frame command buffers");
        Ok(())
    }

    /// Acquire an image and start recording its command buffer
    ///
    /// Returns `None` when a frame is already in progress or the swapchain
    /// had to be recreated; the caller skips rendering for this tick.
    pub fn begin_frame(&mut self, window: &mut dyn RenderWindow) -> VulkanResult<Option<FrameContext>> {
        if self.current.is_some() {
            log::warn!("Cannot begin a frame while another is in progress");
            return Ok(None);
        }

        let generation = self.frames.generation();
        let acquired = self.frames.begin_frame(|| wait_for_extent(window))?;
        if self.frames.generation() != generation {
            self.sync_command_buffers()?;
        }
        let Some(image_index) = acquired else {
            return Ok(None);
        };

        let Some(command_buffer) = self.command_buffers.get(image_index as usize).copied() else {
            self.frames.abandon_frame();
            return Err(VulkanError::invalid(format!("no command buffer for image {image_index}")));
        };

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(self.level.begin_flags());
        let begun = unsafe {
            let device = self.device.handle();
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .and_then(|()| device.begin_command_buffer(command_buffer, &begin_info))
        };
        if let Err(err) = begun {
            self.frames.abandon_frame();
            return Err(VulkanError::Api(err));
        }

        let frame = FrameContext {
            command_buffer,
            frame_index: self.frames.scheduler().current_frame(),
            image_index,
            extent: self.frames.target()?.extent(),
        };
        self.current = Some(frame);
        Ok(Some(frame))
    }

    /// Finish recording, submit and present; recreates the swapchain when
    /// presentation reports it stale or the window was resized
    pub fn end_frame(&mut self, window: &mut dyn RenderWindow, frame: FrameContext) -> VulkanResult<()> {
        match self.current {
            None => return Err(VulkanError::invalid("end_frame called with no frame in progress")),
            Some(current) if current != frame => {
                return Err(VulkanError::invalid(format!(
                    "end_frame called for image {} while image {} is in progress",
                    frame.image_index, current.image_index
                )));
            }
            Some(_) => {}
        }
        self.current = None;

        if let Err(err) = unsafe { self.device.handle().end_command_buffer(frame.command_buffer) } {
            self.frames.abandon_frame();
            return Err(VulkanError::Api(err));
        }

        let resized = window.take_resized();
        let recreated = self
            .frames
            .end_frame(frame.command_buffer, resized, || wait_for_extent(window))?;
        if recreated {
            self.sync_command_buffers()?;
        }
        Ok(())
    }

    /// Start rendering to the acquired image with cleared color and depth
    ///
    /// Uses the swapchain render pass when one exists, otherwise dynamic
    /// rendering with layout transitions. Viewport and scissor cover the
    /// whole image.
    pub fn begin_rendering(&self, frame: &FrameContext) -> VulkanResult<()> {
        if !self.is_current(frame, "begin rendering") {
            return Ok(());
        }
        let swapchain = self.frames.target()?;
        let extent = swapchain.extent();
        let device = self.device.handle();
        let render_area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
        let clear_values = clear_values(self.clear_color, self.clear_depth);

        if let Some(render_pass) = swapchain.render_pass() {
            let framebuffer = swapchain
                .framebuffer(frame.image_index as usize)
                .ok_or_else(|| VulkanError::invalid(format!("no framebuffer for image {}", frame.image_index)))?;
            let begin_info = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);
            unsafe { device.cmd_begin_render_pass(frame.command_buffer, &begin_info, vk::SubpassContents::INLINE) };
        } else {
            let image = swapchain
                .image(frame.image_index as usize)
                .ok_or_else(|| VulkanError::invalid(format!("no image {}", frame.image_index)))?;
            let image_view = swapchain
                .image_view(frame.image_index as usize)
                .ok_or_else(|| VulkanError::invalid(format!("no image view {}", frame.image_index)))?;
            let depth_layout = depth_attachment_layout(swapchain.depth_format());
            color_to_attachment_barrier(image).record(device, frame.command_buffer);
            depth_to_attachment_barrier(swapchain.depth_image(), swapchain.depth_aspect(), depth_layout)
                .record(device, frame.command_buffer);

            let color_attachments = [vk::RenderingAttachmentInfo::builder()
                .image_view(image_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear_values[0])
                .build()];
            let depth_attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(swapchain.depth_view())
                .image_layout(depth_layout)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(clear_values[1]);
            let rendering_info = vk::RenderingInfo::builder()
                .render_area(render_area)
                .layer_count(1)
                .color_attachments(&color_attachments)
                .depth_attachment(&depth_attachment);
            unsafe { device.cmd_begin_rendering(frame.command_buffer, &rendering_info) };
        }

        unsafe {
            device.cmd_set_viewport(frame.command_buffer, 0, &[full_viewport(extent)]);
            device.cmd_set_scissor(frame.command_buffer, 0, &[render_area]);
        }
        Ok(())
    }

    /// End rendering started by [`Renderer::begin_rendering`]
    pub fn end_rendering(&self, frame: &FrameContext) -> VulkanResult<()> {
        if !self.is_current(frame, "end rendering") {
            return Ok(());
        }
        let swapchain = self.frames.target()?;
        let device = self.device.handle();

        if swapchain.render_pass().is_some() {
            unsafe { device.cmd_end_render_pass(frame.command_buffer) };
            return Ok(());
        }

        let image = swapchain
            .image(frame.image_index as usize)
            .ok_or_else(|| VulkanError::invalid(format!("no image {}", frame.image_index)))?;
        unsafe { device.cmd_end_rendering(frame.command_buffer) };
        color_to_present_barrier(image).record(device, frame.command_buffer);
        Ok(())
    }

    fn is_current(&self, frame: &FrameContext, action: &str) -> bool {
        match self.current {
            Some(current) if current.command_buffer == frame.command_buffer => true,
            Some(_) => {
                log::warn!("Cannot {action} on a command buffer from a different frame");
                false
            }
            None => {
                log::warn!("Cannot {action} with no frame in progress");
                false
            }
        }
    }

    /// Current swapchain
    pub fn swapchain(&self) -> VulkanResult<&Swapchain> {
        self.frames.target()
    }

    /// Swapchain render pass; `None` under dynamic rendering
    pub fn render_pass(&self) -> Option<vk::RenderPass> {
        self.frames.target().ok().and_then(Swapchain::render_pass)
    }

    /// Swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.frames.target().map(|swapchain| swapchain.extent()).unwrap_or_default()
    }

    /// Swapchain width over height
    pub fn aspect_ratio(&self) -> f32 {
        self.frames.target().map_or(1.0, Swapchain::extent_aspect_ratio)
    }

    /// Frame slot of the next or in-progress frame
    pub const fn frame_index(&self) -> usize {
        self.frames.scheduler().current_frame()
    }

    /// Image being recorded, if a frame is in progress
    pub fn image_index(&self) -> Option<u32> {
        self.current.map(|frame| frame.image_index)
    }

    /// Whether `begin_frame` succeeded without a matching `end_frame`
    pub const fn is_frame_in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Number of swapchain recreations; pipelines tied to the render pass
    /// are rebuilt when this changes
    pub const fn swapchain_generation(&self) -> u64 {
        self.frames.generation()
    }

    /// Usage level frame command buffers are begun with
    pub const fn command_buffer_level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.device.wait_device()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_device() {
            log::error!("Device wait failed while destroying renderer: {err}");
        }
        self.command_pool.free_command_buffers(&self.command_buffers);
    }
}

/// Block on window events until the framebuffer has a usable size
pub fn wait_for_extent(window: &mut dyn RenderWindow) -> vk::Extent2D {
    loop {
        let extent = window.framebuffer_extent();
        if extent.width > 0 && extent.height > 0 && !window.is_minimized() {
            return extent;
        }
        window.wait_events();
    }
}

/// Color then depth clear values, in attachment order
pub const fn clear_values(color: [f32; 4], depth: f32) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue { color: vk::ClearColorValue { float32: color } },
        vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 } },
    ]
}

/// Viewport covering `extent` with the standard depth range
#[allow(clippy::cast_precision_loss)]
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Attachment layout for a depth format under dynamic rendering
pub fn depth_attachment_layout(format: vk::Format) -> vk::ImageLayout {
    if memory::has_stencil_component(format) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
    }
}

/// An image barrier with the stage scopes it is recorded under
#[derive(Clone, Copy)]
struct StagedBarrier {
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    barrier: vk::ImageMemoryBarrier,
}

impl StagedBarrier {
    fn record(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[self.barrier],
            );
        }
    }
}

fn depth_test_stages() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
}

// Source scope matches the acquire semaphore's wait stage so the transition
// happens after the presentation engine releases the image.
fn color_to_attachment_barrier(image: vk::Image) -> StagedBarrier {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
        .build();
    StagedBarrier {
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        barrier,
    }
}

// The depth image is shared by every frame slot: wait for the previous
// frame's depth writes before clearing it again.
fn depth_to_attachment_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
) -> StagedBarrier {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(aspect))
        .build();
    StagedBarrier { src_stage: depth_test_stages(), dst_stage: depth_test_stages(), barrier }
}

fn color_to_present_barrier(image: vk::Image) -> StagedBarrier {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
        .build();
    StagedBarrier {
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        barrier,
    }
}
