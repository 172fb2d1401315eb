//! Vulkan swapchain management
//!
//! A [`Swapchain`] owns every per-surface resource: the presentable images and
//! their views, the depth buffer, the render pass and framebuffers (render pass
//! mode only) and the per-frame synchronization objects. It is never resized
//! in place; [`FrameTarget::rebuild`] tears the whole thing down and builds a
//! fresh one.

use ash::vk;
use std::sync::Arc;

use crate::config::{RendererConfig, RenderingMode};
use crate::error::{VulkanError, VulkanResult};
use crate::frame::{AcquireStatus, FrameTarget, PresentStatus};
use crate::vulkan::device::{Device, FENCE_TIMEOUT};
use crate::vulkan::image::{DepthBuffer, ImageView};
use crate::vulkan::render_pass::{Framebuffer, RenderPass};
use crate::vulkan::surface::Surface;
use crate::vulkan::sync::FrameSync;

/// Surface properties relevant to swapchain creation
#[derive(Debug, Clone)]
pub struct SwapchainSupport {
    /// Image count, extent and transform limits
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported color formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    /// Query `surface` support on `physical_device`
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> VulkanResult<Self> {
        Ok(Self {
            capabilities: surface.capabilities(physical_device)?,
            formats: surface.formats(physical_device)?,
            present_modes: surface.present_modes(physical_device)?,
        })
    }

    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Prefer B8G8R8A8_SRGB with the sRGB color space, otherwise the first format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// FIFO under vsync, otherwise the lowest-latency mode available
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|preferred| modes.contains(preferred))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's extent unless it defers to the window
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: window_extent
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub const fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && desired > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        desired
    }
}

/// Swapchain creation parameters that survive recreation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSettings {
    /// Frame slots, each with its own semaphores and fence
    pub frames_in_flight: usize,
    /// Restrict presentation to FIFO
    pub vsync: bool,
}

impl SwapchainSettings {
    /// Take the relevant fields from a renderer configuration
    pub const fn from_config(config: &RendererConfig) -> Self {
        Self { frames_in_flight: config.max_frames_in_flight, vsync: config.vsync }
    }
}

/// Swapchain with its attachments and per-frame synchronization
pub struct Swapchain {
    device: Arc<Device>,
    settings: SwapchainSettings,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<ImageView>,
    depth: DepthBuffer,
    render_pass: Option<RenderPass>,
    framebuffers: Vec<Framebuffer>,
    frame_sync: Vec<FrameSync>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Build a swapchain sized for `window_extent`
    pub fn new(device: &Arc<Device>, settings: SwapchainSettings, window_extent: vk::Extent2D) -> VulkanResult<Self> {
        let support = device.swapchain_support()?;
        let format = choose_surface_format(&support.formats).ok_or(VulkanError::UnsupportedFormat)?;
        let present_mode = choose_present_mode(&support.present_modes, settings.vsync);
        let extent = choose_extent(&support.capabilities, window_extent);
        let image_count = choose_image_count(&support.capabilities);

        let families = device.queue_families();
        let family_indices = [families.graphics, families.present];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface().handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());
        let create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let depth = DepthBuffer::new(device, device.find_depth_format()?, extent)?;

        let loader = device.swapchain_loader();
        let handle = unsafe { loader.create_swapchain(&create_info, None) }.map_err(VulkanError::Api)?;
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(VulkanError::Api(err));
            }
        };

        // Anything created past this point is released by `Drop`.
        let mut swapchain = Self {
            device: Arc::clone(device),
            settings,
            swapchain: handle,
            images,
            image_views: Vec::new(),
            depth,
            render_pass: None,
            framebuffers: Vec::new(),
            frame_sync: Vec::new(),
            format,
            present_mode,
            extent,
        };
        swapchain.create_attachments()?;
        swapchain.create_sync_objects()?;

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}, {} frames in flight",
            extent.width,
            extent.height,
            swapchain.images.len(),
            format.format,
            present_mode,
            settings.frames_in_flight
        );
        Ok(swapchain)
    }

    /// Build from renderer configuration
    pub fn from_config(device: &Arc<Device>, config: &RendererConfig, window_extent: vk::Extent2D) -> VulkanResult<Self> {
        Self::new(device, SwapchainSettings::from_config(config), window_extent)
    }

    fn create_attachments(&mut self) -> VulkanResult<()> {
        for &image in &self.images {
            self.image_views
                .push(ImageView::new(&self.device, image, self.format.format, vk::ImageAspectFlags::COLOR)?);
        }

        if self.device.rendering_mode() == RenderingMode::RenderPass {
            let render_pass = RenderPass::new_forward_pass(&self.device, self.format.format, self.depth.format())?;
            for view in &self.image_views {
                let attachments = [view.handle(), self.depth.view()];
                self.framebuffers
                    .push(Framebuffer::new(&self.device, &render_pass, &attachments, self.extent)?);
            }
            self.render_pass = Some(render_pass);
        }
        Ok(())
    }

    fn create_sync_objects(&mut self) -> VulkanResult<()> {
        for _ in 0..self.settings.frames_in_flight {
            self.frame_sync.push(FrameSync::new(&self.device)?);
        }
        Ok(())
    }

    /// Raw swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Render pass, `None` under dynamic rendering
    pub fn render_pass(&self) -> Option<vk::RenderPass> {
        self.render_pass.as_ref().map(RenderPass::handle)
    }

    /// The forward render pass itself, `None` under dynamic rendering
    pub const fn forward_pass(&self) -> Option<&RenderPass> {
        self.render_pass.as_ref()
    }

    /// Framebuffer for an image, `None` under dynamic rendering
    pub fn framebuffer(&self, image_index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index).map(Framebuffer::handle)
    }

    /// Presentable image
    pub fn image(&self, image_index: usize) -> Option<vk::Image> {
        self.images.get(image_index).copied()
    }

    /// Color view of a presentable image
    pub fn image_view(&self, image_index: usize) -> Option<vk::ImageView> {
        self.image_views.get(image_index).map(ImageView::handle)
    }

    /// Depth attachment view
    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.view()
    }

    /// Depth attachment image
    pub const fn depth_image(&self) -> vk::Image {
        self.depth.image()
    }

    /// Aspect flags of the depth attachment
    pub fn depth_aspect(&self) -> vk::ImageAspectFlags {
        self.depth.aspect()
    }

    /// Color format
    pub const fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Depth format
    pub const fn depth_format(&self) -> vk::Format {
        self.depth.format()
    }

    /// Chosen present mode
    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Width over height
    #[allow(clippy::cast_precision_loss)]
    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }

    /// Settings this swapchain was built with
    pub const fn settings(&self) -> SwapchainSettings {
        self.settings
    }

    fn sync(&self, frame: usize) -> VulkanResult<&FrameSync> {
        self.frame_sync
            .get(frame)
            .ok_or_else(|| VulkanError::invalid(format!("frame slot {frame} out of range")))
    }
}

impl FrameTarget for Swapchain {
    fn frames_in_flight(&self) -> usize {
        self.frame_sync.len()
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn wait_for_frame_fences(&self) -> VulkanResult<()> {
        let fences: Vec<vk::Fence> = self.frame_sync.iter().map(|sync| sync.in_flight.handle()).collect();
        unsafe { self.device.handle().wait_for_fences(&fences, true, FENCE_TIMEOUT) }
            .map_err(VulkanError::from_wait)
    }

    fn acquire_next_image(&self, frame: usize) -> VulkanResult<AcquireStatus> {
        let semaphore = self.sync(frame)?.image_available.handle();
        let result = unsafe {
            self.device
                .swapchain_loader()
                .acquire_next_image(self.swapchain, FENCE_TIMEOUT, semaphore, vk::Fence::null())
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireStatus::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(err) => Err(VulkanError::from_wait(err)),
        }
    }

    fn wait_for_fence(&self, frame: usize) -> VulkanResult<()> {
        self.sync(frame)?.in_flight.wait(FENCE_TIMEOUT)
    }

    fn reset_fence(&self, frame: usize) -> VulkanResult<()> {
        self.sync(frame)?.in_flight.reset()
    }

    fn submit(&self, frame: usize, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let sync = self.sync(frame)?;
        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished.handle()];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        self.device.submit(&[submit_info], sync.in_flight.handle())
    }

    fn skip_frame(&self, frame: usize) -> VulkanResult<()> {
        let sync = self.sync(frame)?;
        sync.in_flight.reset()?;

        // No command buffers: consumes the acquire semaphore and signals the fence.
        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::BOTTOM_OF_PIPE];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .build();

        self.device.submit(&[submit_info], sync.in_flight.handle())
    }

    fn present(&self, frame: usize, image_index: u32) -> VulkanResult<PresentStatus> {
        let wait_semaphores = [self.sync(frame)?.render_finished.handle()];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.device.present(&present_info) {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(err) => Err(VulkanError::from_wait(err)),
        }
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        self.device.wait_device()
    }

    fn rebuild(self, extent: vk::Extent2D) -> VulkanResult<Self> {
        let device = Arc::clone(&self.device);
        let settings = self.settings;
        drop(self);
        Self::new(&device, settings, extent)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_device() {
            log::error!("Device wait failed while destroying swapchain: {err}");
        }
        // Views and framebuffers reference the swapchain images.
        self.frame_sync.clear();
        self.framebuffers.clear();
        self.render_pass = None;
        self.image_views.clear();
        unsafe {
            self.device.swapchain_loader().destroy_swapchain(self.swapchain, None);
        }
        log::debug!("Swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn test_prefers_srgb_surface_format() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[1]));
    }

    #[test]
    fn test_falls_back_to_first_surface_format() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_preference() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);

        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&no_mailbox, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_extent_uses_current_when_fixed() {
        let current = vk::Extent2D { width: 1280, height: 720 };
        let caps = capabilities(2, 3, current);
        assert_eq!(choose_extent(&caps, vk::Extent2D { width: 10, height: 10 }), current);
    }

    #[test]
    fn test_extent_clamped_when_surface_defers() {
        let caps = capabilities(2, 3, vk::Extent2D { width: u32::MAX, height: u32::MAX });
        let chosen = choose_extent(&caps, vk::Extent2D { width: 8000, height: 10 });
        assert_eq!(chosen, vk::Extent2D { width: 4096, height: 64 });

        let inside = choose_extent(&caps, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(inside, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_image_count() {
        let extent = vk::Extent2D { width: 1, height: 1 };
        assert_eq!(choose_image_count(&capabilities(2, 0, extent)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 8, extent)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3, extent)), 3);
    }

    #[test]
    fn test_support_adequacy() {
        let mut support = SwapchainSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: Vec::new(),
        };
        assert!(!support.is_adequate());
        support.present_modes.push(vk::PresentModeKHR::FIFO);
        assert!(support.is_adequate());
    }

    #[test]
    fn test_settings_from_config() {
        let config = RendererConfig::default().with_max_frames_in_flight(3).with_vsync(false);
        let settings = SwapchainSettings::from_config(&config);
        assert_eq!(settings, SwapchainSettings { frames_in_flight: 3, vsync: false });
    }
}
