//! Window surface seam
//!
//! The core never owns the platform window. It only needs a surface at
//! startup and the framebuffer extent plus an event pump while recreating
//! the swapchain, which is what [`RenderWindow`] provides.

use ash::vk;

use crate::error::{VulkanError, VulkanResult};

/// Window capabilities the GPU core depends on
pub trait RenderWindow {
    /// Instance extensions the platform needs for presentation
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>>;

    /// Create a presentation surface for `instance`
    fn create_surface(&mut self, instance: &ash::Instance) -> VulkanResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels
    fn framebuffer_extent(&self) -> vk::Extent2D;

    /// Whether the window is iconified or has a zero-sized framebuffer
    fn is_minimized(&self) -> bool {
        let extent = self.framebuffer_extent();
        extent.width == 0 || extent.height == 0
    }

    /// Block until the platform delivers at least one event
    fn wait_events(&mut self);

    /// Return and clear the "framebuffer was resized" flag
    fn take_resized(&mut self) -> bool;
}

/// GLFW window wrapper with proper resource management
pub struct GlfwWindow {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    resized: bool,
}

impl GlfwWindow {
    /// Open a resizable window without a client API
    pub fn new(title: &str, width: u32, height: u32) -> VulkanResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|e| VulkanError::Window(format!("GLFW initialization failed: {e:?}")))?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or_else(|| VulkanError::Window("window creation failed".to_string()))?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        Ok(Self { glfw, window, events, resized: false })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request the window to close
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Poll the platform and drain pending events, tracking resizes
    pub fn poll_events(&mut self) -> Vec<glfw::WindowEvent> {
        self.glfw.poll_events();
        self.drain_events()
    }

    fn drain_events(&mut self) -> Vec<glfw::WindowEvent> {
        let mut drained = Vec::new();
        for (_, event) in glfw::flush_messages(&self.events) {
            if matches!(event, glfw::WindowEvent::FramebufferSize(..)) {
                self.resized = true;
            }
            drained.push(event);
        }
        drained
    }
}

impl RenderWindow for GlfwWindow {
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| VulkanError::Window("Vulkan is not supported by GLFW".to_string()))
    }

    fn create_surface(&mut self, instance: &ash::Instance) -> VulkanResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance.handle(), std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(VulkanError::InitializationFailed(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        let (width, height) = self.window.get_framebuffer_size();
        vk::Extent2D {
            width: u32::try_from(width).unwrap_or(0),
            height: u32::try_from(height).unwrap_or(0),
        }
    }

    fn is_minimized(&self) -> bool {
        let extent = self.framebuffer_extent();
        self.window.is_iconified() || extent.width == 0 || extent.height == 0
    }

    fn wait_events(&mut self) {
        self.glfw.wait_events();
        self.drain_events();
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}
