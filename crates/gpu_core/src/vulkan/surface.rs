//! Presentation surface wrapper

use ash::{extensions::khr, vk};

use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::instance::VulkanInstance;
use crate::window::RenderWindow;

/// Vulkan surface with RAII cleanup
pub struct Surface {
    loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Ask the window for a surface on `instance`
    pub fn new(instance: &VulkanInstance, window: &mut dyn RenderWindow) -> VulkanResult<Self> {
        let loader = khr::Surface::new(instance.entry(), instance.instance());
        let surface = window.create_surface(instance.instance())?;
        Ok(Self { loader, surface })
    }

    /// Raw surface handle
    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader
    pub const fn loader(&self) -> &khr::Surface {
        &self.loader
    }

    /// Surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe { self.loader.get_physical_device_surface_capabilities(physical_device, self.surface) }
            .map_err(VulkanError::Api)
    }

    /// Surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.loader.get_physical_device_surface_formats(physical_device, self.surface) }
            .map_err(VulkanError::Api)
    }

    /// Present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe { self.loader.get_physical_device_surface_present_modes(physical_device, self.surface) }
            .map_err(VulkanError::Api)
    }

    /// Whether a queue family can present to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family_index: u32) -> VulkanResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family_index, self.surface)
        }
        .map_err(VulkanError::Api)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
