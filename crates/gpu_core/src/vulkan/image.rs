//! Image views and the depth attachment

use ash::vk;
use std::sync::Arc;

use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;
use crate::vulkan::memory;

/// Single-mip, single-layer 2D view with RAII cleanup
pub struct ImageView {
    device: Arc<Device>,
    view: vk::ImageView,
}

impl ImageView {
    /// Create a 2D view of `image`
    pub fn new(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> VulkanResult<Self> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect_mask));

        let view = unsafe { device.handle().create_image_view(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device: Arc::clone(device), view })
    }

    /// View handle
    pub const fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_image_view(self.view, None);
        }
    }
}

/// Full range of a single-mip, single-layer image
pub const fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Depth image, its memory and view
pub struct DepthBuffer {
    device: Arc<Device>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    // Released before the image in `Drop`.
    view: Option<ImageView>,
    format: vk::Format,
}

impl DepthBuffer {
    /// Create a device-local depth attachment of `extent`
    pub fn new(device: &Arc<Device>, format: vk::Format, extent: vk::Extent2D) -> VulkanResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let (image, memory) = device.create_image_with_info(&image_info, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let mut depth = Self { device: Arc::clone(device), image, memory, view: None, format };
        depth.view = Some(ImageView::new(device, image, format, memory::depth_aspect(format))?);

        log::debug!("Created {format:?} depth buffer {}x{}", extent.width, extent.height);
        Ok(depth)
    }

    /// Depth image
    pub const fn image(&self) -> vk::Image {
        self.image
    }

    /// Depth view
    pub fn view(&self) -> vk::ImageView {
        self.view.as_ref().map_or_else(vk::ImageView::null, ImageView::handle)
    }

    /// Depth format
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Aspect flags matching the format
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        memory::depth_aspect(self.format)
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        self.view = None;
        unsafe {
            self.device.handle().destroy_image(self.image, None);
            self.device.handle().free_memory(self.memory, None);
        }
    }
}
