//! Semaphores, fences and the per-frame synchronization triad

use ash::vk;
use std::sync::Arc;

use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: &Arc<Device>) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device: Arc::clone(device), semaphore })
    }

    /// Get the semaphore handle
    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signaled
    pub fn new(device: &Arc<Device>, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { device.handle().create_fence(&create_info, None) }.map_err(VulkanError::Api)?;
        Ok(Self { device: Arc::clone(device), fence })
    }

    /// Block until signaled or `timeout` nanoseconds pass
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        unsafe { self.device.handle().wait_for_fences(&[self.fence], true, timeout) }.map_err(VulkanError::from_wait)
    }

    /// Return to the unsignaled state
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.handle().reset_fences(&[self.fence]) }.map_err(VulkanError::Api)
    }

    /// Get the fence handle
    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}

/// Synchronization objects owned by one frame slot
pub struct FrameSync {
    /// Signaled when the acquired image is ready to be rendered to
    pub image_available: Semaphore,
    /// Signaled when the frame's command buffer finished executing
    pub render_finished: Semaphore,
    /// Signaled when the frame slot may be reused by the CPU
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create the triad with the fence signaled so the first wait returns at once
    pub fn new(device: &Arc<Device>) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
        })
    }
}
