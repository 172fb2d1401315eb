//! Resettable command pool for per-image command buffers

use ash::vk;
use std::sync::Arc;

use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;

/// Command pool wrapper with RAII cleanup
///
/// Owned by a single recording thread; one-shot transfers go through
/// [`Device::with_single_time_commands`] instead.
pub struct CommandPool {
    device: Arc<Device>,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(device: &Arc<Device>, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool =
            unsafe { device.handle().create_command_pool(&pool_create_info, None) }.map_err(VulkanError::Api)?;

        Ok(Self { device: Arc::clone(device), command_pool })
    }

    /// Allocate `count` command buffers of `level`
    pub fn allocate_command_buffers(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(count);

        unsafe { self.device.handle().allocate_command_buffers(&alloc_info) }.map_err(VulkanError::Api)
    }

    /// Return command buffers to the pool
    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe {
                self.device
                    .handle()
                    .free_command_buffers(self.command_pool, command_buffers);
            }
        }
    }

    /// Get the command pool handle
    pub const fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees every buffer allocated from it.
            self.device.handle().destroy_command_pool(self.command_pool, None);
        }
    }
}
