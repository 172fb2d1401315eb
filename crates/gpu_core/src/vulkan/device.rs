//! Physical/logical device selection, queues and one-shot command submission
//!
//! [`Device`] is the leaf every other GPU object hangs off. It owns the instance,
//! the surface, the logical device, the graphics/present queues and a transient
//! command pool. Pool access and queue submission share one mutex because
//! Vulkan forbids concurrent use of either from several threads.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::{vk, Instance};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::CStr;

use crate::config::{RendererConfig, RenderingMode};
use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::instance::VulkanInstance;
use crate::vulkan::memory;
use crate::vulkan::surface::Surface;
use crate::vulkan::swapchain::SwapchainSupport;
use crate::window::RenderWindow;

/// Timeout used for every fence wait; effectively "until signaled"
pub const FENCE_TIMEOUT: u64 = u64::MAX;

/// Depth formats tried in order when building depth attachments
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Graphics and present queue family indices (may be equal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family used for rendering and transfers
    pub graphics: u32,
    /// Family used for presentation
    pub present: u32,
}

impl QueueFamilies {
    /// Whether both roles live on one family
    pub const fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, for queue creation and concurrent sharing
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Selected queue families
    pub queue_families: QueueFamilies,
}

impl PhysicalDeviceInfo {
    /// Pick the best device that can render and present to `surface`
    pub fn select_suitable_device(
        instance: &Instance,
        surface: &Surface,
        require_dynamic_rendering: bool,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(VulkanError::Api)?;

        let mut best: Option<(u32, Self)> = None;
        for device in devices {
            match Self::evaluate_device(instance, device, surface, require_dynamic_rendering) {
                Ok(info) => {
                    let score = device_type_score(info.properties.device_type);
                    if best.as_ref().map_or(true, |(current, _)| score > *current) {
                        best = Some((score, info));
                    }
                }
                Err(err) => log::debug!("Skipping physical device: {err}"),
            }
        }

        let (_, info) = best.ok_or(VulkanError::NoSuitableDevice)?;
        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) }.to_string_lossy(),
            info.properties.device_type
        );
        Ok(info)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: &Surface,
        require_dynamic_rendering: bool,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        if require_dynamic_rendering && properties.api_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::InitializationFailed("dynamic rendering needs Vulkan 1.3".to_string()));
        }

        let mut graphics = None;
        let mut present = None;
        for (index, family) in (0u32..).zip(families.iter()) {
            if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics = Some(index);
            }
            if present.is_none() && surface.supports_present(device, index)? {
                present = Some(index);
            }
            if graphics.is_some() && present.is_some() {
                break;
            }
        }
        let graphics = graphics
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics queue family found".to_string()))?;
        let present = present
            .ok_or_else(|| VulkanError::InitializationFailed("No present queue family found".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }.map_err(VulkanError::Api)?;
        let has_swapchain = extensions.iter().any(|available| {
            (unsafe { CStr::from_ptr(available.extension_name.as_ptr()) }) == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(VulkanError::InitializationFailed("VK_KHR_swapchain not supported".to_string()));
        }

        let support = SwapchainSupport::query(surface, device)?;
        if !support.is_adequate() {
            return Err(VulkanError::InitializationFailed("surface has no formats or present modes".to_string()));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_families: QueueFamilies { graphics, present },
        })
    }
}

/// Ranking used to prefer discrete GPUs
pub const fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    }
}

/// The graphics device and everything with application lifetime
///
/// Share it as `Arc<Device>`; every wrapper that creates handles keeps a clone
/// so the device outlives them.
pub struct Device {
    logical: ash::Device,
    swapchain_loader: SwapchainLoader,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: Mutex<vk::CommandPool>,
    physical: PhysicalDeviceInfo,
    rendering_mode: RenderingMode,
    // Field order is teardown order after `Drop::drop` destroys pool and device.
    surface: Surface,
    instance: VulkanInstance,
}

impl Device {
    /// Create instance, surface, logical device, queues and the transient pool
    pub fn new(window: &mut dyn RenderWindow, config: &RendererConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, config)?;
        let surface = Surface::new(&instance, window)?;

        let dynamic = config.rendering_mode == RenderingMode::Dynamic;
        let physical = PhysicalDeviceInfo::select_suitable_device(instance.instance(), &surface, dynamic)?;
        let logical = Self::create_logical_device(instance.instance(), &physical, dynamic)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(physical.queue_families.graphics);
        let command_pool = match unsafe { logical.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { logical.destroy_device(None) };
                return Err(VulkanError::Api(err));
            }
        };

        let graphics_queue = unsafe { logical.get_device_queue(physical.queue_families.graphics, 0) };
        let present_queue = unsafe { logical.get_device_queue(physical.queue_families.present, 0) };
        let swapchain_loader = SwapchainLoader::new(instance.instance(), &logical);

        log::info!(
            "Logical device ready (graphics family {}, present family {})",
            physical.queue_families.graphics,
            physical.queue_families.present
        );

        Ok(Self {
            logical,
            swapchain_loader,
            graphics_queue,
            present_queue,
            command_pool: Mutex::new(command_pool),
            physical,
            rendering_mode: config.rendering_mode,
            surface,
            instance,
        })
    }

    fn create_logical_device(
        instance: &Instance,
        physical: &PhysicalDeviceInfo,
        dynamic_rendering: bool,
    ) -> VulkanResult<ash::Device> {
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = physical
            .queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [SwapchainLoader::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(physical.features.fill_mode_non_solid == vk::TRUE)
            .build();

        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);
        if dynamic_rendering {
            create_info = create_info.push_next(&mut vulkan13);
        }

        unsafe { instance.create_device(physical.device, &create_info, None) }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create logical device: {e:?}")))
    }

    /// Raw logical device function table
    pub const fn handle(&self) -> &ash::Device {
        &self.logical
    }

    /// Instance function table
    pub const fn instance(&self) -> &Instance {
        self.instance.instance()
    }

    /// Selected physical device
    pub const fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Device properties and limits
    pub const fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.physical.properties
    }

    /// Queue family indices
    pub const fn queue_families(&self) -> QueueFamilies {
        self.physical.queue_families
    }

    /// Graphics queue
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Present queue
    pub const fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Swapchain extension loader
    pub const fn swapchain_loader(&self) -> &SwapchainLoader {
        &self.swapchain_loader
    }

    /// Presentation surface
    pub const fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Attachment binding style the device was created for
    pub const fn rendering_mode(&self) -> RenderingMode {
        self.rendering_mode
    }

    /// Whether wireframe polygon modes are available
    pub fn supports_wireframe(&self) -> bool {
        self.physical.features.fill_mode_non_solid == vk::TRUE
    }

    /// Minimum offset alignment for uniform buffer descriptors
    pub const fn min_uniform_offset_alignment(&self) -> vk::DeviceSize {
        self.physical.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Minimum offset alignment for storage buffer descriptors
    pub const fn min_storage_offset_alignment(&self) -> vk::DeviceSize {
        self.physical.properties.limits.min_storage_buffer_offset_alignment
    }

    /// Current surface capabilities, formats and present modes
    pub fn swapchain_support(&self) -> VulkanResult<SwapchainSupport> {
        SwapchainSupport::query(&self.surface, self.physical.device)
    }

    /// Index of a memory type allowed by `type_bits` with all of `properties`
    pub fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        memory::find_memory_type_index(&self.physical.memory_properties, type_bits, properties)
    }

    /// First candidate supporting `features` for `tiling`
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> VulkanResult<vk::Format> {
        memory::pick_supported_format(candidates, tiling, features, |format| unsafe {
            self.instance()
                .get_physical_device_format_properties(self.physical.device, format)
        })
    }

    /// Depth attachment format
    pub fn find_depth_format(&self) -> VulkanResult<vk::Format> {
        self.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    /// Create a buffer and bind freshly allocated memory to it
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(vk::Buffer, vk::DeviceMemory)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.logical.create_buffer(&buffer_info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { self.logical.get_buffer_memory_requirements(buffer) };
        let memory = self
            .allocate(requirements, properties)
            .and_then(|memory| {
                unsafe { self.logical.bind_buffer_memory(buffer, memory, 0) }
                    .map(|()| memory)
                    .map_err(|err| {
                        unsafe { self.logical.free_memory(memory, None) };
                        VulkanError::Api(err)
                    })
            })
            .map_err(|err| {
                unsafe { self.logical.destroy_buffer(buffer, None) };
                err
            })?;

        log::debug!("Created buffer of {size} bytes ({usage:?})");
        Ok((buffer, memory))
    }

    /// Create an image from `info` and bind freshly allocated memory to it
    pub fn create_image_with_info(
        &self,
        info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<(vk::Image, vk::DeviceMemory)> {
        let image = unsafe { self.logical.create_image(info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { self.logical.get_image_memory_requirements(image) };
        let memory = self
            .allocate(requirements, properties)
            .and_then(|memory| {
                unsafe { self.logical.bind_image_memory(image, memory, 0) }
                    .map(|()| memory)
                    .map_err(|err| {
                        unsafe { self.logical.free_memory(memory, None) };
                        VulkanError::Api(err)
                    })
            })
            .map_err(|err| {
                unsafe { self.logical.destroy_image(image, None) };
                err
            })?;

        Ok((image, memory))
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<vk::DeviceMemory> {
        let memory_type = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        unsafe { self.logical.allocate_memory(&alloc_info, None) }.map_err(VulkanError::Api)
    }

    /// Record one-shot work in `record` and block until the GPU has executed it
    ///
    /// The submission lock is held from allocation until the buffer is freed,
    /// so `record` must only record commands and not submit on this device.
    pub fn with_single_time_commands<R>(&self, record: impl FnOnce(vk::CommandBuffer) -> R) -> VulkanResult<R> {
        locked_one_shot(
            &self.command_pool,
            |pool| self.begin_one_shot(pool),
            record,
            |pool, command_buffer| self.finish_one_shot(pool, command_buffer),
        )
    }

    fn begin_one_shot(&self, pool: vk::CommandPool) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(pool)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.logical.allocate_command_buffers(&alloc_info) }
            .map_err(VulkanError::Api)?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::invalid("driver returned no command buffer"))?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(err) = unsafe { self.logical.begin_command_buffer(command_buffer, &begin_info) } {
            unsafe { self.logical.free_command_buffers(pool, &[command_buffer]) };
            return Err(VulkanError::Api(err));
        }
        Ok(command_buffer)
    }

    fn finish_one_shot(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let result = unsafe {
            self.logical.end_command_buffer(command_buffer).and_then(|()| {
                let buffers = [command_buffer];
                let submit = vk::SubmitInfo::builder().command_buffers(&buffers).build();
                self.logical
                    .queue_submit(self.graphics_queue, &[submit], vk::Fence::null())
                    .and_then(|()| self.logical.queue_wait_idle(self.graphics_queue))
            })
        };
        unsafe { self.logical.free_command_buffers(pool, &[command_buffer]) };
        result.map_err(VulkanError::from_wait)
    }

    /// Copy `size` bytes between buffers and wait for completion
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> VulkanResult<()> {
        self.with_single_time_commands(|command_buffer| {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            unsafe { self.logical.cmd_copy_buffer(command_buffer, src, dst, &[region]) };
        })
    }

    /// Submit to the graphics queue under the submission lock
    pub fn submit(&self, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VulkanResult<()> {
        let _guard = self.command_pool.lock();
        unsafe { self.logical.queue_submit(self.graphics_queue, submits, fence) }.map_err(VulkanError::from_wait)
    }

    /// Present under the submission lock; `Ok(true)` means suboptimal
    pub fn present(&self, present_info: &vk::PresentInfoKHR) -> VkResult<bool> {
        let _guard = self.command_pool.lock();
        unsafe { self.swapchain_loader.queue_present(self.present_queue, present_info) }
    }

    /// Block until the whole device is idle
    pub fn wait_device(&self) -> VulkanResult<()> {
        let _guard = self.command_pool.lock();
        unsafe { self.logical.device_wait_idle() }.map_err(VulkanError::from_wait)
    }

    /// Block until the graphics queue is idle
    pub fn wait_queue(&self) -> VulkanResult<()> {
        let _guard = self.command_pool.lock();
        unsafe { self.logical.queue_wait_idle(self.graphics_queue) }.map_err(VulkanError::from_wait)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.logical.device_wait_idle();
            self.logical.destroy_command_pool(*self.command_pool.get_mut(), None);
            self.logical.destroy_device(None);
        }
        log::debug!("Device destroyed");
    }
}

/// Begin, record and finish a one-shot command buffer with `lock` held throughout
fn locked_one_shot<P: Copy, C: Copy, R>(
    lock: &Mutex<P>,
    begin: impl FnOnce(P) -> VulkanResult<C>,
    record: impl FnOnce(C) -> R,
    finish: impl FnOnce(P, C) -> VulkanResult<()>,
) -> VulkanResult<R> {
    let pool = lock.lock();
    let command_buffer = begin(*pool)?;
    let output = record(command_buffer);
    finish(*pool, command_buffer)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_families() {
        let shared = QueueFamilies { graphics: 0, present: 0 };
        assert!(shared.is_shared());
        assert_eq!(shared.unique(), vec![0]);

        let split = QueueFamilies { graphics: 2, present: 1 };
        assert!(!split.is_shared());
        assert_eq!(split.unique(), vec![1, 2]);
    }

    #[test]
    fn test_discrete_gpu_preferred() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn test_depth_candidates_order() {
        assert_eq!(DEPTH_FORMAT_CANDIDATES[0], vk::Format::D32_SFLOAT);
        assert_eq!(DEPTH_FORMAT_CANDIDATES.len(), 3);
    }

    #[test]
    fn test_one_shot_holds_lock_for_whole_span() {
        let pool = Mutex::new(7_u32);
        let mut phases = Vec::new();
        let output = locked_one_shot(
            &pool,
            |handle| {
                assert!(pool.is_locked());
                assert_eq!(handle, 7);
                Ok(42_u64)
            },
            |command_buffer| {
                // Another thread could not take the pool while recording.
                assert!(pool.try_lock().is_none());
                phases.push(command_buffer);
                "recorded"
            },
            |handle, command_buffer| {
                assert!(pool.is_locked());
                assert_eq!((handle, command_buffer), (7, 42));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(output, "recorded");
        assert_eq!(phases, vec![42]);
        assert!(!pool.is_locked());
    }

    #[test]
    fn test_one_shot_begin_failure_skips_recording() {
        let pool = Mutex::new(0_u32);
        let mut recorded = false;
        let result = locked_one_shot(
            &pool,
            |_| Err::<u64, _>(VulkanError::Api(vk::Result::ERROR_OUT_OF_HOST_MEMORY)),
            |_| recorded = true,
            |_, _| Ok(()),
        );
        assert!(matches!(result, Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_HOST_MEMORY))));
        assert!(!recorded);
        assert!(!pool.is_locked());
    }

    #[test]
    fn test_one_shot_finish_failure_propagates() {
        let pool = Mutex::new(0_u32);
        let result = locked_one_shot(&pool, |_| Ok(1_u64), |_| (), |_, _| Err(VulkanError::DeviceLost));
        assert!(matches!(result, Err(VulkanError::DeviceLost)));
        assert!(!pool.is_locked());
    }
}
