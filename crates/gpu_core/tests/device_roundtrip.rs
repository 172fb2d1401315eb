//! Tests that need a Vulkan driver and a display
//!
//! Run with `cargo test -p gpu_core -- --ignored` on a machine with a GPU.

use ash::vk;
use gpu_core::config::RendererConfig;
use gpu_core::vulkan::descriptors::{DescriptorPool, DescriptorSetLayout, DescriptorWriter};
use gpu_core::vulkan::{BufferSpec, Device, GpuBuffer, WHOLE_SIZE};
use gpu_core::window::GlfwWindow;
use gpu_core::VulkanError;
use std::sync::Arc;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraBlock {
    view_projection: [[f32; 4]; 4],
    position: [f32; 4],
}

fn device() -> (GlfwWindow, Arc<Device>) {
    let config = RendererConfig::new("gpu_core tests").with_validation(true);
    let mut window = GlfwWindow::new("gpu_core tests", 320, 240).unwrap();
    let device = Arc::new(Device::new(&mut window, &config).unwrap());
    (window, device)
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn mapped_write_reads_back_identical_bytes() {
    let (_window, device) = device();
    let spec = BufferSpec::uniform::<CameraBlock>(&device);
    let mut buffer = GpuBuffer::new(&device, &spec, 3).unwrap();

    let block = CameraBlock { view_projection: [[1.0, 2.0, 3.0, 4.0]; 4], position: [0.5, 0.25, 0.125, 1.0] };
    buffer.map(WHOLE_SIZE, 0).unwrap();
    buffer.write_to_index(bytemuck::bytes_of(&block), 2).unwrap();
    buffer.flush_index(2).unwrap();
    buffer.invalidate_index(2).unwrap();

    let offset = buffer.descriptor_info_for_index(2).unwrap().offset;
    let read = buffer.read_bytes(offset, std::mem::size_of::<CameraBlock>()).unwrap();
    assert_eq!(read, bytemuck::bytes_of(&block));
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn unmap_is_idempotent_and_writes_need_a_mapping() {
    let (_window, device) = device();
    let spec = BufferSpec::packed::<[f32; 4]>(vk::BufferUsageFlags::VERTEX_BUFFER);
    let mut buffer = GpuBuffer::new(&device, &spec, 4).unwrap();

    buffer.unmap();
    assert!(!buffer.is_mapped());
    assert!(matches!(
        buffer.write_pod(&[1.0_f32; 4], 0),
        Err(VulkanError::InvalidOperation { .. })
    ));

    buffer.map(WHOLE_SIZE, 0).unwrap();
    buffer.unmap();
    buffer.unmap();
    assert!(!buffer.is_mapped());
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn descriptor_pool_reports_exhaustion() {
    let (_window, device) = device();
    let layout = DescriptorSetLayout::builder()
        .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
        .build(&device)
        .unwrap();
    let pool = DescriptorPool::builder(&device)
        .set_max_sets(2)
        .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 2)
        .build()
        .unwrap();

    let spec = BufferSpec::uniform::<CameraBlock>(&device);
    let buffer = GpuBuffer::new(&device, &spec, 1).unwrap();
    let writer = DescriptorWriter::new(&layout, &pool).write_buffer(0, buffer.descriptor_info_for_index(0).unwrap());

    assert!(writer.build().unwrap().is_some());
    assert!(writer.build().unwrap().is_some());
    assert!(writer.build().unwrap().is_none());
    assert_eq!(pool.sets_in_use(), 2);
}

#[test]
#[ignore = "requires a Vulkan device and a display"]
fn flush_of_last_element_respects_atom_size() {
    let (_window, device) = device();
    // Three-float elements: the last one ends off any atom boundary.
    let spec = BufferSpec {
        memory_properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        ..BufferSpec::packed::<[f32; 3]>(vk::BufferUsageFlags::VERTEX_BUFFER)
    };
    let Ok(mut buffer) = GpuBuffer::new(&device, &spec, 5) else {
        return;
    };

    assert!(matches!(buffer.flush_index(4), Err(VulkanError::InvalidOperation { .. })));
    buffer.map(WHOLE_SIZE, 0).unwrap();
    buffer.write_pod(&[1.0_f32, 2.0, 3.0], 48).unwrap();
    buffer.flush_index(4).unwrap();
    buffer.invalidate_index(0).unwrap();
}
