//! Host/device buffers with alignment-padded instance arrays
//!
//! A [`GpuBuffer`] holds `instance_count` elements of `instance_size` bytes,
//! each padded to `alignment_size` so element `i` can be bound through a
//! dynamic descriptor offset of `i * alignment_size`.

use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{VulkanError, VulkanResult};
use crate::vulkan::device::Device;

/// Sentinel meaning "from offset to the end of the buffer"
pub const WHOLE_SIZE: vk::DeviceSize = vk::WHOLE_SIZE;

/// Size bookkeeping of a buffer, independent of any GPU handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes of one element as written by the host
    pub instance_size: vk::DeviceSize,
    /// Number of elements
    pub instance_count: vk::DeviceSize,
    /// Padded stride between elements
    pub alignment_size: vk::DeviceSize,
    /// `alignment_size * instance_count`
    pub buffer_size: vk::DeviceSize,
}

impl BufferLayout {
    /// Compute the padded layout for `instance_count` elements
    ///
    /// Fails with [`VulkanError::InvalidArgument`] when the padded stride or
    /// the total size does not fit in a device size.
    pub fn new(
        instance_size: vk::DeviceSize,
        instance_count: vk::DeviceSize,
        min_offset_alignment: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let too_large = || {
            VulkanError::InvalidArgument(format!(
                "{instance_count} instances of {instance_size} bytes aligned to {min_offset_alignment} overflow the buffer size"
            ))
        };
        let alignment_size = if min_offset_alignment > 1 {
            instance_size
                .div_ceil(min_offset_alignment)
                .checked_mul(min_offset_alignment)
                .ok_or_else(too_large)?
        } else {
            instance_size
        };
        let buffer_size = alignment_size.checked_mul(instance_count).ok_or_else(too_large)?;

        Ok(Self { instance_size, instance_count, alignment_size, buffer_size })
    }

    /// Byte offset of element `index`
    pub fn offset_of(&self, index: vk::DeviceSize) -> VulkanResult<vk::DeviceSize> {
        if index >= self.instance_count {
            return Err(VulkanError::OutOfBounds {
                offset: index.saturating_mul(self.alignment_size),
                size: self.alignment_size,
                capacity: self.buffer_size,
            });
        }
        Ok(index * self.alignment_size)
    }

    /// Offset of element `index` after checking that `len` bytes fit in one element
    pub fn element_write_offset(&self, len: vk::DeviceSize, index: vk::DeviceSize) -> VulkanResult<vk::DeviceSize> {
        if len > self.instance_size {
            return Err(VulkanError::OutOfBounds {
                offset: index.saturating_mul(self.alignment_size),
                size: len,
                capacity: self.instance_size,
            });
        }
        self.offset_of(index)
    }

    /// Resolve a `(size, offset)` pair, expanding [`WHOLE_SIZE`], and bounds-check it
    pub fn resolve(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<(vk::DeviceSize, vk::DeviceSize)> {
        let size = if size == WHOLE_SIZE { self.buffer_size.saturating_sub(offset) } else { size };
        match offset.checked_add(size) {
            Some(end) if end <= self.buffer_size => Ok((size, offset)),
            _ => Err(VulkanError::OutOfBounds { offset, size, capacity: self.buffer_size }),
        }
    }
}

/// Widen a flush or invalidate range to `atom` boundaries inside the mapped
/// window `[map_start, map_end)`
///
/// Returns `(size, offset)`. When the rounded end reaches the end of the
/// window the size becomes [`WHOLE_SIZE`], since the window end itself need
/// not be a multiple of the atom.
fn atom_aligned_range(
    size: vk::DeviceSize,
    offset: vk::DeviceSize,
    atom: vk::DeviceSize,
    map_start: vk::DeviceSize,
    map_end: vk::DeviceSize,
) -> VulkanResult<(vk::DeviceSize, vk::DeviceSize)> {
    let end = offset
        .checked_add(size)
        .filter(|&end| offset >= map_start && end <= map_end)
        .ok_or(VulkanError::OutOfBounds { offset, size, capacity: map_end })?;

    let atom = atom.max(1);
    let start = (offset / atom * atom).max(map_start);
    match end.div_ceil(atom).checked_mul(atom) {
        Some(aligned_end) if aligned_end < map_end => Ok((aligned_end - start, start)),
        _ => Ok((WHOLE_SIZE, start)),
    }
}

fn require_mapping<'a>(mapped: Option<&'a MappedRegion>, action: &str) -> VulkanResult<&'a MappedRegion> {
    mapped.ok_or_else(|| VulkanError::invalid(format!("buffer must be mapped before {action}")))
}

/// A host-visible window onto mapped device memory
///
/// Offsets passed to its methods are absolute buffer offsets; the region
/// rejects any access outside `[offset, offset + len)`.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    offset: vk::DeviceSize,
    len: usize,
}

impl MappedRegion {
    /// Wrap a pointer returned by `vkMapMemory`
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the region is alive, and nothing else may alias it mutably.
    pub unsafe fn from_raw(ptr: *mut std::ffi::c_void, offset: vk::DeviceSize, len: usize) -> Option<Self> {
        NonNull::new(ptr.cast::<u8>()).map(|ptr| Self { ptr, offset, len })
    }

    /// First buffer offset covered by the mapping
    pub const fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Number of mapped bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping covers no bytes
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn local_range(&self, offset: vk::DeviceSize, size: usize) -> VulkanResult<std::ops::Range<usize>> {
        let out_of_bounds = || VulkanError::OutOfBounds {
            offset,
            size: size as vk::DeviceSize,
            capacity: self.offset + self.len as vk::DeviceSize,
        };
        let start = offset
            .checked_sub(self.offset)
            .and_then(|local| usize::try_from(local).ok())
            .ok_or_else(out_of_bounds)?;
        match start.checked_add(size) {
            Some(end) if end <= self.len => Ok(start..end),
            _ => Err(out_of_bounds()),
        }
    }

    /// Copy `data` into the mapping at buffer offset `offset`
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        let range = self.local_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(range.start), data.len());
        }
        Ok(())
    }

    /// Borrow `len` mapped bytes starting at buffer offset `offset`
    pub fn read(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<&[u8]> {
        let range = self.local_range(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(range.start), range.len()) })
    }
}

/// Shape of an allocation: element size, usage, memory properties and alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Bytes of one element
    pub instance_size: vk::DeviceSize,
    /// Buffer usage
    pub usage: vk::BufferUsageFlags,
    /// Required memory properties
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Element stride alignment; 0 or 1 means tightly packed
    pub min_offset_alignment: vk::DeviceSize,
}

impl BufferSpec {
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    /// Host-visible uniform array of `T`, padded for dynamic offsets
    pub fn uniform<T>(device: &Device) -> Self {
        Self {
            instance_size: std::mem::size_of::<T>() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_properties: Self::HOST,
            min_offset_alignment: device.min_uniform_offset_alignment(),
        }
    }

    /// Host-visible storage array of `T`
    pub fn storage<T>(device: &Device) -> Self {
        Self {
            instance_size: std::mem::size_of::<T>() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            memory_properties: Self::HOST,
            min_offset_alignment: device.min_storage_offset_alignment(),
        }
    }

    /// Host-visible, tightly packed array of `T` with `usage`
    pub fn packed<T>(usage: vk::BufferUsageFlags) -> Self {
        Self {
            instance_size: std::mem::size_of::<T>() as vk::DeviceSize,
            usage,
            memory_properties: Self::HOST,
            min_offset_alignment: 1,
        }
    }

    /// Layout for `instance_count` elements
    pub fn layout(&self, instance_count: vk::DeviceSize) -> VulkanResult<BufferLayout> {
        BufferLayout::new(self.instance_size, instance_count, self.min_offset_alignment)
    }
}

/// A sized device allocation, optionally mapped into host memory
pub struct GpuBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    layout: BufferLayout,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
    mapped: Option<MappedRegion>,
}

impl GpuBuffer {
    /// Round `instance_size` up to a multiple of `min_offset_alignment`
    pub const fn align(instance_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) -> vk::DeviceSize {
        if min_offset_alignment > 1 {
            instance_size.div_ceil(min_offset_alignment) * min_offset_alignment
        } else {
            instance_size
        }
    }

    /// Allocate `instance_count` padded elements described by `spec`
    pub fn new(device: &Arc<Device>, spec: &BufferSpec, instance_count: vk::DeviceSize) -> VulkanResult<Self> {
        let layout = spec.layout(instance_count)?;
        if layout.buffer_size == 0 {
            return Err(VulkanError::invalid("buffer size must be greater than zero"));
        }

        let (buffer, memory) = device.create_buffer(layout.buffer_size, spec.usage, spec.memory_properties)?;

        Ok(Self {
            device: Arc::clone(device),
            buffer,
            memory,
            layout,
            usage: spec.usage,
            memory_properties: spec.memory_properties,
            mapped: None,
        })
    }

    /// Allocate a single unpadded element of `size` bytes
    pub fn single(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let spec = BufferSpec { instance_size: size, usage, memory_properties, min_offset_alignment: 1 };
        Self::new(device, &spec, 1)
    }

    /// Make `slot` hold a buffer of exactly `instance_count` elements
    ///
    /// Buffers are never resized in place: when the count differs the old
    /// buffer is released (after the graphics queue drains) and a new one is
    /// allocated. Returns whether a reallocation happened.
    pub fn ensure_instance_count(
        slot: &mut Option<Self>,
        device: &Arc<Device>,
        spec: &BufferSpec,
        instance_count: vk::DeviceSize,
    ) -> VulkanResult<bool> {
        if let Some(existing) = slot {
            if existing.instance_count() == instance_count && existing.instance_size() == spec.instance_size {
                return Ok(false);
            }
            device.wait_queue()?;
        }
        *slot = None;
        if instance_count > 0 {
            *slot = Some(Self::new(device, spec, instance_count)?);
        }
        log::debug!("Reallocated buffer for {instance_count} instances of {} bytes", spec.instance_size);
        Ok(true)
    }

    /// Upload `data` into a new device-local buffer through a staging copy
    pub fn device_local_with_data(
        device: &Arc<Device>,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let size = data.len() as vk::DeviceSize;
        let mut staging = Self::single(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.map(WHOLE_SIZE, 0)?;
        staging.write_to_buffer(data, 0)?;
        staging.unmap();

        let target = Self::single(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        device.copy_buffer(staging.handle(), target.handle(), size)?;
        Ok(target)
    }

    /// Map `size` bytes at `offset` and keep the host pointer until [`GpuBuffer::unmap`]
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if !self.memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::invalid("buffer memory is not host visible"));
        }
        let (size, offset) = self.layout.resolve(size, offset)?;
        self.unmap();

        let ptr = unsafe {
            self.device
                .handle()
                .map_memory(self.memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .map_err(VulkanError::Api)?;

        let len = usize::try_from(size).map_err(|_| VulkanError::invalid("mapping larger than address space"))?;
        // SAFETY: the driver returned a pointer to `size` mapped bytes that stays valid until unmap_memory.
        match unsafe { MappedRegion::from_raw(ptr, offset, len) } {
            Some(region) => {
                self.mapped = Some(region);
                Ok(())
            }
            None => {
                unsafe { self.device.handle().unmap_memory(self.memory) };
                Err(VulkanError::invalid("map_memory returned a null pointer"))
            }
        }
    }

    /// Release the host mapping; calling it on an unmapped buffer does nothing
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.handle().unmap_memory(self.memory) };
        }
    }

    /// Whether a host mapping is live
    pub const fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    fn mapping_mut(&mut self) -> VulkanResult<&mut MappedRegion> {
        self.mapped
            .as_mut()
            .ok_or_else(|| VulkanError::invalid("buffer must be mapped before writing"))
    }

    /// Copy `data` into the mapped region at buffer offset `offset`
    ///
    /// An empty slice is a no-op.
    pub fn write_to_buffer(&mut self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.layout.resolve(data.len() as vk::DeviceSize, offset)?;
        self.mapping_mut()?.write(offset, data)
    }

    /// Copy one plain-old-data value at `offset`
    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T, offset: vk::DeviceSize) -> VulkanResult<()> {
        self.write_to_buffer(bytemuck::bytes_of(value), offset)
    }

    /// Copy `data` (at most one element) into element `index`
    pub fn write_to_index(&mut self, data: &[u8], index: vk::DeviceSize) -> VulkanResult<()> {
        let offset = self.layout.element_write_offset(data.len() as vk::DeviceSize, index)?;
        self.write_to_buffer(data, offset)
    }

    /// Read back `len` mapped bytes at `offset`
    pub fn read_bytes(&self, offset: vk::DeviceSize, len: usize) -> VulkanResult<&[u8]> {
        require_mapping(self.mapped.as_ref(), "reading")?.read(offset, len)
    }

    // `None` for an empty range, which the driver would reject.
    fn memory_range(
        &self,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> VulkanResult<Option<vk::MappedMemoryRange>> {
        let (size, offset) = self.layout.resolve(size, offset)?;
        if size == 0 {
            return Ok(None);
        }
        let mapping = require_mapping(self.mapped.as_ref(), "flushing or invalidating")?;
        let (size, offset) = atom_aligned_range(
            size,
            offset,
            self.device.properties().limits.non_coherent_atom_size,
            mapping.offset(),
            mapping.offset() + mapping.len() as vk::DeviceSize,
        )?;
        Ok(Some(
            vk::MappedMemoryRange::builder()
                .memory(self.memory)
                .offset(offset)
                .size(size)
                .build(),
        ))
    }

    /// Make host writes in the range visible to the device
    ///
    /// The range is widened to `nonCoherentAtomSize` boundaries within the
    /// current mapping.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let Some(range) = self.memory_range(size, offset)? else {
            return Ok(());
        };
        unsafe { self.device.handle().flush_mapped_memory_ranges(&[range]) }.map_err(VulkanError::Api)
    }

    /// Make device writes in the range visible to the host
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        let Some(range) = self.memory_range(size, offset)? else {
            return Ok(());
        };
        unsafe { self.device.handle().invalidate_mapped_memory_ranges(&[range]) }.map_err(VulkanError::Api)
    }

    /// Flush element `index`
    pub fn flush_index(&self, index: vk::DeviceSize) -> VulkanResult<()> {
        self.flush(self.layout.alignment_size, self.layout.offset_of(index)?)
    }

    /// Invalidate element `index`
    pub fn invalidate_index(&self, index: vk::DeviceSize) -> VulkanResult<()> {
        self.invalidate(self.layout.alignment_size, self.layout.offset_of(index)?)
    }

    /// `{buffer, offset, range}` for a descriptor write
    pub fn descriptor_info(&self, range: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo { buffer: self.buffer, offset, range }
    }

    /// Descriptor info covering exactly element `index`
    pub fn descriptor_info_for_index(&self, index: vk::DeviceSize) -> VulkanResult<vk::DescriptorBufferInfo> {
        Ok(self.descriptor_info(self.layout.alignment_size, self.layout.offset_of(index)?))
    }

    /// Buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Backing memory
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Size bookkeeping
    pub const fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Total size in bytes
    pub const fn buffer_size(&self) -> vk::DeviceSize {
        self.layout.buffer_size
    }

    /// Padded element stride
    pub const fn alignment_size(&self) -> vk::DeviceSize {
        self.layout.alignment_size
    }

    /// Unpadded element size
    pub const fn instance_size(&self) -> vk::DeviceSize {
        self.layout.instance_size
    }

    /// Element count
    pub const fn instance_count(&self) -> vk::DeviceSize {
        self.layout.instance_count
    }

    /// Usage flags the buffer was created with
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory property flags the buffer was created with
    pub const fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
            self.device.handle().free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_properties() {
        for instance_size in [1_u64, 4, 12, 64, 100, 255, 256, 257, 1000] {
            for min in [0_u64, 1, 2, 4, 16, 64, 256] {
                let aligned = GpuBuffer::align(instance_size, min);
                assert!(aligned >= instance_size);
                if min > 0 {
                    assert_eq!(aligned % min, 0, "size {instance_size} min {min}");
                }
                if min <= 1 {
                    assert_eq!(aligned, instance_size);
                }
                // Never pads by a whole extra stride.
                if min > 1 {
                    assert!(aligned - instance_size < min);
                }
            }
        }
    }

    #[test]
    fn test_dynamic_uniform_scenario() {
        let layout = BufferLayout::new(64, 3, 256).unwrap();
        assert_eq!(layout.alignment_size, 256);
        assert_eq!(layout.buffer_size, 768);
        assert_eq!(layout.offset_of(1).unwrap(), 256);
        assert_eq!(layout.resolve(layout.alignment_size, 256).unwrap(), (256, 256));
    }

    #[test]
    fn test_index_offsets_stay_in_bounds() {
        let layout = BufferLayout::new(48, 7, 64).unwrap();
        for index in 0..layout.instance_count {
            let offset = layout.offset_of(index).unwrap();
            assert_eq!(offset, index * layout.alignment_size);
            assert!(offset <= layout.buffer_size - layout.alignment_size);
        }
        assert!(matches!(layout.offset_of(7), Err(VulkanError::OutOfBounds { .. })));
    }

    #[test]
    fn test_resolve_whole_size() {
        let layout = BufferLayout::new(16, 4, 0).unwrap();
        assert_eq!(layout.resolve(WHOLE_SIZE, 0).unwrap(), (64, 0));
        assert_eq!(layout.resolve(WHOLE_SIZE, 16).unwrap(), (48, 16));
        assert!(layout.resolve(32, 48).is_err());
        assert!(layout.resolve(1, u64::MAX).is_err());
    }

    #[test]
    fn test_mapped_region_round_trip() {
        #[repr(C)]
        #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
        struct Transform {
            position: [f32; 4],
            scale: [f32; 4],
        }

        let value = Transform { position: [1.0, 2.0, 3.0, 1.0], scale: [0.5; 4] };
        let mut backing = vec![0_u8; 256];
        let mut region = unsafe { MappedRegion::from_raw(backing.as_mut_ptr().cast(), 0, backing.len()) }.unwrap();

        region.write(0, bytemuck::bytes_of(&value)).unwrap();
        let read = region.read(0, std::mem::size_of::<Transform>()).unwrap();
        assert_eq!(read, bytemuck::bytes_of(&value));
        assert_eq!(*bytemuck::from_bytes::<Transform>(read), value);
    }

    #[test]
    fn test_mapped_region_uses_buffer_offsets() {
        let mut backing = vec![0_u8; 64];
        let mut region = unsafe { MappedRegion::from_raw(backing.as_mut_ptr().cast(), 256, 64) }.unwrap();

        region.write(300, &[7, 8, 9]).unwrap();
        assert_eq!(region.read(300, 3).unwrap(), &[7, 8, 9]);
        // Below the mapped window.
        assert!(region.write(0, &[1]).is_err());
        // Runs past the end.
        assert!(region.write(318, &[1, 2, 3]).is_err());
        drop(region);
        assert_eq!(&backing[44..47], &[7, 8, 9]);
    }

    #[test]
    fn test_null_mapping_rejected() {
        assert!(unsafe { MappedRegion::from_raw(std::ptr::null_mut(), 0, 16) }.is_none());
    }

    #[test]
    fn test_layout_overflow_is_rejected() {
        let total = BufferLayout::new(u64::MAX / 2, 3, 1);
        assert!(matches!(total, Err(VulkanError::InvalidArgument(_))));

        let stride = BufferLayout::new(u64::MAX - 1, 1, 256);
        assert!(matches!(stride, Err(VulkanError::InvalidArgument(_))));

        let spec = BufferSpec::packed::<[f32; 4]>(vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(spec.layout(u64::MAX).is_err());
        assert_eq!(spec.layout(8).unwrap().buffer_size, 128);
    }

    #[test]
    fn test_write_past_instance_count_is_out_of_bounds() {
        let layout = BufferLayout::new(64, 3, 256).unwrap();
        assert_eq!(layout.element_write_offset(64, 2).unwrap(), 512);
        assert_eq!(layout.element_write_offset(16, 0).unwrap(), 0);

        let past_end = layout.element_write_offset(64, 3);
        assert!(matches!(past_end, Err(VulkanError::OutOfBounds { capacity: 768, .. })));
    }

    #[test]
    fn test_oversized_element_write_is_out_of_bounds() {
        let layout = BufferLayout::new(64, 3, 256).unwrap();
        // Fits in the padded stride but not in one element.
        let result = layout.element_write_offset(65, 0);
        assert!(matches!(result, Err(VulkanError::OutOfBounds { size: 65, capacity: 64, .. })));
    }

    #[test]
    fn test_unmapped_access_is_rejected() {
        let result = require_mapping(None, "reading");
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));

        let mut backing = vec![3_u8; 32];
        let region = unsafe { MappedRegion::from_raw(backing.as_mut_ptr().cast(), 0, backing.len()) }.unwrap();
        assert_eq!(require_mapping(Some(&region), "reading").unwrap().read(4, 2).unwrap(), &[3, 3]);
    }

    #[test]
    fn test_flush_range_rounds_to_atom() {
        // Interior range: offset rounds down, end rounds up.
        assert_eq!(atom_aligned_range(16, 100, 64, 0, 1024).unwrap(), (64, 64));
        // Already aligned dynamic-uniform element is untouched.
        assert_eq!(atom_aligned_range(256, 256, 64, 0, 768).unwrap(), (256, 256));
        // Coherent-style atom of 1 (or an unreported 0) changes nothing.
        assert_eq!(atom_aligned_range(48, 64, 1, 0, 448).unwrap(), (48, 64));
        assert_eq!(atom_aligned_range(48, 64, 0, 0, 448).unwrap(), (48, 64));
    }

    #[test]
    fn test_flush_range_at_end_of_mapping_uses_whole_size() {
        // Last 64-byte element of a 448-byte buffer with a 256-byte atom.
        let layout = BufferLayout::new(48, 7, 64).unwrap();
        let offset = layout.offset_of(6).unwrap();
        let range = atom_aligned_range(layout.alignment_size, offset, 256, 0, layout.buffer_size).unwrap();
        assert_eq!(range, (WHOLE_SIZE, 256));

        // Partial mapping starting at 256: never reaches below the window.
        assert_eq!(atom_aligned_range(8, 260, 64, 256, 320).unwrap(), (WHOLE_SIZE, 256));
    }

    #[test]
    fn test_flush_range_outside_mapping_is_rejected() {
        assert!(matches!(
            atom_aligned_range(8, 100, 64, 256, 320),
            Err(VulkanError::OutOfBounds { .. })
        ));
        assert!(atom_aligned_range(64, 300, 64, 256, 320).is_err());
        assert!(atom_aligned_range(1, u64::MAX, 64, 0, 320).is_err());
    }
}
