//! Memory-type and format selection
//!
//! Pure functions over queried device properties so the selection rules can be
//! exercised without a GPU.

use ash::vk;

use crate::error::{VulkanError, VulkanResult};

/// Find the first memory type allowed by `type_bits` that has every flag in `properties`
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&index| {
            type_bits & (1 << index) != 0
                && memory_properties.memory_types[index as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(VulkanError::NoSuitableMemoryType { type_bits, properties })
}

/// Return the first candidate whose tiling features include `features`
///
/// `query` yields the format properties for a candidate; first match wins.
pub fn pick_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut query: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> VulkanResult<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            let props = query(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
        .ok_or(VulkanError::UnsupportedFormat)
}

/// Whether `format` carries a stencil aspect
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(format, vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT)
}

/// Image aspect for a depth attachment of `format`
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil_component(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn test_memory_type_respects_type_bits() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type_index(&props, 0b111, host).unwrap(), 1);
        // Type 1 excluded by the resource, next match wins.
        assert_eq!(find_memory_type_index(&props, 0b101, host).unwrap(), 2);
        assert_eq!(
            find_memory_type_index(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn test_memory_type_missing_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type_index(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, VulkanError::NoSuitableMemoryType { type_bits: 1, .. }));
    }

    #[test]
    fn test_format_first_match_wins() {
        let candidates = [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT];
        let feature = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let picked = pick_supported_format(&candidates, vk::ImageTiling::OPTIMAL, feature, |format| {
            if format == vk::Format::D32_SFLOAT {
                vk::FormatProperties::default()
            } else {
                vk::FormatProperties { optimal_tiling_features: feature, ..Default::default() }
            }
        })
        .unwrap();
        assert_eq!(picked, vk::Format::D32_SFLOAT_S8_UINT);
    }

    #[test]
    fn test_format_tiling_is_honoured() {
        let feature = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let result = pick_supported_format(&[vk::Format::D32_SFLOAT], vk::ImageTiling::LINEAR, feature, |_| {
            vk::FormatProperties { optimal_tiling_features: feature, ..Default::default() }
        });
        assert!(matches!(result, Err(VulkanError::UnsupportedFormat)));
    }

    #[test]
    fn test_depth_aspect() {
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert!(depth_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
    }
}
