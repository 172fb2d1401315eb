//! Vulkan instance and validation hookup

use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};
use std::ffi::{CStr, CString};

use crate::config::{RendererConfig, RenderingMode};
use crate::error::{VulkanError, VulkanResult};
use crate::window::RenderWindow;

const VALIDATION_LAYER: &CStr =
    // SAFETY: literal is nul-terminated with no interior nul
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Vulkan instance wrapper with RAII cleanup
///
/// Owns the loader entry, the instance and, when validation is enabled, the
/// debug messenger that forwards layer output to `log`.
pub struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    api_version: u32,
}

impl VulkanInstance {
    /// Create the instance with the extensions `window` needs for presentation
    pub fn new(window: &dyn RenderWindow, config: &RendererConfig) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;

        let api_version = match config.rendering_mode {
            RenderingMode::Dynamic => vk::API_VERSION_1_3,
            RenderingMode::RenderPass => vk::API_VERSION_1_1,
        };

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| VulkanError::InitializationFailed("application name contains a nul byte".to_string()))?;
        let engine_name = CString::new("gpu_core").map_err(|_| VulkanError::InitializationFailed("engine name".to_string()))?;
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let enable_validation = config.validation_enabled() && Self::validation_available(&entry);
        if config.validation_enabled() && !enable_validation {
            log::warn!("Validation requested but {} is not installed", VALIDATION_LAYER.to_string_lossy());
        }

        let cstr_extensions = window
            .required_instance_extensions()?
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VulkanError::InitializationFailed("invalid instance extension name".to_string()))?;
        let mut extensions: Vec<*const std::os::raw::c_char> =
            cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let validation_features_name = vk::ExtValidationFeaturesFn::name();
        let enable_sync_validation = enable_validation && Self::layer_has_extension(&entry, validation_features_name);
        if enable_sync_validation {
            extensions.push(validation_features_name.as_ptr());
        } else if enable_validation {
            log::warn!(
                "{} unavailable; synchronization validation stays off",
                validation_features_name.to_string_lossy()
            );
        }

        let layers: Vec<*const std::os::raw::c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        const VALIDATION_FEATURES: [vk::ValidationFeatureEnableEXT; 1] =
            [vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION];
        let mut validation_features =
            vk::ValidationFeaturesEXT::builder().enabled_validation_features(&VALIDATION_FEATURES);

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if enable_sync_validation {
            create_info = create_info.push_next(&mut validation_features);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create instance: {e:?}")))?;

        let debug = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        log::info!(
            "Vulkan instance created (validation {})",
            if enable_validation { "on" } else { "off" }
        );

        Ok(Self { entry, instance, debug, api_version })
    }

    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                    name == VALIDATION_LAYER
                })
            })
            .unwrap_or(false)
    }

    fn layer_has_extension(entry: &Entry, name: &CStr) -> bool {
        entry
            .enumerate_instance_extension_properties(Some(VALIDATION_LAYER))
            .map(|available| has_extension(&available, name))
            .unwrap_or(false)
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }.map_err(VulkanError::Api)
    }

    /// Loader entry points
    pub const fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Instance function table
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Requested API version
    pub const fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Whether the debug messenger is installed
    pub const fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available.iter().any(|extension| {
        // SAFETY: the loader nul-terminates extension names within the array
        let extension_name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
        extension_name == name
    })
}

/// Routes validation layer messages to `log` by severity
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut properties = vk::ExtensionProperties::default();
        for (slot, &byte) in properties.extension_name.iter_mut().zip(name.to_bytes()) {
            *slot = byte as std::os::raw::c_char;
        }
        properties
    }

    #[test]
    fn test_validation_features_only_when_advertised() {
        let features = vk::ExtValidationFeaturesFn::name();
        let without = [extension(DebugUtils::name())];
        assert!(!has_extension(&without, features));
        assert!(!has_extension(&[], features));

        let with = [extension(DebugUtils::name()), extension(features)];
        assert!(has_extension(&with, features));
        assert!(has_extension(&with, DebugUtils::name()));
    }

    #[test]
    fn test_extension_match_is_exact() {
        let prefix = CStr::from_bytes_with_nul(b"VK_EXT_validation\0").unwrap();
        assert!(!has_extension(&[extension(vk::ExtValidationFeaturesFn::name())], prefix));
    }
}
