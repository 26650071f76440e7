//! Vulkan context management
//!
//! Instance, surface, physical device selection and logical device creation.
//! Targets Vulkan 1.3 with dynamic rendering; ray queries and a dedicated
//! transfer queue are optional and reported through [`DeviceCapabilities`].

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;
use thiserror::Error;

use crate::render::features::DeviceCapabilities;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A required device feature or extension is missing
    #[error("Missing device feature: {0}")]
    MissingFeature(String),

    /// SPIR-V could not be read or was malformed
    #[error("Failed to load shader {path:?}: {reason}")]
    ShaderLoad {
        /// File that failed
        path: PathBuf,
        /// What went wrong
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Anything that can host a presentation surface
///
/// Implemented by the GLFW window behind the `window` feature; headless
/// embedders implement it over their own windowing layer.
pub trait SurfaceSource {
    /// Instance extensions the surface needs
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>>;

    /// Create the surface for `instance`
    fn create_surface(&self, entry: &Entry, instance: &Instance) -> VulkanResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels
    fn framebuffer_size(&self) -> (u32, u32);
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.3 instance, optionally with validation
    pub fn new(surface_source: &dyn SurfaceSource, app_name: &str, version: (u32, u32, u32), enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| VulkanError::InitializationFailed("Application name contains a NUL byte".to_string()))?;
        let engine_name_cstr = CString::new("framegraph_engine").unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, version.0, version.1, version.2))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let required_extensions = surface_source.required_instance_extensions()?;
        let cstr_extensions: Vec<CString> = required_extensions
            .iter()
            .filter_map(|ext| CString::new(ext.as_str()).ok())
            .collect();
        let mut extensions: Vec<*const c_char> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap_or_default()]
        } else {
            Vec::new()
        };
        let layer_names_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        let debug = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            Some((debug_utils, messenger))
        } else {
            None
        };

        log::info!("Created Vulkan 1.3 instance (validation: {})", enable_validation);
        Ok(Self { entry, instance, debug })
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

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
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

/// Routes validation messages into `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Queue families chosen for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Graphics + compute family
    pub graphics: u32,
    /// Family that can present to the surface
    pub present: u32,
    /// Transfer-only family, if the device has one
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Pick families: the first graphics+compute family, a present family
    /// (preferring the graphics one) and a family with transfer but no graphics
    pub fn select(families: &[vk::QueueFamilyProperties], supports_present: impl Fn(u32) -> bool) -> Option<Self> {
        let graphics_compute = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let graphics = families
            .iter()
            .position(|f| f.queue_count > 0 && f.queue_flags.contains(graphics_compute))? as u32;

        let present = if supports_present(graphics) {
            graphics
        } else {
            (0..families.len() as u32).find(|&i| families[i as usize].queue_count > 0 && supports_present(i))?
        };

        let transfer_only = |f: &vk::QueueFamilyProperties| {
            f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::TRANSFER) && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        };
        // Prefer a pure DMA family over an async compute one
        let transfer = families
            .iter()
            .position(|f| transfer_only(f) && !f.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .or_else(|| families.iter().position(transfer_only))
            .map(|i| i as u32);

        Some(Self { graphics, present, transfer })
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Chosen queue families
    pub queue_families: QueueFamilyIndices,
    /// Optional capabilities
    pub capabilities: DeviceCapabilities,
}

impl PhysicalDeviceInfo {
    /// Human-readable device name
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Select the first suitable device, preferring discrete GPUs
    pub fn select_suitable_device(instance: &Instance, surface: vk::SurfaceKHR, surface_loader: &Surface) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        let mut candidates: Vec<Self> = Vec::new();
        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => candidates.push(info),
                Err(e) => log::debug!("Skipping physical device {:?}: {}", device, e),
            }
        }

        candidates.sort_by_key(|info| match info.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            _ => 2,
        });

        let selected = candidates
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::InitializationFailed("No suitable GPU found".to_string()))?;

        log::info!("Selected GPU: {}", selected.name());
        if selected.queue_families.transfer.is_none() {
            log::warn!("No dedicated transfer queue family; uploads share the graphics queue");
        }
        if !selected.capabilities.ray_tracing {
            log::info!("Ray query extensions unavailable on {}", selected.name());
        }
        Ok(selected)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if vk::api_version_major(properties.api_version) < 1 || vk::api_version_minor(properties.api_version) < 3 {
            return Err(VulkanError::MissingFeature("Vulkan 1.3".to_string()));
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_families = QueueFamilyIndices::select(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        })
        .ok_or_else(|| VulkanError::MissingFeature("graphics+compute and present queues".to_string()))?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device).map_err(VulkanError::Api)? };
        let has_extension = |name: &CStr| {
            extensions
                .iter()
                .any(|available| unsafe { CStr::from_ptr(available.extension_name.as_ptr()) } == name)
        };

        if !has_extension(SwapchainLoader::name()) {
            return Err(VulkanError::MissingFeature("VK_KHR_swapchain".to_string()));
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut features12)
            .push_next(&mut features13)
            .build();
        unsafe { instance.get_physical_device_features2(device, &mut features2) };

        if features13.dynamic_rendering == vk::FALSE {
            return Err(VulkanError::MissingFeature("dynamicRendering".to_string()));
        }
        if features2.features.multi_draw_indirect == vk::FALSE || features2.features.draw_indirect_first_instance == vk::FALSE {
            return Err(VulkanError::MissingFeature("multiDrawIndirect / drawIndirectFirstInstance".to_string()));
        }

        let ray_extensions = has_extension(AccelerationStructure::name())
            && has_extension(vk::KhrRayQueryFn::name())
            && has_extension(DeferredHostOperations::name())
            && features12.buffer_device_address == vk::TRUE;

        Ok(Self {
            device,
            properties,
            queue_families,
            capabilities: DeviceCapabilities {
                ray_tracing: ray_extensions,
                dedicated_transfer: queue_families.transfer.is_some(),
            },
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics and compute queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Transfer queue (the graphics queue when there is no dedicated family)
    pub transfer_queue: vk::Queue,
    /// Queue families in use
    pub families: QueueFamilyIndices,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Acceleration structure loader when ray tracing is enabled
    pub acceleration_structure: Option<AccelerationStructure>,
}

impl LogicalDevice {
    /// Create the device with the features the renderer relies on
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo, enable_ray_tracing: bool) -> VulkanResult<Self> {
        let families = physical.queue_families;
        let mut unique_families = vec![families.graphics];
        for family in [Some(families.present), families.transfer].into_iter().flatten() {
            if !unique_families.contains(&family) {
                unique_families.push(family);
            }
        }

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let mut extension_names = vec![SwapchainLoader::name().as_ptr()];
        if enable_ray_tracing {
            extension_names.push(AccelerationStructure::name().as_ptr());
            extension_names.push(vk::KhrRayQueryFn::name().as_ptr());
            extension_names.push(DeferredHostOperations::name().as_ptr());
        }

        let core_features = vk::PhysicalDeviceFeatures::builder()
            .multi_draw_indirect(true)
            .draw_indirect_first_instance(true)
            .sampler_anisotropy(true)
            .build();
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(enable_ray_tracing)
            .build();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true).build();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true)
            .build();
        let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::builder().ray_query(true).build();

        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .features(core_features)
            .push_next(&mut features12)
            .push_next(&mut features13);
        if enable_ray_tracing {
            features2 = features2.push_next(&mut as_features).push_next(&mut ray_query_features);
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        let transfer_queue = match families.transfer {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => graphics_queue,
        };

        let swapchain_loader = SwapchainLoader::new(instance, &device);
        let acceleration_structure = enable_ray_tracing.then(|| AccelerationStructure::new(instance, &device));

        log::debug!(
            "Created logical device (graphics {}, present {}, transfer {:?})",
            families.graphics,
            families.present,
            families.transfer
        );

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            transfer_queue,
            families,
            swapchain_loader,
            acceleration_structure,
        })
    }

    /// Family backing the transfer queue
    pub fn transfer_family(&self) -> u32 {
        self.families.transfer.unwrap_or(self.families.graphics)
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Core Vulkan objects: instance, surface and device
pub struct VulkanContext {
    /// Vulkan surface for rendering
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device for operations
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create instance, surface and device for a surface source
    pub fn new(
        surface_source: &dyn SurfaceSource,
        app_name: &str,
        version: (u32, u32, u32),
        enable_validation: bool,
        want_ray_tracing: bool,
    ) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(surface_source, app_name, version, enable_validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = surface_source.create_surface(&instance.entry, &instance.instance)?;

        let physical_device = match PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader) {
            Ok(info) => info,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };

        let enable_ray_tracing = want_ray_tracing && physical_device.capabilities.ray_tracing;
        let device = match LogicalDevice::new(&instance.instance, &physical_device, enable_ray_tracing) {
            Ok(device) => device,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(e);
            }
        };

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
        })
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the raw Device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Get the graphics queue family index
    pub fn graphics_queue_family(&self) -> u32 {
        self.device.families.graphics
    }

    /// Ray tracing was requested and enabled on the device
    pub fn ray_tracing_enabled(&self) -> bool {
        self.device.acceleration_structure.is_some()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // device drops before instance by field order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exhaustive so a new variant has to be constructed somewhere first
    fn is_setup_failure(error: &VulkanError) -> bool {
        match error {
            VulkanError::InitializationFailed(_) | VulkanError::MissingFeature(_) | VulkanError::ShaderLoad { .. } => true,
            VulkanError::Api(_) | VulkanError::ResourceNotFound { .. } | VulkanError::InvalidOperation { .. } => false,
        }
    }

    #[test]
    fn test_error_variants_render_their_cause() {
        let errors = [
            VulkanError::Api(vk::Result::ERROR_DEVICE_LOST),
            VulkanError::ResourceNotFound { id: 42 },
            VulkanError::InvalidOperation { reason: "slot 1 is already Recording".to_string() },
            VulkanError::InitializationFailed("gpu-allocator: no heap".to_string()),
            VulkanError::MissingFeature("ray query".to_string()),
            VulkanError::ShaderLoad { path: PathBuf::from("cull.comp.spv"), reason: "not found".to_string() },
        ];
        let setup: Vec<bool> = errors.iter().map(is_setup_failure).collect();
        assert_eq!(setup, [false, false, false, true, true, true]);
        assert!(errors[0].to_string().contains("ERROR_DEVICE_LOST"));
        assert!(errors[1].to_string().contains("42"));
        assert!(errors[5].to_string().contains("cull.comp.spv"));
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_selection_prefers_dedicated_transfer() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::select(&families, |_| true).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 0, present: 0, transfer: Some(2) });
    }

    #[test]
    fn test_queue_selection_without_transfer_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::select(&families, |_| true).unwrap();
        assert_eq!(indices.transfer, None);
    }

    #[test]
    fn test_queue_selection_separate_present_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::select(&families, |i| i == 1).unwrap();
        assert_eq!(indices.present, 1);
        assert_eq!(indices.transfer, Some(1));
    }

    #[test]
    fn test_queue_selection_requires_graphics_compute() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::COMPUTE)];
        assert!(QueueFamilyIndices::select(&families, |_| true).is_none());
    }
}
