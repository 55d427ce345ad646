//! Vulkan context: instance, physical device, logical device, and queue.
//!
//! The context is headless. Surfaces and swapchains belong to the application;
//! this crate only needs a device with the ray tracing extensions enabled.

use ash::{vk, Entry, Instance, Device};
use ash::khr::{acceleration_structure, ray_tracing_pipeline, deferred_host_operations};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::{Result, VulkanError, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

/// Ray tracing constants reported by the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each record inside an SBT region.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of the start of each SBT region.
    pub shader_group_base_alignment: u32,
    /// Required alignment of scratch buffer device addresses.
    pub min_scratch_offset_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_instance_count: u64,
}

impl Default for RayTracingProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            min_scratch_offset_alignment: 128,
            max_ray_recursion_depth: 1,
            max_instance_count: u32::MAX as u64,
        }
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.compute.is_some()
    }
}

/// Main Vulkan context holding all core Vulkan objects.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,

    /// Queue used for every build and copy submission.
    pub queue: vk::Queue,

    // Ray tracing extension loaders
    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    pub rt_properties: RayTracingProperties,
    pub device_properties: vk::PhysicalDeviceProperties,

    // Debug messenger (only in debug builds)
    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    #[cfg(debug_assertions)]
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
}

impl VulkanContext {
    /// Create a headless context on the best ray tracing capable GPU.
    pub unsafe fn new_headless(enable_validation: bool) -> Result<Self> {
        let entry = Entry::load().map_err(|_| VulkanError::Unsupported("Vulkan loader"))?;

        let api_version = match entry.try_enumerate_instance_version()
            .map_err(|e| VulkanError::vk("enumerate_instance_version", e))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            tracing::error!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            );
            return Err(VulkanError::Unsupported("Vulkan 1.3"));
        }

        let instance = Self::create_instance(&entry, enable_validation)?;

        #[cfg(debug_assertions)]
        let (debug_utils_loader, debug_messenger) = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug) => debug,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };
        #[cfg(not(debug_assertions))]
        let (debug_utils_loader, debug_messenger) = (None, None);

        let (physical_device, queue_families) = match Self::pick_physical_device(&instance) {
            Ok(picked) => picked,
            Err(e) => {
                Self::destroy_partial(&instance, &debug_utils_loader, debug_messenger);
                return Err(e);
            }
        };

        let rt_properties = Self::query_rt_properties(&instance, physical_device);
        let device_properties = instance.get_physical_device_properties(physical_device);

        let (device, queue) = match Self::create_logical_device(&instance, physical_device, &queue_families) {
            Ok(created) => created,
            Err(e) => {
                Self::destroy_partial(&instance, &debug_utils_loader, debug_messenger);
                return Err(e);
            }
        };

        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            queue,
            accel_struct_loader,
            rt_pipeline_loader,
            rt_properties,
            device_properties,
            #[cfg(debug_assertions)]
            debug_messenger,
            #[cfg(debug_assertions)]
            debug_utils_loader,
        })
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        #[allow(unused_mut)]
        let mut extensions: Vec<*const c_char> = Vec::new();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter()
            .map(|n| n.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry.create_instance(&create_info, None)
            .map_err(|e| VulkanError::vk("create_instance", e))
    }

    /// Destroy the debug messenger, then the instance, after a later setup step failed.
    unsafe fn destroy_partial(
        instance: &Instance,
        debug_utils_loader: &Option<ash::ext::debug_utils::Instance>,
        debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    ) {
        if let (Some(loader), Some(messenger)) = (debug_utils_loader, debug_messenger) {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        instance.destroy_instance(None);
    }

    /// Setup debug messenger for validation layers.
    #[cfg(debug_assertions)]
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| VulkanError::vk("create_debug_utils_messenger", e))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    /// Select the best physical device that supports ray tracing.
    unsafe fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(|e| VulkanError::vk("enumerate_physical_devices", e))?;

        let best = devices.iter()
            .map(|&device| (device, Self::rate_device(instance, device)))
            .filter(|&(_, score)| score > 0)
            .max_by_key(|&(_, score)| score);

        let physical_device = match best {
            Some((device, _)) => device,
            None => return Err(VulkanError::Unsupported("ray tracing capable GPU")),
        };

        let queue_families = Self::find_queue_families(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        tracing::info!("Selected GPU: {}", name);

        Ok((physical_device, queue_families))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        if !Self::supports_ray_tracing(instance, device) {
            return 0;
        }

        if !Self::find_queue_families(instance, device).is_complete() {
            return 0;
        }

        let props = instance.get_physical_device_properties(device);
        let mut score = 1u32;

        // Prefer discrete GPU
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // Add VRAM size to score
        let memory_props = instance.get_physical_device_memory_properties(device);
        for i in 0..memory_props.memory_heap_count as usize {
            let heap = memory_props.memory_heaps[i];
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32);
            }
        }

        score
    }

    /// Find queue family indices for a physical device.
    ///
    /// Ray dispatch usually shares the graphics queue, so a family that does
    /// both graphics and compute wins over a compute-only one.
    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let queue_families = instance.get_physical_device_queue_family_properties(device);

        let mut indices = QueueFamilyIndices::default();

        for (i, family) in queue_families.iter().enumerate() {
            let i = i as u32;
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let compute = family.queue_flags.contains(vk::QueueFlags::COMPUTE);

            if graphics && indices.graphics.is_none() {
                indices.graphics = Some(i);
            }

            if compute && (indices.compute.is_none() || graphics && indices.graphics == Some(i)) {
                indices.compute = Some(i);
            }
        }

        indices
    }

    /// Check for the acceleration structure and ray tracing pipeline extensions and features.
    unsafe fn supports_ray_tracing(instance: &Instance, device: vk::PhysicalDevice) -> bool {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return false,
        };

        let has_extension = |wanted: &CStr| extensions.iter().any(|e| {
            CStr::from_ptr(e.extension_name.as_ptr()) == wanted
        });

        if !has_extension(acceleration_structure::NAME)
            || !has_extension(ray_tracing_pipeline::NAME)
            || !has_extension(deferred_host_operations::NAME)
        {
            return false;
        }

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut vulkan_12_features);

        instance.get_physical_device_features2(device, &mut features2);

        accel_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
            && vulkan_12_features.buffer_device_address == vk::TRUE
    }

    /// Query the SBT and scratch layout constants.
    unsafe fn query_rt_properties(instance: &Instance, device: vk::PhysicalDevice) -> RayTracingProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut as_props);

        instance.get_physical_device_properties2(device, &mut props2);

        RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            max_instance_count: as_props.max_instance_count,
        }
    }

    /// Create logical device with the ray tracing features enabled.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> Result<(Device, vk::Queue)> {
        let family = queue_families.compute
            .ok_or(VulkanError::Unsupported("compute queue family"))?;

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family)
            .queue_priorities(&queue_priorities)];

        let extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true);

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance.create_device(physical_device, &create_info, None)
            .map_err(|e| VulkanError::vk("create_device", e))?;

        let queue = device.get_device_queue(family, 0);

        Ok((device, queue))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            #[cfg(debug_assertions)]
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers.
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{}", message);
    }

    vk::FALSE
}
