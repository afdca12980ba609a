// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Adapter enumeration and selection by preference
// - Logical device + graphics/compute queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::config::AdapterPreference;

/// Summary of one enumerated adapter, logged at startup
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub device_local_bytes: u64,
    pub api_version: u32,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Must be torn down before `device`, see Drop
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    /// One queue serves graphics, compute and transfer
    pub queue: vk::Queue,
    pub queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub sampler_anisotropy: bool,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// `surface_extensions` are the instance extensions the window needs,
    /// see [`super::surface::required_extensions`].
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        preference: AdapterPreference,
        surface_extensions: &[*const c_char],
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, surface_extensions)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, queue_family) = Self::pick_physical_device(&instance, preference)?;

        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let sampler_anisotropy = features.sampler_anisotropy == vk::TRUE;

        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family, sampler_anisotropy)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {}", device_name(&properties));
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            queue,
            queue_family,
            debug_utils,
            properties,
            sampler_anisotropy,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[*const c_char],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("raster-demos")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = surface_extensions.to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Log every adapter, then pick the best one for `preference`
    fn pick_physical_device(
        instance: &ash::Instance,
        preference: AdapterPreference,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for (i, &device) in devices.iter().enumerate() {
            let info = Self::adapter_info(instance, device);
            log::info!("GPU Info [{}]: {} ({:?})", i, info.name, info.device_type);
            log::info!("\tDeviceLocalMemory: {} MiB", info.device_local_bytes / (1024 * 1024));

            if info.api_version < vk::API_VERSION_1_2 || !Self::supports_timeline_semaphores(instance, device) {
                log::info!("\tskipped: Vulkan 1.2 timeline semaphores unavailable");
                continue;
            }

            let Some(queue_family) = Self::find_queue_family(instance, device) else {
                log::info!("\tskipped: no graphics+compute queue family");
                continue;
            };

            let score = adapter_score(preference, info.device_type);
            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_family));
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found for {:?} preference", preference))
    }

    fn adapter_info(instance: &ash::Instance, device: vk::PhysicalDevice) -> AdapterInfo {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };

        let device_local_bytes = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        AdapterInfo {
            name: device_name(&props),
            device_type: props.device_type,
            device_local_bytes,
            api_version: props.api_version,
        }
    }

    fn supports_timeline_semaphores(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
        }
        features12.timeline_semaphore == vk::TRUE
    }

    fn find_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        queue_families
            .iter()
            .position(|props| {
                props
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|i| i as u32)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        sampler_anisotropy: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: if sampler_anisotropy { vk::TRUE } else { vk::FALSE },
            ..Default::default()
        };

        // Timeline semaphores are our frame fences
        let mut features12 = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Exclusive access to the memory allocator
    pub fn allocator(&self) -> parking_lot::MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Higher is better, zero means "never pick"
pub fn adapter_score(preference: AdapterPreference, device_type: vk::PhysicalDeviceType) -> u32 {
    match (preference, device_type) {
        (AdapterPreference::Software, vk::PhysicalDeviceType::CPU) => 1000,
        (AdapterPreference::Software, _) => 0,
        (AdapterPreference::Hardware, vk::PhysicalDeviceType::CPU) => 0,
        (_, vk::PhysicalDeviceType::DISCRETE_GPU) => 1000,
        (_, vk::PhysicalDeviceType::INTEGRATED_GPU) => 100,
        (_, vk::PhysicalDeviceType::VIRTUAL_GPU) => 10,
        _ => 1,
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_preference_prefers_discrete_and_never_cpu() {
        let discrete = adapter_score(AdapterPreference::Hardware, vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = adapter_score(AdapterPreference::Hardware, vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(discrete > integrated);
        assert_eq!(adapter_score(AdapterPreference::Hardware, vk::PhysicalDeviceType::CPU), 0);
    }

    #[test]
    fn software_preference_only_accepts_cpu_devices() {
        assert!(adapter_score(AdapterPreference::Software, vk::PhysicalDeviceType::CPU) > 0);
        assert_eq!(adapter_score(AdapterPreference::Software, vk::PhysicalDeviceType::DISCRETE_GPU), 0);
    }

    #[test]
    fn any_preference_accepts_everything() {
        for ty in [
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::OTHER,
        ] {
            assert!(adapter_score(AdapterPreference::Any, ty) > 0, "{:?}", ty);
        }
    }
}
