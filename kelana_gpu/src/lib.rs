/*! Vulkan-first GPU runtime core.
 *
 * Provides the device context, bindless descriptor cache, reference-counted
 * resource lifetimes and the command submission + upload heap pipeline. Raw
 * vulkan structures are used as much as possible in the public API; this
 * crate should mostly add lifetime and scheduling semantics on top of them.
 */

use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
};

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod upload;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

pub const MAX_FRAMES_IN_FLIGHT_ALLOWED: u32 = 4;
pub const MAX_COMMAND_BUFFER_PER_POOL: usize = 16;
pub const MAX_PIPELINE_BARRIER_BATCH_SIZE: usize = 16;
pub const MAX_PIPELINE_COLOR_ATTACHMENT_COUNT: usize = 8;

const MAX_PHYSICAL_DEVICE_SEARCH: usize = 8;
const MAX_QUEUE_FAMILY_SEARCH: usize = 8;

/// Logical queues exposed by the device. `Main` supports graphics, compute
/// and transfer work; `Transfer` and `Compute` map to dedicated families
/// when the hardware has them and alias `Main` otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceQueue {
    Main,
    Transfer,
    Compute,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub variant: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub(crate) fn to_vulkan_version(self) -> u32 {
        vk::make_api_version(self.variant, self.major, self.minor, self.patch)
    }
}

/// Bindless table sizes and frame pacing limits. Every value is clamped
/// against the device reported limits during device creation.
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    pub max_frames_in_flight: u32,
    pub swapchain_image_count: u32,
    pub max_images: u32,
    pub max_buffers: u32,
    pub max_samplers: u32,
    pub push_constant_max_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            swapchain_image_count: 3,
            max_images: 1024,
            max_buffers: 1024,
            max_samplers: 128,
            push_constant_max_size: 128,
        }
    }
}

pub struct DeviceDescriptor<'a> {
    pub name: &'a str,
    pub app_name: &'a str,
    pub app_version: Version,
    pub engine_name: &'a str,
    pub engine_version: Version,
    pub preferred_device: vk::PhysicalDeviceType,
    pub config: DeviceConfig,
    pub validation: bool,
}

impl<'a> Default for DeviceDescriptor<'a> {
    fn default() -> Self {
        Self {
            name: "main_device",
            app_name: "kelana",
            app_version: Version::default(),
            engine_name: "kelana",
            engine_version: Version::default(),
            preferred_device: vk::PhysicalDeviceType::DISCRETE_GPU,
            config: DeviceConfig::default(),
            validation: cfg!(debug_assertions),
        }
    }
}

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    pub(crate) surface_fn: ash::khr::surface::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub(crate) fn new(desc: &DeviceDescriptor, display_handle: RawDisplayHandle) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(desc.app_name).unwrap_or_default();
        let engine_name = CString::new(desc.engine_name).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .application_version(desc.app_version.to_vulkan_version())
            .engine_name(engine_name.as_c_str())
            .engine_version(desc.engine_version.to_vulkan_version())
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        if desc.validation {
            extension_names.push(debug_utils::NAME.as_ptr());
        }

        let layer_strings = if desc.validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe {
            entry
                .create_instance(&instance_info, None)
                .with_context(|| "Failed to create vulkan instance!")?
        };

        let debug = if desc.validation {
            let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));

            let loader = debug_utils::Instance::new(&entry, &raw);
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&debug_utils_info, None)? };
            Some((loader, messenger))
        } else {
            None
        };

        let surface_fn = ash::khr::surface::Instance::new(&entry, &raw);

        Ok(Self {
            entry,
            raw,
            surface_fn,
            debug_utils: debug,
        })
    }

    fn get_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        let mut handles = unsafe { self.raw.enumerate_physical_devices()? };
        handles.truncate(MAX_PHYSICAL_DEVICE_SEARCH);

        Ok(handles
            .into_iter()
            .map(|raw| {
                let properties = unsafe { self.raw.get_physical_device_properties(raw) };
                let name = unsafe {
                    CStr::from_ptr(properties.device_name.as_ptr())
                        .to_str()
                        .unwrap_or("unknown")
                        .to_owned()
                };
                let queue_families = unsafe {
                    self.raw
                        .get_physical_device_queue_family_properties(raw)
                };

                PhysicalDevice {
                    raw,
                    name,
                    properties,
                    queue_families,
                }
            })
            .collect())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[VK]{}{:?}", types, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[VK]{}{:?}", types, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[VK]{}{:?}", types, message);
        }
        _ => {
            log::trace!("[VK]{}{:?}", types, message);
        }
    }

    vk::FALSE
}

#[derive(Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) queue_families: Vec<vk::QueueFamilyProperties>,
}

fn device_type_bucket(device_type: vk::PhysicalDeviceType) -> usize {
    (device_type.as_raw().clamp(0, 4)) as usize
}

fn device_score(limits: &vk::PhysicalDeviceLimits) -> u32 {
    limits.max_memory_allocation_count / 1000
        + limits.max_bound_descriptor_sets / 1000
        + limits.max_draw_indirect_count / 1000
        + limits.max_draw_indexed_index_value / 1000
}

/// Buckets candidates by device type, ranks each bucket by an aggregate
/// limit score and picks the best entry of the preferred bucket, falling
/// back on discrete > integrated > virtual > cpu > other.
fn select_physical_device(
    devices: &[PhysicalDevice],
    preferred: vk::PhysicalDeviceType,
) -> Option<usize> {
    let priority = [
        vk::PhysicalDeviceType::DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU,
        vk::PhysicalDeviceType::CPU,
        vk::PhysicalDeviceType::OTHER,
    ];

    let mut buckets: [Vec<usize>; 5] = Default::default();
    for (index, device) in devices.iter().enumerate() {
        buckets[device_type_bucket(device.properties.device_type)].push(index);
    }
    for bucket in &mut buckets {
        bucket.sort_by(|&a, &b| {
            device_score(&devices[b].properties.limits)
                .cmp(&device_score(&devices[a].properties.limits))
        });
    }

    let preferred_bucket = &buckets[device_type_bucket(preferred)];
    if let Some(&index) = preferred_bucket.first() {
        return Some(index);
    }

    priority
        .into_iter()
        .find_map(|device_type| buckets[device_type_bucket(device_type)].first().copied())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueFamilySelection {
    pub(crate) main: u32,
    pub(crate) transfer: u32,
    pub(crate) compute: u32,
}

impl QueueFamilySelection {
    pub(crate) fn family_index(&self, queue: DeviceQueue) -> u32 {
        match queue {
            DeviceQueue::Main => self.main,
            DeviceQueue::Transfer => self.transfer,
            DeviceQueue::Compute => self.compute,
        }
    }
}

/// Resolves the three logical queue families. The main family must support
/// graphics, compute and transfer; a transfer-only family and an async
/// compute family are used when present and alias main otherwise.
fn resolve_queue_families(families: &[vk::QueueFamilyProperties]) -> Result<QueueFamilySelection> {
    let mut main = None;
    let mut transfer = None;
    let mut compute = None;

    for (index, family) in families.iter().take(MAX_QUEUE_FAMILY_SEARCH).enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;
        let flags = family.queue_flags;

        if main.is_none()
            && flags.contains(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            )
        {
            main = Some(index);
        }
        if transfer.is_none()
            && flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
        {
            transfer = Some(index);
        }
        if compute.is_none()
            && flags.contains(vk::QueueFlags::COMPUTE)
            && main != Some(index)
            && transfer != Some(index)
        {
            compute = Some(index);
        }
    }

    let main = main.ok_or_else(|| {
        anyhow::anyhow!("No queue family supports graphics, compute and transfer!")
    })?;

    Ok(QueueFamilySelection {
        main,
        transfer: transfer.unwrap_or(main),
        compute: compute.unwrap_or(main),
    })
}

struct RequiredFeatures<'a> {
    core: vk::PhysicalDeviceFeatures,
    vulkan_1_2: vk::PhysicalDeviceVulkan12Features<'a>,
    vulkan_1_3: vk::PhysicalDeviceVulkan13Features<'a>,
}

fn required_device_features<'a>() -> RequiredFeatures<'a> {
    let core = vk::PhysicalDeviceFeatures::default()
        .full_draw_index_uint32(true)
        .multi_draw_indirect(true)
        .sampler_anisotropy(true)
        .shader_int16(true)
        .shader_int64(true)
        .shader_float64(true);

    let vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_uniform_buffer_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true)
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .scalar_block_layout(true)
        .shader_int8(true)
        .draw_indirect_count(true);

    let vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(true);

    RequiredFeatures {
        core,
        vulkan_1_2,
        vulkan_1_3,
    }
}

fn verify_required_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let mut supported_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut supported_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let core = {
        let mut supported = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut supported_1_2)
            .push_next(&mut supported_1_3);
        unsafe {
            instance.get_physical_device_features2(physical_device, &mut supported);
        }
        supported.features
    };

    let missing: &[(&str, bool)] = &[
        (
            "fullDrawIndexUint32",
            core.full_draw_index_uint32 == vk::FALSE,
        ),
        (
            "multiDrawIndirect",
            core.multi_draw_indirect == vk::FALSE,
        ),
        (
            "samplerAnisotropy",
            core.sampler_anisotropy == vk::FALSE,
        ),
        ("shaderInt16", core.shader_int16 == vk::FALSE),
        ("shaderInt64", core.shader_int64 == vk::FALSE),
        (
            "shaderFloat64",
            core.shader_float64 == vk::FALSE,
        ),
        (
            "descriptorIndexing",
            supported_1_2.descriptor_indexing == vk::FALSE,
        ),
        (
            "runtimeDescriptorArray",
            supported_1_2.runtime_descriptor_array == vk::FALSE,
        ),
        (
            "descriptorBindingPartiallyBound",
            supported_1_2.descriptor_binding_partially_bound == vk::FALSE,
        ),
        (
            "descriptorBindingSampledImageUpdateAfterBind",
            supported_1_2.descriptor_binding_sampled_image_update_after_bind == vk::FALSE,
        ),
        (
            "descriptorBindingStorageImageUpdateAfterBind",
            supported_1_2.descriptor_binding_storage_image_update_after_bind == vk::FALSE,
        ),
        (
            "descriptorBindingStorageBufferUpdateAfterBind",
            supported_1_2.descriptor_binding_storage_buffer_update_after_bind == vk::FALSE,
        ),
        (
            "timelineSemaphore",
            supported_1_2.timeline_semaphore == vk::FALSE,
        ),
        (
            "bufferDeviceAddress",
            supported_1_2.buffer_device_address == vk::FALSE,
        ),
        (
            "scalarBlockLayout",
            supported_1_2.scalar_block_layout == vk::FALSE,
        ),
        ("shaderInt8", supported_1_2.shader_int8 == vk::FALSE),
        (
            "drawIndirectCount",
            supported_1_2.draw_indirect_count == vk::FALSE,
        ),
        (
            "synchronization2",
            supported_1_3.synchronization2 == vk::FALSE,
        ),
        (
            "dynamicRendering",
            supported_1_3.dynamic_rendering == vk::FALSE,
        ),
    ];

    for (name, is_missing) in missing {
        if *is_missing {
            return Err(anyhow::anyhow!(
                "Physical device does not support required feature {}",
                name
            ));
        }
    }

    Ok(())
}

/// Raw device state shared by every resource object. Owns the logical
/// device, the allocator and the queue family selection; higher level frame
/// and lifetime logic lives in [`device::Device`].
pub(crate) struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) debug_utils: Option<debug_utils::Device>,
    pub(crate) queue_families: QueueFamilySelection,
    pub(crate) physical_device: PhysicalDevice,
    pub(crate) instance: Instance,
}

impl DeviceShared {
    pub(crate) fn new(desc: &DeviceDescriptor, instance: Instance) -> Result<Self> {
        let physical_devices = instance.get_physical_devices()?;
        if physical_devices.is_empty() {
            return Err(anyhow::anyhow!("No vulkan capable device found!"));
        }

        let selected = select_physical_device(&physical_devices, desc.preferred_device)
            .ok_or_else(|| anyhow::anyhow!("No suitable physical device found!"))?;
        let physical_device = physical_devices[selected].clone();

        log::info!("Physical device name: {}", physical_device.name);

        verify_required_features(&instance.raw, physical_device.raw)?;
        let queue_families = resolve_queue_families(&physical_device.queue_families)?;

        let raw = Self::new_ash_device(&instance, &physical_device, queue_families)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })?;
        let allocator = Mutex::new(allocator);

        let debug_utils = desc
            .validation
            .then(|| debug_utils::Device::new(&instance.raw, &raw));

        Ok(Self {
            allocator: ManuallyDrop::new(allocator),
            raw,
            debug_utils,
            queue_families,
            physical_device,
            instance,
        })
    }

    fn new_ash_device(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_families: QueueFamilySelection,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];

        let mut indices = vec![
            queue_families.main,
            queue_families.transfer,
            queue_families.compute,
        ];
        indices.sort_unstable();
        indices.dedup();

        let queue_create_infos = indices
            .iter()
            .map(|&index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let device_extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let mut features = required_device_features();
        let mut device_features2 = vk::PhysicalDeviceFeatures2::default()
            .features(features.core)
            .push_next(&mut features.vulkan_1_2)
            .push_next(&mut features.vulkan_1_3);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)
                .with_context(|| "Failed to create vulkan logical device!")?
        };

        Ok(device)
    }

    /// Attaches a `<kind>:<name>` debug name when validation is enabled.
    pub(crate) fn set_object_name<H: vk::Handle>(&self, handle: H, kind: &str, name: &str) {
        if let Some(debug_utils) = &self.debug_utils {
            let formatted = CString::new(format!("<{}>:{}", kind, name)).unwrap_or_default();
            let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(formatted.as_c_str());
            unsafe {
                let _ = debug_utils.set_debug_utils_object_name(&name_info);
            }
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::trace!("Logical device dropped");
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

/// Raw device queue handle plus the family it was created from.
#[derive(Clone, Copy)]
pub(crate) struct Queue {
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical_device(
        device_type: vk::PhysicalDeviceType,
        allocation_count: u32,
    ) -> PhysicalDevice {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.device_type = device_type;
        properties.limits.max_memory_allocation_count = allocation_count;

        PhysicalDevice {
            raw: vk::PhysicalDevice::null(),
            name: String::from("test"),
            properties,
            queue_families: Vec::new(),
        }
    }

    fn queue_family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        let mut family = vk::QueueFamilyProperties::default();
        family.queue_flags = flags;
        family.queue_count = 1;
        family
    }

    #[test]
    fn device_score_sums_limits_in_thousands() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.max_memory_allocation_count = 4096;
        limits.max_bound_descriptor_sets = 8;
        limits.max_draw_indirect_count = 1_000_000;
        limits.max_draw_indexed_index_value = u32::MAX;

        assert_eq!(device_score(&limits), 4 + 0 + 1000 + u32::MAX / 1000);
    }

    #[test]
    fn select_prefers_requested_device_type() {
        let devices = [
            physical_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4096),
            physical_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 2048),
        ];

        let selected =
            select_physical_device(&devices, vk::PhysicalDeviceType::INTEGRATED_GPU).unwrap();
        assert_eq!(selected, 1);
    }

    #[test]
    fn select_falls_back_by_priority_when_preferred_bucket_is_empty() {
        let devices = [
            physical_device(vk::PhysicalDeviceType::CPU, 1024),
            physical_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 2048),
        ];

        let selected =
            select_physical_device(&devices, vk::PhysicalDeviceType::DISCRETE_GPU).unwrap();
        assert_eq!(selected, 1);
    }

    #[test]
    fn select_ranks_within_a_bucket_by_score() {
        let devices = [
            physical_device(vk::PhysicalDeviceType::DISCRETE_GPU, 2_000),
            physical_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4_000_000),
        ];

        let selected =
            select_physical_device(&devices, vk::PhysicalDeviceType::DISCRETE_GPU).unwrap();
        assert_eq!(selected, 1);
    }

    #[test]
    fn select_returns_none_without_devices() {
        assert!(select_physical_device(&[], vk::PhysicalDeviceType::DISCRETE_GPU).is_none());
    }

    #[test]
    fn queue_families_pick_dedicated_transfer_and_compute() {
        let families = [
            queue_family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            ),
            queue_family(vk::QueueFlags::TRANSFER),
            queue_family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];

        let selection = resolve_queue_families(&families).unwrap();
        assert_eq!(
            selection,
            QueueFamilySelection {
                main: 0,
                transfer: 1,
                compute: 2,
            }
        );
    }

    #[test]
    fn queue_families_fall_back_to_main() {
        let families = [queue_family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];

        let selection = resolve_queue_families(&families).unwrap();
        assert_eq!(
            selection,
            QueueFamilySelection {
                main: 0,
                transfer: 0,
                compute: 0,
            }
        );
    }

    #[test]
    fn queue_families_require_a_main_family() {
        let families = [queue_family(vk::QueueFlags::TRANSFER)];
        assert!(resolve_queue_families(&families).is_err());
    }
}
