/*! Logical device context.
 *
 * Owns the three logical queues, the bindless descriptor cache, the sampler
 * and surface caches and the deferred destruction hub. Should be used and
 * passed around as `Arc<Device>`; members are internally mutable as
 * required.
 */

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

use super::{
    descriptor::DescriptorCache, resource::Sampler, swapchain::Surface, DeviceConfig,
    DeviceDescriptor, DeviceQueue, DeviceShared, Instance, Queue, Version,
    MAX_FRAMES_IN_FLIGHT_ALLOWED,
};

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub vendor_id: u32,
    pub device_id: u32,
    pub api_version: Version,
    pub driver_version: Version,
}

fn decompose_version(version: u32) -> Version {
    Version {
        variant: vk::api_version_variant(version),
        major: vk::api_version_major(version),
        minor: vk::api_version_minor(version),
        patch: vk::api_version_patch(version),
    }
}

/// Clamps user requested table sizes against the device reported limits.
fn clamp_device_config(config: DeviceConfig, limits: &vk::PhysicalDeviceLimits) -> DeviceConfig {
    DeviceConfig {
        max_frames_in_flight: config.max_frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT_ALLOWED),
        swapchain_image_count: config.swapchain_image_count,
        max_images: config.max_images.min(
            limits
                .max_descriptor_set_sampled_images
                .min(limits.max_descriptor_set_storage_images),
        ),
        max_buffers: config.max_buffers.min(limits.max_descriptor_set_storage_buffers),
        max_samplers: config.max_samplers.min(limits.max_descriptor_set_samplers),
        push_constant_max_size: config
            .push_constant_max_size
            .min(limits.max_push_constants_size),
    }
}

/// FIFO of deferred work gated on a monotonically increasing timeline.
/// Entries are pushed with the timeline value current at scheduling time
/// and released once the GPU observed value passes it.
pub(crate) struct DeferredQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> DeferredQueue<T> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, timeline: u64, payload: T) {
        self.entries.push_back((timeline, payload));
    }

    pub(crate) fn drain_completed(&mut self, completed: u64, mut release: impl FnMut(T)) {
        while let Some((timeline, _)) = self.entries.front() {
            if *timeline > completed {
                break;
            }
            let (_, payload) = self.entries.pop_front().unwrap();
            release(payload);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct PendingDestructionBuffer {
    raw: vk::Buffer,
    allocation: Option<Allocation>,
}

pub(crate) struct PendingDestructionImage {
    raw: vk::Image,
    raw_view: vk::ImageView,
    allocation: Option<Allocation>,
}

pub(crate) struct PendingDestructionSwapchain {
    pub(crate) loader: ash::khr::swapchain::Device,
    pub(crate) raw: vk::SwapchainKHR,
    pub(crate) image_views: Vec<vk::ImageView>,
    /// Keeps the surface alive until the retired swapchain is destroyed.
    pub(crate) surface: Option<Arc<Surface>>,
}

/// Deferred destruction state. Resources whose last reference dropped stay
/// here, slot intact, until the frame that could reference them has elapsed
/// on the GPU.
pub(crate) struct ResourceHub {
    buffers: DeferredQueue<PendingDestructionBuffer>,
    images: DeferredQueue<PendingDestructionImage>,
    samplers: DeferredQueue<vk::Sampler>,
    shaders: DeferredQueue<vk::ShaderModule>,
    pipelines: DeferredQueue<vk::Pipeline>,
    semaphores: DeferredQueue<vk::Semaphore>,
    events: DeferredQueue<vk::Event>,
    memory_blocks: DeferredQueue<Allocation>,
    command_pools: DeferredQueue<vk::CommandPool>,
    swapchains: DeferredQueue<PendingDestructionSwapchain>,
}

impl ResourceHub {
    fn new() -> Self {
        Self {
            buffers: DeferredQueue::new(),
            images: DeferredQueue::new(),
            samplers: DeferredQueue::new(),
            shaders: DeferredQueue::new(),
            pipelines: DeferredQueue::new(),
            semaphores: DeferredQueue::new(),
            events: DeferredQueue::new(),
            memory_blocks: DeferredQueue::new(),
            command_pools: DeferredQueue::new(),
            swapchains: DeferredQueue::new(),
        }
    }

    fn pending_count(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.shaders.len()
            + self.pipelines.len()
            + self.semaphores.len()
            + self.events.len()
            + self.memory_blocks.len()
            + self.command_pools.len()
            + self.swapchains.len()
    }
}

pub struct Device {
    pub(crate) resource_hub: Mutex<ResourceHub>,
    pub(crate) sampler_cache: Mutex<HashMap<u64, Weak<Sampler>>>,
    pub(crate) surface_cache: Mutex<HashMap<u64, Arc<Surface>>>,
    pub(crate) descriptor_cache: DescriptorCache,

    /// Timeline semaphore advanced once per frame by the main queue
    /// submission path; deferred destruction is gated on it.
    frame_timeline: vk::Semaphore,
    cpu_frame: AtomicU64,

    queue_main: Queue,
    queue_transfer: Queue,
    queue_compute: Queue,

    config: DeviceConfig,
    info: DeviceInfo,

    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(desc: &DeviceDescriptor, display_handle: RawDisplayHandle) -> Result<Arc<Self>> {
        let instance = Instance::new(desc, display_handle)?;
        let shared = Arc::new(DeviceShared::new(desc, instance)?);

        let properties = &shared.physical_device.properties;
        let config = clamp_device_config(desc.config, &properties.limits);

        let info = DeviceInfo {
            name: shared.physical_device.name.clone(),
            device_type: properties.device_type,
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            api_version: decompose_version(properties.api_version),
            driver_version: decompose_version(properties.driver_version),
        };

        let families = shared.queue_families;
        let make_queue = |family_index: u32| {
            let raw = unsafe { shared.raw.get_device_queue(family_index, 0) };
            Queue { raw, family_index }
        };
        let queue_main = make_queue(families.main);
        let queue_transfer = make_queue(families.transfer);
        let queue_compute = make_queue(families.compute);

        let descriptor_cache = DescriptorCache::new(shared.clone(), &config)
            .with_context(|| "Failed to initialize the bindless descriptor cache!")?;

        let frame_timeline = {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
            unsafe {
                shared
                    .raw
                    .create_semaphore(&semaphore_info, None)
                    .with_context(|| "Failed to create the frame timeline semaphore!")?
            }
        };
        shared.set_object_name(frame_timeline, "fence", "frame_timeline");

        log::info!(
            "Device initialized: {} (driver {}.{}.{})",
            info.name,
            info.driver_version.major,
            info.driver_version.minor,
            info.driver_version.patch
        );

        Ok(Arc::new(Self {
            resource_hub: Mutex::new(ResourceHub::new()),
            sampler_cache: Mutex::new(HashMap::new()),
            surface_cache: Mutex::new(HashMap::new()),
            descriptor_cache,
            frame_timeline,
            cpu_frame: AtomicU64::new(0),
            queue_main,
            queue_transfer,
            queue_compute,
            config,
            info,
            shared,
        }))
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn queue(&self, queue: DeviceQueue) -> &Queue {
        match queue {
            DeviceQueue::Main => &self.queue_main,
            DeviceQueue::Transfer => &self.queue_transfer,
            DeviceQueue::Compute => &self.queue_compute,
        }
    }

    pub fn queue_family_index(&self, queue: DeviceQueue) -> u32 {
        self.queue(queue).family_index
    }

    /// CPU side frame counter; incremented once per sent frame.
    pub fn cpu_frame(&self) -> u64 {
        self.cpu_frame.load(Ordering::Acquire)
    }

    /// Frame counter value the GPU has fully executed.
    pub fn gpu_frame(&self) -> Result<u64> {
        let value = unsafe {
            self.shared
                .raw
                .get_semaphore_counter_value(self.frame_timeline)?
        };
        Ok(value)
    }

    pub(crate) fn advance_cpu_frame(&self) -> u64 {
        self.cpu_frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn frame_timeline_semaphore(&self) -> vk::Semaphore {
        self.frame_timeline
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.shared.raw.device_wait_idle()?;
        }
        Ok(())
    }

    /// Destroys every resource whose frame has elapsed on the GPU. Should
    /// be called once per frame; resources scheduled in frame F survive at
    /// least until the GPU finished frame F.
    pub fn clear_garbage(&self) -> Result<()> {
        let completed = self.gpu_frame()?;
        self.collect_garbage(completed);
        Ok(())
    }

    fn collect_garbage(&self, completed: u64) {
        let mut hub = self.resource_hub.lock();
        let device = &self.shared.raw;
        let allocator = &self.shared.allocator;

        hub.buffers.drain_completed(completed, |buffer| unsafe {
            device.destroy_buffer(buffer.raw, None);
            if let Some(allocation) = buffer.allocation {
                let _ = allocator.lock().free(allocation);
            }
        });
        hub.images.drain_completed(completed, |image| unsafe {
            device.destroy_image_view(image.raw_view, None);
            device.destroy_image(image.raw, None);
            if let Some(allocation) = image.allocation {
                let _ = allocator.lock().free(allocation);
            }
        });
        hub.samplers.drain_completed(completed, |sampler| unsafe {
            device.destroy_sampler(sampler, None);
        });
        hub.shaders.drain_completed(completed, |shader| unsafe {
            device.destroy_shader_module(shader, None);
        });
        hub.pipelines.drain_completed(completed, |pipeline| unsafe {
            device.destroy_pipeline(pipeline, None);
        });
        hub.semaphores.drain_completed(completed, |semaphore| unsafe {
            device.destroy_semaphore(semaphore, None);
        });
        hub.events.drain_completed(completed, |event| unsafe {
            device.destroy_event(event, None);
        });
        hub.memory_blocks.drain_completed(completed, |allocation| {
            let _ = allocator.lock().free(allocation);
        });
        hub.command_pools.drain_completed(completed, |pool| unsafe {
            device.destroy_command_pool(pool, None);
        });
        hub.swapchains.drain_completed(completed, |swapchain| unsafe {
            for image_view in swapchain.image_views {
                device.destroy_image_view(image_view, None);
            }
            swapchain.loader.destroy_swapchain(swapchain.raw, None);
            // The surface reference drops here and is released once the
            // cache entry is the only remaining owner.
        });
    }

    /// Commands for the frame being recorded sign off at `cpu_frame + 1`;
    /// anything released now may still be referenced by that frame.
    fn destruction_timeline(&self) -> u64 {
        self.cpu_frame() + 1
    }

    pub(crate) fn schedule_destruction_buffer(
        &self,
        raw: vk::Buffer,
        allocation: Option<Allocation>,
    ) {
        let timeline = self.destruction_timeline();
        self.resource_hub
            .lock()
            .buffers
            .push(timeline, PendingDestructionBuffer { raw, allocation });
    }

    pub(crate) fn schedule_destruction_image(
        &self,
        raw: vk::Image,
        raw_view: vk::ImageView,
        allocation: Option<Allocation>,
    ) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().images.push(
            timeline,
            PendingDestructionImage {
                raw,
                raw_view,
                allocation,
            },
        );
    }

    pub(crate) fn schedule_destruction_sampler(&self, raw: vk::Sampler) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().samplers.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_shader(&self, raw: vk::ShaderModule) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().shaders.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_pipeline(&self, raw: vk::Pipeline) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().pipelines.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_semaphore(&self, raw: vk::Semaphore) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().semaphores.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_event(&self, raw: vk::Event) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().events.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_memory_block(&self, allocation: Allocation) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().memory_blocks.push(timeline, allocation);
    }

    pub(crate) fn schedule_destruction_command_pool(&self, raw: vk::CommandPool) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().command_pools.push(timeline, raw);
    }

    pub(crate) fn schedule_destruction_swapchain(&self, pending: PendingDestructionSwapchain) {
        let timeline = self.destruction_timeline();
        self.resource_hub.lock().swapchains.push(timeline, pending);
    }

    /// Removes a dead sampler cache entry. A new sampler may already have
    /// taken the key; live entries are left untouched.
    pub(crate) fn forget_cached_sampler(&self, packed_key: u64) {
        let mut cache = self.sampler_cache.lock();
        if let Some(weak) = cache.get(&packed_key) {
            if weak.strong_count() == 0 {
                cache.remove(&packed_key);
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            log::error!("Device wait idle failed during teardown: {}", error);
        }

        let pending = self.resource_hub.lock().pending_count();
        if pending > 0 {
            log::debug!("Releasing {} deferred resources on device teardown", pending);
        }
        self.collect_garbage(u64::MAX);

        unsafe {
            self.shared.raw.destroy_semaphore(self.frame_timeline, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_queue_releases_in_fifo_order() {
        let mut queue = DeferredQueue::new();
        queue.push(1, "first");
        queue.push(1, "second");
        queue.push(2, "third");

        let mut released = Vec::new();
        queue.drain_completed(2, |payload| released.push(payload));
        assert_eq!(released, ["first", "second", "third"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn deferred_queue_holds_entries_past_the_completed_value() {
        let mut queue = DeferredQueue::new();
        queue.push(3, 30u32);
        queue.push(5, 50u32);

        let mut released = Vec::new();
        queue.drain_completed(4, |payload| released.push(payload));
        assert_eq!(released, [30]);
        assert_eq!(queue.len(), 1);

        queue.drain_completed(5, |payload| released.push(payload));
        assert_eq!(released, [30, 50]);
    }

    #[test]
    fn deferred_queue_is_a_no_op_when_nothing_completed() {
        let mut queue = DeferredQueue::new();
        queue.push(10, ());

        let mut count = 0;
        queue.drain_completed(9, |_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn config_clamps_against_device_limits() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.max_descriptor_set_sampled_images = 500;
        limits.max_descriptor_set_storage_images = 400;
        limits.max_descriptor_set_storage_buffers = 600;
        limits.max_descriptor_set_samplers = 64;
        limits.max_push_constants_size = 128;

        let config = clamp_device_config(
            DeviceConfig {
                max_frames_in_flight: 9,
                swapchain_image_count: 3,
                max_images: 1024,
                max_buffers: 1024,
                max_samplers: 128,
                push_constant_max_size: 256,
            },
            &limits,
        );

        assert_eq!(config.max_frames_in_flight, MAX_FRAMES_IN_FLIGHT_ALLOWED);
        assert_eq!(config.max_images, 400);
        assert_eq!(config.max_buffers, 600);
        assert_eq!(config.max_samplers, 64);
        assert_eq!(config.push_constant_max_size, 128);
    }

    #[test]
    fn config_keeps_values_within_limits_untouched() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.max_descriptor_set_sampled_images = 4096;
        limits.max_descriptor_set_storage_images = 4096;
        limits.max_descriptor_set_storage_buffers = 4096;
        limits.max_descriptor_set_samplers = 4096;
        limits.max_push_constants_size = 256;

        let config = clamp_device_config(DeviceConfig::default(), &limits);
        let default = DeviceConfig::default();
        assert_eq!(config.max_images, default.max_images);
        assert_eq!(config.max_buffers, default.max_buffers);
        assert_eq!(config.max_samplers, default.max_samplers);
        assert_eq!(config.push_constant_max_size, default.push_constant_max_size);
    }
}
