/*! Device resource objects.
 *
 * Buffers, images, samplers and raw memory blocks. Every object holds a
 * reference to the owning [`Device`] and schedules itself on the deferred
 * destruction hub when the last reference drops; the actual vulkan destroy
 * happens in `Device::clear_garbage` once the GPU has moved past the frame
 * that could still reference it.
 */

use std::{
    mem::{align_of, size_of_val},
    ptr::NonNull,
    sync::Arc,
};

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use parking_lot::Mutex;

use super::{
    descriptor::{COMBINED_IMAGE_SAMPLER_BINDING, SAMPLED_IMAGE_BINDING, STORAGE_IMAGE_BINDING},
    device::Device,
    DeviceQueue,
};

pub struct BufferDescriptor {
    pub name: String,
    pub size: u64,
    pub usage_flags: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
    pub dedicated: bool,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage_flags: vk::BufferUsageFlags, memory_location: MemoryLocation) -> Self {
        Self {
            name: String::new(),
            size,
            usage_flags,
            memory_location,
            dedicated: false,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    pub fn dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }
}

/// Slot assignment into the buffer device address table. Slots are chosen
/// by the caller; the device only validates the configured maximum.
pub struct BufferBindDescriptor {
    pub offset: u64,
    pub index: u32,
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    size: u64,
    usage_flags: vk::BufferUsageFlags,
    address: vk::DeviceAddress,
    allocation: Option<Allocation>,
    /// Present when the buffer aliases an externally owned memory block.
    memory_block: Option<Arc<MemoryBlock>>,
    pub(crate) owner_queue: Mutex<DeviceQueue>,
    device: Arc<Device>,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage_flags
    }

    /// Stable for the lifetime of the buffer; never zero on a successfully
    /// created buffer.
    pub fn gpu_address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn is_host_visible(&self) -> bool {
        self.mapped_ptr().is_some()
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<std::ffi::c_void>> {
        match (&self.allocation, &self.memory_block) {
            (Some(allocation), _) => allocation.mapped_ptr(),
            (None, Some(block)) => block.mapped_ptr(),
            (None, None) => None,
        }
    }

    /// Writes to a host visible buffer. Returns an error when the buffer
    /// has no host mapping.
    pub fn write_data<T: Copy>(&self, data: &[T]) -> Result<()> {
        self.write_data_at_offset(data, 0)
    }

    pub fn write_data_at_offset<T: Copy>(&self, data: &[T], byte_offset: usize) -> Result<()> {
        let base = self
            .mapped_ptr()
            .ok_or_else(|| anyhow::anyhow!("Buffer is not host visible!"))?;

        unsafe {
            let data_ptr = base.as_ptr().add(byte_offset);
            let mut align =
                ash::util::Align::new(data_ptr, align_of::<T>() as _, size_of_val(data) as _);
            align.copy_from_slice(data);
        }

        Ok(())
    }

    /// Zeroes the host mapping of a host visible buffer.
    pub fn clear(&self) -> Result<()> {
        let base = self
            .mapped_ptr()
            .ok_or_else(|| anyhow::anyhow!("Buffer is not host visible!"))?;
        unsafe {
            std::ptr::write_bytes(base.as_ptr().cast::<u8>(), 0, self.size as usize);
        }
        Ok(())
    }

    /// Publishes the buffer's device address into the bindless table.
    pub fn bind(&self, bind: BufferBindDescriptor) -> Result<()> {
        self.device
            .descriptor_cache
            .write_buffer_address(bind.index, self.address + bind.offset)
    }

    /// Queue family that currently owns the buffer for exclusive sharing.
    pub fn owner_queue(&self) -> DeviceQueue {
        *self.owner_queue.lock()
    }

    pub(crate) fn set_owner_queue(&self, queue: DeviceQueue) {
        *self.owner_queue.lock() = queue;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let allocation = self.allocation.take();
        self.device.schedule_destruction_buffer(self.raw, allocation);
    }
}

pub struct MemoryBlockDescriptor {
    pub name: String,
    pub requirements: vk::MemoryRequirements,
    pub memory_location: MemoryLocation,
    pub linear: bool,
}

/// A raw device memory allocation that buffers and images can be created
/// from to alias the same storage. The block owns nothing but the memory.
pub struct MemoryBlock {
    allocation: Option<Allocation>,
    device: Arc<Device>,
}

impl MemoryBlock {
    pub fn size(&self) -> u64 {
        self.allocation
            .as_ref()
            .map(|allocation| allocation.size())
            .unwrap_or(0)
    }

    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<std::ffi::c_void>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
    }

    pub(crate) fn allocation(&self) -> &Allocation {
        self.allocation.as_ref().expect("Memory block without backing allocation")
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.schedule_destruction_memory_block(allocation);
        }
    }
}

pub struct ImageDescriptor {
    pub name: String,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_level_count: u32,
    pub array_layer_count: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage_flags: vk::ImageUsageFlags,
    pub memory_location: MemoryLocation,
    pub clear_value: vk::ClearValue,
}

impl ImageDescriptor {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            name: String::new(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_level_count: 1,
            array_layer_count: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage_flags: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            memory_location: MemoryLocation::GpuOnly,
            clear_value: vk::ClearValue::default(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    pub fn usage_flags(mut self, usage_flags: vk::ImageUsageFlags) -> Self {
        self.usage_flags = usage_flags;
        self
    }

    pub fn mip_level_count(mut self, mip_level_count: u32) -> Self {
        self.mip_level_count = mip_level_count;
        self
    }
}

pub struct ImageBindDescriptor<'a> {
    pub sampler: Option<&'a Arc<Sampler>>,
    pub index: u32,
}

pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) raw_view: vk::ImageView,
    pub format: vk::Format,
    pub(crate) extent: vk::Extent3D,
    usage_flags: vk::ImageUsageFlags,
    mip_level_count: u32,
    array_layer_count: u32,
    clear_value: vk::ClearValue,
    allocation: Option<Allocation>,
    memory_block: Option<Arc<MemoryBlock>>,
    swapchain_image: bool,
    pub(crate) owner_queue: Mutex<DeviceQueue>,
    device: Arc<Device>,
}

impl Image {
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn usage_flags(&self) -> vk::ImageUsageFlags {
        self.usage_flags
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn clear_value(&self) -> vk::ClearValue {
        self.clear_value
    }

    /// Swapchain images are co-owned by their swapchain and are never
    /// destroyed through the deferred destruction path.
    pub fn is_swapchain_image(&self) -> bool {
        self.swapchain_image
    }

    pub fn aspect_flags(&self) -> vk::ImageAspectFlags {
        let mut aspect_flags = vk::ImageAspectFlags::empty();
        if format_has_depth(self.format) {
            aspect_flags |= vk::ImageAspectFlags::DEPTH;
            if format_has_stencil(self.format) {
                aspect_flags |= vk::ImageAspectFlags::STENCIL;
            }
        } else {
            aspect_flags |= vk::ImageAspectFlags::COLOR;
        }
        aspect_flags
    }

    pub fn full_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect_flags())
            .base_mip_level(0)
            .level_count(self.mip_level_count)
            .base_array_layer(0)
            .layer_count(self.array_layer_count)
    }

    pub fn full_subresource_layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(self.aspect_flags())
            .mip_level(mip_level)
            .base_array_layer(0)
            .layer_count(self.array_layer_count)
    }

    /// Publishes the image view into the bindless arrays matching its usage:
    /// storage images land in the storage binding, sampled images in the
    /// sampled binding and, when a sampler is supplied, the combined binding.
    pub fn bind(&self, bind: ImageBindDescriptor) -> Result<()> {
        let cache = &self.device.descriptor_cache;

        if self.usage_flags.contains(vk::ImageUsageFlags::STORAGE) {
            cache.write_image_descriptor(
                STORAGE_IMAGE_BINDING,
                bind.index,
                self.raw_view,
                vk::ImageLayout::GENERAL,
                None,
            )?;
        }
        if self.usage_flags.contains(vk::ImageUsageFlags::SAMPLED) {
            cache.write_image_descriptor(
                SAMPLED_IMAGE_BINDING,
                bind.index,
                self.raw_view,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                None,
            )?;
            if let Some(sampler) = bind.sampler {
                cache.write_image_descriptor(
                    COMBINED_IMAGE_SAMPLER_BINDING,
                    bind.index,
                    self.raw_view,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    Some(sampler.raw),
                )?;
            }
        }

        Ok(())
    }

    /// Queue family that currently owns the image for exclusive sharing.
    pub fn owner_queue(&self) -> DeviceQueue {
        *self.owner_queue.lock()
    }

    pub(crate) fn set_owner_queue(&self, queue: DeviceQueue) {
        *self.owner_queue.lock() = queue;
    }

    /// Wraps a swapchain owned image. The swapchain destroys the view and
    /// the image together with the vulkan swapchain handle.
    pub(crate) fn from_swapchain_handle(
        device: Arc<Device>,
        raw: vk::Image,
        raw_view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            raw,
            raw_view,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            mip_level_count: 1,
            array_layer_count: 1,
            clear_value: vk::ClearValue::default(),
            allocation: None,
            memory_block: None,
            swapchain_image: true,
            owner_queue: Mutex::new(DeviceQueue::Main),
            device,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.swapchain_image {
            return;
        }
        let allocation = self.allocation.take();
        self.device
            .schedule_destruction_image(self.raw, self.raw_view, allocation);
    }
}

fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D16_UNORM
    )
}

fn format_has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
    )
}

fn image_view_type(image_type: vk::ImageType, array_layer_count: u32) -> vk::ImageViewType {
    match (image_type, array_layer_count) {
        (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
        (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
        (vk::ImageType::TYPE_2D, 1) => vk::ImageViewType::TYPE_2D,
        (vk::ImageType::TYPE_2D, _) => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_3D,
    }
}

#[derive(Clone, Copy)]
pub struct SamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: f32,
    pub compare_op: vk::CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: 0.0,
            compare_op: vk::CompareOp::NEVER,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

/// Quantises a sampler descriptor into the 64-bit content key used by the
/// sampler cache. The bit layout is part of the persisted pipeline cache
/// format and must stay stable.
pub(crate) fn sampler_descriptor_packed(desc: &SamplerDescriptor) -> u64 {
    let minf = desc.min_filter.as_raw() as u64;
    let magf = desc.mag_filter.as_raw() as u64;
    let mipm = desc.mipmap_mode.as_raw() as u64;
    let admu = desc.address_mode_u.as_raw() as u64;
    let admv = desc.address_mode_v.as_raw() as u64;
    let admw = desc.address_mode_w.as_raw() as u64;
    let cmpe = (desc.compare_op != vk::CompareOp::NEVER) as u64;
    let anie = (desc.max_anisotropy > 0.0) as u64;
    let cmpo = desc.compare_op.as_raw() as u64;
    let bcol = desc.border_color.as_raw() as u64;
    let cord = desc.unnormalized_coordinates as u64;

    let mplb = desc.mip_lod_bias as u64;
    let maxa = desc.max_anisotropy as u64;
    let minl = desc.min_lod as u64;
    let maxl = desc.max_lod as u64;

    let mut packed = 0u64;
    packed |= minf & 0xF;
    packed |= (magf & 0xF) << 4;
    packed |= (mipm & 0xF) << 8;
    packed |= (bcol & 0xF) << 12;
    packed |= (admu & 0xF) << 16;
    packed |= (admv & 0xF) << 20;
    packed |= (admw & 0xF) << 24;
    packed |= (cmpo & 0xF) << 28;
    packed |= (mplb & 0xF) << 32;
    packed |= (maxa & 0xF) << 36;
    packed |= (minl & 0xF) << 40;
    packed |= (maxl & 0xF) << 44;
    packed |= anie << 61;
    packed |= cmpe << 62;
    packed |= cord << 63;

    packed
}

pub struct SamplerBindDescriptor {
    pub index: u32,
}

/// Content addressed sampler. Creating a sampler with a descriptor that
/// packs to the same key returns the cached object.
pub struct Sampler {
    pub(crate) raw: vk::Sampler,
    packed_key: u64,
    device: Arc<Device>,
}

impl Sampler {
    pub fn packed_key(&self) -> u64 {
        self.packed_key
    }

    /// Publishes the sampler into the bindless sampler array.
    pub fn bind(&self, bind: SamplerBindDescriptor) -> Result<()> {
        self.device
            .descriptor_cache
            .write_sampler_descriptor(bind.index, self.raw)
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.forget_cached_sampler(self.packed_key);
        self.device.schedule_destruction_sampler(self.raw);
    }
}

impl Device {
    pub fn create_buffer(self: &Arc<Self>, desc: BufferDescriptor) -> Result<Arc<Buffer>> {
        self.create_buffer_internal(desc, None)
    }

    /// Creates a buffer aliasing an existing memory block.
    pub fn create_buffer_with_memory(
        self: &Arc<Self>,
        desc: BufferDescriptor,
        memory_block: Arc<MemoryBlock>,
    ) -> Result<Arc<Buffer>> {
        self.create_buffer_internal(desc, Some(memory_block))
    }

    fn create_buffer_internal(
        self: &Arc<Self>,
        desc: BufferDescriptor,
        memory_block: Option<Arc<MemoryBlock>>,
    ) -> Result<Arc<Buffer>> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(
                desc.usage_flags
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw;
        let requirements;
        unsafe {
            raw = self
                .shared
                .raw
                .create_buffer(&create_info, None)
                .with_context(|| "Failed to create buffer!")?;
            requirements = self.shared.raw.get_buffer_memory_requirements(raw);
        }

        let allocation = if memory_block.is_none() {
            let allocation_scheme = if desc.dedicated {
                AllocationScheme::DedicatedBuffer(raw)
            } else {
                AllocationScheme::GpuAllocatorManaged
            };
            Some(
                self.shared
                    .allocator
                    .lock()
                    .allocate(&AllocationCreateDesc {
                        name: &desc.name,
                        requirements,
                        location: desc.memory_location,
                        linear: true,
                        allocation_scheme,
                    })?,
            )
        } else {
            None
        };

        unsafe {
            let backing = match (&allocation, &memory_block) {
                (Some(allocation), _) => allocation,
                (None, Some(block)) => block.allocation(),
                (None, None) => unreachable!(),
            };
            self.shared
                .raw
                .bind_buffer_memory(raw, backing.memory(), backing.offset())?;
        }

        let address = unsafe {
            self.shared.raw.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::default().buffer(raw),
            )
        };

        self.shared.set_object_name(raw, "buffer", &desc.name);

        Ok(Arc::new(Buffer {
            raw,
            size: desc.size,
            usage_flags: desc.usage_flags,
            address,
            allocation,
            memory_block,
            owner_queue: Mutex::new(DeviceQueue::Main),
            device: self.clone(),
        }))
    }

    pub fn allocate_memory_block(
        self: &Arc<Self>,
        desc: MemoryBlockDescriptor,
    ) -> Result<Arc<MemoryBlock>> {
        let allocation = self
            .shared
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: &desc.name,
                requirements: desc.requirements,
                location: desc.memory_location,
                linear: desc.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        Ok(Arc::new(MemoryBlock {
            allocation: Some(allocation),
            device: self.clone(),
        }))
    }

    pub fn buffer_memory_requirement(
        self: &Arc<Self>,
        desc: &BufferDescriptor,
    ) -> Result<vk::MemoryRequirements> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(
                desc.usage_flags
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let raw = self.shared.raw.create_buffer(&create_info, None)?;
            let requirements = self.shared.raw.get_buffer_memory_requirements(raw);
            self.shared.raw.destroy_buffer(raw, None);
            Ok(requirements)
        }
    }

    pub fn create_image(self: &Arc<Self>, desc: ImageDescriptor) -> Result<Arc<Image>> {
        self.create_image_internal(desc, None)
    }

    pub fn create_image_with_memory(
        self: &Arc<Self>,
        desc: ImageDescriptor,
        memory_block: Arc<MemoryBlock>,
    ) -> Result<Arc<Image>> {
        self.create_image_internal(desc, Some(memory_block))
    }

    fn create_image_internal(
        self: &Arc<Self>,
        desc: ImageDescriptor,
        memory_block: Option<Arc<MemoryBlock>>,
    ) -> Result<Arc<Image>> {
        let usage_flags = desc.usage_flags
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_level_count)
            .array_layers(desc.array_layer_count)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe {
            self.shared
                .raw
                .create_image(&create_info, None)
                .with_context(|| "Failed to create image!")?
        };
        let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };

        let allocation = if memory_block.is_none() {
            Some(
                self.shared
                    .allocator
                    .lock()
                    .allocate(&AllocationCreateDesc {
                        name: &desc.name,
                        requirements,
                        location: desc.memory_location,
                        linear: desc.tiling == vk::ImageTiling::LINEAR,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })?,
            )
        } else {
            None
        };

        unsafe {
            let backing = match (&allocation, &memory_block) {
                (Some(allocation), _) => allocation,
                (None, Some(block)) => block.allocation(),
                (None, None) => unreachable!(),
            };
            self.shared
                .raw
                .bind_image_memory(raw, backing.memory(), backing.offset())?;
        }

        let mut aspect_flags = vk::ImageAspectFlags::empty();
        if format_has_depth(desc.format) {
            aspect_flags |= vk::ImageAspectFlags::DEPTH;
        } else {
            aspect_flags |= vk::ImageAspectFlags::COLOR;
        }
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_flags)
            .base_mip_level(0)
            .level_count(desc.mip_level_count)
            .base_array_layer(0)
            .layer_count(desc.array_layer_count);
        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(image_view_type(desc.image_type, desc.array_layer_count))
            .format(desc.format)
            .subresource_range(subresource_range);
        let raw_view = unsafe {
            self.shared
                .raw
                .create_image_view(&view_create_info, None)
                .with_context(|| "Failed to create image view!")?
        };

        self.shared.set_object_name(raw, "image", &desc.name);

        Ok(Arc::new(Image {
            raw,
            raw_view,
            format: desc.format,
            extent: desc.extent,
            usage_flags,
            mip_level_count: desc.mip_level_count,
            array_layer_count: desc.array_layer_count,
            clear_value: desc.clear_value,
            allocation,
            memory_block,
            swapchain_image: false,
            owner_queue: Mutex::new(DeviceQueue::Main),
            device: self.clone(),
        }))
    }

    pub fn image_memory_requirement(
        self: &Arc<Self>,
        desc: &ImageDescriptor,
    ) -> Result<vk::MemoryRequirements> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_level_count)
            .array_layers(desc.array_layer_count)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(
                desc.usage_flags
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe {
            let raw = self.shared.raw.create_image(&create_info, None)?;
            let requirements = self.shared.raw.get_image_memory_requirements(raw);
            self.shared.raw.destroy_image(raw, None);
            Ok(requirements)
        }
    }

    /// Creates or returns a cached sampler. Descriptors packing to the same
    /// 64-bit key share one underlying vulkan sampler.
    pub fn create_sampler(self: &Arc<Self>, desc: SamplerDescriptor) -> Result<Arc<Sampler>> {
        let packed_key = sampler_descriptor_packed(&desc);

        let mut cache = self.sampler_cache.lock();
        if let Some(existing) = cache.get(&packed_key).and_then(|weak| weak.upgrade()) {
            return Ok(existing);
        }

        let anisotropy_enable = desc.max_anisotropy > 0.0;
        let compare_enable = desc.compare_op != vk::CompareOp::NEVER;
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(anisotropy_enable)
            .max_anisotropy(desc.max_anisotropy)
            .compare_enable(compare_enable)
            .compare_op(desc.compare_op)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates);

        let raw = unsafe {
            self.shared
                .raw
                .create_sampler(&create_info, None)
                .with_context(|| "Failed to create sampler!")?
        };

        let sampler = Arc::new(Sampler {
            raw,
            packed_key,
            device: self.clone(),
        });
        cache.insert(packed_key, Arc::downgrade(&sampler));

        Ok(sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sampler_descriptors_pack_to_the_same_key() {
        let a = SamplerDescriptor::default();
        let b = SamplerDescriptor::default();
        assert_eq!(sampler_descriptor_packed(&a), sampler_descriptor_packed(&b));
    }

    #[test]
    fn min_filter_lands_in_the_low_nibble() {
        let nearest = SamplerDescriptor {
            min_filter: vk::Filter::NEAREST,
            ..Default::default()
        };
        let linear = SamplerDescriptor {
            min_filter: vk::Filter::LINEAR,
            ..Default::default()
        };

        let nearest_key = sampler_descriptor_packed(&nearest);
        let linear_key = sampler_descriptor_packed(&linear);
        assert_ne!(nearest_key, linear_key);
        assert_eq!(nearest_key & 0xF, 0);
        assert_eq!(linear_key & 0xF, 1);
    }

    #[test]
    fn comparison_and_unnormalized_flags_set_the_top_bits() {
        let compare = SamplerDescriptor {
            compare_op: vk::CompareOp::LESS,
            ..Default::default()
        };
        let unnormalized = SamplerDescriptor {
            unnormalized_coordinates: true,
            ..Default::default()
        };

        assert_ne!(
            sampler_descriptor_packed(&compare) & 0x4000_0000_0000_0000,
            0
        );
        assert_ne!(
            sampler_descriptor_packed(&unnormalized) & 0x8000_0000_0000_0000,
            0
        );
    }

    #[test]
    fn lod_values_are_quantised_into_the_key() {
        let low = SamplerDescriptor {
            max_lod: 4.0,
            ..Default::default()
        };
        let high = SamplerDescriptor {
            max_lod: 8.0,
            ..Default::default()
        };
        assert_ne!(
            sampler_descriptor_packed(&low),
            sampler_descriptor_packed(&high)
        );
    }

    #[test]
    fn depth_formats_resolve_depth_aspects() {
        assert!(format_has_depth(vk::Format::D32_SFLOAT));
        assert!(!format_has_stencil(vk::Format::D32_SFLOAT));
        assert!(format_has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!format_has_depth(vk::Format::R8G8B8A8_UNORM));
    }
}
