/*! Bindless descriptor cache.
 *
 * One mega descriptor set serves the entire device: storage images, combined
 * image samplers, sampled images and samplers live in large partially bound
 * update-after-bind arrays, and a single storage buffer holds the device
 * address of every bound buffer so shaders can fetch any buffer by slot.
 */

use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use super::{DeviceConfig, DeviceShared};

pub const STORAGE_IMAGE_BINDING: u32 = 0;
pub const COMBINED_IMAGE_SAMPLER_BINDING: u32 = 1;
pub const SAMPLED_IMAGE_BINDING: u32 = 2;
pub const SAMPLER_BINDING: u32 = 3;
pub const BUFFER_DEVICE_ADDRESS_BINDING: u32 = 4;

/// The vulkan spec requires push constant sizes to be a multiple of 4.
const PUSH_CONSTANT_SIZE_STEP: u32 = 4;

/// Rounds a push constant size up to the next power of two, clamped against
/// the device limit. Sizes at or above the limit use the limit unchanged.
pub(crate) fn rounded_push_constant_size(size: u32, max: u32) -> u32 {
    let mut num = size.min(max);
    if size < max {
        num = num.wrapping_sub(1);
        num |= num >> 1;
        num |= num >> 2;
        num |= num >> 4;
        num |= num >> 8;
        num |= num >> 16;
        num = num.wrapping_add(1);
    }
    num
}

/// Process-wide bindless descriptor state. Update-after-bind writes to
/// distinct slots are independent; guarding a slot that an in-flight shader
/// may read is the caller's responsibility.
pub(crate) struct DescriptorCache {
    pool: vk::DescriptorPool,
    pub(crate) set_layout: vk::DescriptorSetLayout,
    pub(crate) set: vk::DescriptorSet,
    pipeline_layouts: HashMap<u32, vk::PipelineLayout>,
    bda_buffer: vk::Buffer,
    bda_allocation: Option<Allocation>,
    max_images: u32,
    max_buffers: u32,
    max_samplers: u32,
    push_constant_max_size: u32,
    device: Arc<DeviceShared>,
}

impl DescriptorCache {
    pub(crate) fn new(device: Arc<DeviceShared>, config: &DeviceConfig) -> Result<Self> {
        let pool = Self::create_descriptor_pool(&device, config)?;
        let set_layout = Self::create_descriptor_set_layout(&device, config)?;

        let set = {
            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(std::slice::from_ref(&set_layout));
            unsafe {
                device
                    .raw
                    .allocate_descriptor_sets(&allocate_info)
                    .with_context(|| "Failed to allocate the bindless descriptor set!")?[0]
            }
        };

        let pipeline_layouts =
            Self::create_pipeline_layouts(&device, set_layout, config.push_constant_max_size)?;

        let (bda_buffer, bda_allocation) = Self::create_bda_buffer(&device, config)?;

        let descriptor_buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(bda_buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        let bda_write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BUFFER_DEVICE_ADDRESS_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&descriptor_buffer_info));
        unsafe {
            device
                .raw
                .update_descriptor_sets(std::slice::from_ref(&bda_write), &[]);
        }

        device.set_object_name(pool, "descriptor_pool", "application");
        device.set_object_name(set_layout, "descriptor_set_layout", "application");
        device.set_object_name(set, "descriptor_set", "application");
        device.set_object_name(bda_buffer, "buffer", "buffer_device_address_table");

        Ok(Self {
            pool,
            set_layout,
            set,
            pipeline_layouts,
            bda_buffer,
            bda_allocation: Some(bda_allocation),
            max_images: config.max_images,
            max_buffers: config.max_buffers,
            max_samplers: config.max_samplers,
            push_constant_max_size: config.push_constant_max_size,
            device,
        })
    }

    fn create_descriptor_pool(
        device: &DeviceShared,
        config: &DeviceConfig,
    ) -> Result<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(config.max_buffers + 1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(config.max_images),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(config.max_images),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(config.max_images),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(config.max_samplers),
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                    | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            )
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        unsafe {
            device
                .raw
                .create_descriptor_pool(&pool_info, None)
                .with_context(|| "Failed to create the bindless descriptor pool!")
        }
    }

    fn create_descriptor_set_layout(
        device: &DeviceShared,
        config: &DeviceConfig,
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(STORAGE_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(config.max_images)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(COMBINED_IMAGE_SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(config.max_images)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLED_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(config.max_images)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(config.max_samplers)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BUFFER_DEVICE_ADDRESS_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];

        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            5];
        let mut binding_flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_info);

        unsafe {
            device
                .raw
                .create_descriptor_set_layout(&layout_info, None)
                .with_context(|| "Failed to create the bindless descriptor set layout!")
        }
    }

    /// One pipeline layout per push constant footprint, all referencing the
    /// single bindless set layout. Sharing layouts across compatible
    /// pipelines avoids a per-pipeline layout allocation.
    fn create_pipeline_layouts(
        device: &DeviceShared,
        set_layout: vk::DescriptorSetLayout,
        push_constant_max_size: u32,
    ) -> Result<HashMap<u32, vk::PipelineLayout>> {
        let count = push_constant_max_size / PUSH_CONSTANT_SIZE_STEP + 1;
        let mut layouts = HashMap::with_capacity(count as usize);

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout));
        let layout0 = unsafe {
            device
                .raw
                .create_pipeline_layout(&layout_info, None)
                .with_context(|| "Failed to create pipeline layout!")?
        };
        layouts.insert(0, layout0);

        for i in 1..count {
            let range = vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::ALL)
                .offset(0)
                .size(i * PUSH_CONSTANT_SIZE_STEP);

            let layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(std::slice::from_ref(&set_layout))
                .push_constant_ranges(std::slice::from_ref(&range));

            let layout = unsafe {
                device
                    .raw
                    .create_pipeline_layout(&layout_info, None)
                    .with_context(|| "Failed to create pipeline layout!")?
            };
            device.set_object_name(
                layout,
                "pipeline_layout",
                &format!("push_constant_size = {} bytes", range.size),
            );
            layouts.insert(range.size, layout);
        }

        Ok(layouts)
    }

    fn create_bda_buffer(
        device: &DeviceShared,
        config: &DeviceConfig,
    ) -> Result<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(config.max_buffers as u64 * std::mem::size_of::<u64>() as u64)
            .usage(
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw;
        let requirements;
        unsafe {
            raw = device
                .raw
                .create_buffer(&buffer_info, None)
                .with_context(|| "Failed to create the buffer device address table!")?;
            requirements = device.raw.get_buffer_memory_requirements(raw);
        }

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer_device_address_table",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(raw),
        })?;

        unsafe {
            device
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok((raw, allocation))
    }

    pub(crate) fn layout_for_push_constant_size(&self, size: u32) -> Result<vk::PipelineLayout> {
        let rounded = rounded_push_constant_size(size, self.push_constant_max_size);
        self.pipeline_layouts
            .get(&rounded)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No pipeline layout for push constant size {}", size))
    }

    pub(crate) fn max_buffer_index(&self) -> u32 {
        self.max_buffers
    }

    pub(crate) fn max_image_index(&self) -> u32 {
        self.max_images
    }

    pub(crate) fn max_sampler_index(&self) -> u32 {
        self.max_samplers
    }

    /// Writes a buffer device address into slot `index` of the permanently
    /// mapped table. Distinct slots may be written from distinct threads.
    pub(crate) fn write_buffer_address(&self, index: u32, address: vk::DeviceAddress) -> Result<()> {
        if index >= self.max_buffers {
            return Err(anyhow::anyhow!(
                "Buffer bind index {} exceeds the configured maximum {}",
                index,
                self.max_buffers
            ));
        }

        let base = self
            .bda_allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or_else(|| anyhow::anyhow!("Buffer device address table is not mapped!"))?;

        unsafe {
            base.as_ptr()
                .cast::<vk::DeviceAddress>()
                .add(index as usize)
                .write(address);
        }

        Ok(())
    }

    pub(crate) fn write_image_descriptor(
        &self,
        binding: u32,
        index: u32,
        image_view: vk::ImageView,
        image_layout: vk::ImageLayout,
        sampler: Option<vk::Sampler>,
    ) -> Result<()> {
        if index >= self.max_images {
            return Err(anyhow::anyhow!(
                "Image bind index {} exceeds the configured maximum {}",
                index,
                self.max_images
            ));
        }

        let descriptor_type = match binding {
            STORAGE_IMAGE_BINDING => vk::DescriptorType::STORAGE_IMAGE,
            COMBINED_IMAGE_SAMPLER_BINDING => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            SAMPLED_IMAGE_BINDING => vk::DescriptorType::SAMPLED_IMAGE,
            _ => {
                return Err(anyhow::anyhow!(
                    "Binding {} is not an image binding of the bindless set",
                    binding
                ))
            }
        };

        let mut image_info = vk::DescriptorImageInfo::default()
            .image_view(image_view)
            .image_layout(image_layout);
        if let Some(sampler) = sampler {
            image_info = image_info.sampler(sampler);
        }

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(descriptor_type)
            .image_info(std::slice::from_ref(&image_info));

        unsafe {
            self.device
                .raw
                .update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }

        Ok(())
    }

    pub(crate) fn write_sampler_descriptor(&self, index: u32, sampler: vk::Sampler) -> Result<()> {
        if index >= self.max_samplers {
            return Err(anyhow::anyhow!(
                "Sampler bind index {} exceeds the configured maximum {}",
                index,
                self.max_samplers
            ));
        }

        let image_info = vk::DescriptorImageInfo::default().sampler(sampler);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(SAMPLER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(std::slice::from_ref(&image_info));

        unsafe {
            self.device
                .raw
                .update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }

        Ok(())
    }
}

impl Drop for DescriptorCache {
    fn drop(&mut self) {
        unsafe {
            if let Some(allocation) = self.bda_allocation.take() {
                let _ = self.device.allocator.lock().free(allocation);
            }
            self.device.raw.destroy_buffer(self.bda_buffer, None);

            for layout in self.pipeline_layouts.values() {
                self.device.raw.destroy_pipeline_layout(*layout, None);
            }
            let _ = self
                .device
                .raw
                .free_descriptor_sets(self.pool, std::slice::from_ref(&self.set));
            self.device
                .raw
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device.raw.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_push_constant_size_stays_zero() {
        assert_eq!(rounded_push_constant_size(0, 128), 0);
    }

    #[test]
    fn push_constant_sizes_round_to_the_next_power_of_two() {
        assert_eq!(rounded_push_constant_size(4, 128), 4);
        assert_eq!(rounded_push_constant_size(5, 128), 8);
        assert_eq!(rounded_push_constant_size(24, 128), 32);
        assert_eq!(rounded_push_constant_size(100, 128), 128);
    }

    #[test]
    fn push_constant_sizes_clamp_to_the_device_limit() {
        assert_eq!(rounded_push_constant_size(128, 128), 128);
        assert_eq!(rounded_push_constant_size(300, 128), 128);
    }

    #[test]
    fn push_constant_rounding_covers_non_power_of_two_limits() {
        // A limit that is not itself a power of two is still used verbatim
        // for sizes at or above it.
        assert_eq!(rounded_push_constant_size(200, 192), 192);
        assert_eq!(rounded_push_constant_size(100, 192), 128);
    }
}
