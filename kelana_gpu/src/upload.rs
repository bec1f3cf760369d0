/*! Upload heap.
 *
 * Populates device local buffers and images through a ring of host visible
 * staging pools on the transfer queue. Each pool is bounded so in-flight
 * uploads never exceed a conservative BAR budget; advancing onto a pool
 * whose previous batch is still on the GPU blocks until it completes.
 *
 * Resources destined for another queue get a queue family release barrier
 * on the transfer side and a matching acquire command buffer recorded on
 * the destination queue, waiting on the upload timeline.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use super::{
    command::{Access, BufferBarrierDescriptor, ImageBarrierDescriptor},
    device::Device,
    queue::CommandQueue,
    resource::{Buffer, BufferDescriptor, Image},
    sync::Fence,
    DeviceQueue,
};
use gpu_allocator::MemoryLocation;

pub const HEAP_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_UPLOAD_HEAP_PER_POOL: usize = 8;
pub const HEAP_POOL_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Default BAR size is 256 MiB; four pools of 64 MiB keep the staging
/// working set inside it.
const MAX_POOL_IN_QUEUE: usize = 4;
const MAX_UPLOADS_PER_POOL: usize = 64;

/// Monotonic upload ticket. An upload's id is the upload timeline value its
/// batch signals, so completion is a single counter comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UploadId(pub u64);

/// Fence/value pair the caller waits on for a flushed upload batch.
pub struct FenceSignal {
    pub fence: Arc<Fence>,
    pub value: u64,
}

/// A host visible, persistently mapped staging slice.
pub struct HeapBlock {
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) byte_offset: u64,
}

impl HeapBlock {
    pub fn remaining_capacity(&self) -> u64 {
        HEAP_BLOCK_SIZE - self.byte_offset
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// Appends bytes to the block and returns the offset they landed at.
    pub fn write(&mut self, data: &[u8]) -> Result<u64> {
        if data.len() as u64 > self.remaining_capacity() {
            return Err(anyhow::anyhow!(
                "Heap block overflow; {} bytes requested with {} remaining",
                data.len(),
                self.remaining_capacity()
            ));
        }
        let offset = self.byte_offset;
        self.buffer.write_data_at_offset(data, offset as usize)?;
        self.byte_offset += data.len() as u64;
        Ok(offset)
    }
}

struct HeapPool {
    heaps: Vec<HeapBlock>,
    current: usize,
    cpu_timeline_value: u64,
}

impl HeapPool {
    fn new() -> Self {
        Self {
            heaps: Vec::new(),
            current: 0,
            cpu_timeline_value: 0,
        }
    }

    /// Bytes still writable across the open blocks.
    fn open_capacity(&self) -> u64 {
        self.heaps[self.current.min(self.heaps.len())..]
            .iter()
            .map(HeapBlock::remaining_capacity)
            .sum()
    }

    fn unallocated_blocks(&self) -> usize {
        MAX_UPLOAD_HEAP_PER_POOL - self.heaps.len()
    }

    fn reset(&mut self) {
        for heap in &mut self.heaps {
            heap.byte_offset = 0;
        }
        self.current = 0;
        self.cpu_timeline_value = 0;
    }
}

/// New blocks required to fit `size` bytes on top of the open capacity, or
/// `None` when the pool cannot fit the request.
fn additional_blocks_needed(
    open_capacity: u64,
    unallocated_blocks: usize,
    size: u64,
) -> Option<usize> {
    if size <= open_capacity {
        return Some(0);
    }
    let deficit = size - open_capacity;
    let blocks = deficit.div_ceil(HEAP_BLOCK_SIZE) as usize;
    (blocks <= unallocated_blocks).then_some(blocks)
}

struct BufferUpload {
    src_buffer: Arc<Buffer>,
    src_offset: u64,
    dst: Arc<Buffer>,
    dst_offset: u64,
    size: u64,
    dst_queue: DeviceQueue,
}

struct ImageUpload {
    src_buffer: Arc<Buffer>,
    src_offset: u64,
    dst: Arc<Image>,
    mip_level: u32,
    dst_queue: DeviceQueue,
}

pub struct UploadHeap {
    pools: [HeapPool; MAX_POOL_IN_QUEUE],
    buffer_uploads: [Vec<BufferUpload>; MAX_POOL_IN_QUEUE],
    image_uploads: [Vec<ImageUpload>; MAX_POOL_IN_QUEUE],
    current_pool: usize,
    cpu_upload_timeline: u64,
    upload_fence: Arc<Fence>,
    command_queue: Arc<CommandQueue>,
    device: Arc<Device>,
}

impl UploadHeap {
    pub fn new(device: &Arc<Device>, command_queue: &Arc<CommandQueue>) -> Result<Self> {
        let upload_fence = Fence::new(device, "upload_heap_timeline", 0)?;

        Ok(Self {
            pools: std::array::from_fn(|_| HeapPool::new()),
            buffer_uploads: std::array::from_fn(|_| Vec::new()),
            image_uploads: std::array::from_fn(|_| Vec::new()),
            current_pool: 0,
            cpu_upload_timeline: 0,
            upload_fence,
            command_queue: command_queue.clone(),
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn current_upload_id(&self) -> UploadId {
        UploadId(self.cpu_upload_timeline)
    }

    /// Whether the batch carrying the upload has completed on the GPU.
    pub fn upload_completed(&self, id: UploadId) -> Result<bool> {
        Ok(self.upload_fence.value()? >= id.0)
    }

    fn allocate_heap_block(device: &Arc<Device>, index: usize) -> Result<HeapBlock> {
        let buffer = device.create_buffer(
            BufferDescriptor::new(
                HEAP_BLOCK_SIZE,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            )
            .name(&format!("upload_heap_block_{}", index)),
        )?;
        Ok(HeapBlock {
            buffer,
            byte_offset: 0,
        })
    }

    /// Returns staging blocks from the current pool able to hold `size`
    /// bytes, allocating blocks up to the pool cap. Requests larger than
    /// [`HEAP_POOL_MAX_SIZE`] or past the pool's remaining room return an
    /// empty slice; split the data and drive it across frames instead.
    pub fn request_heaps(&mut self, size: u64) -> Result<&mut [HeapBlock]> {
        if size > HEAP_POOL_MAX_SIZE {
            return Ok(&mut []);
        }

        let device = self.device.clone();
        let pool = &mut self.pools[self.current_pool];
        let needed =
            match additional_blocks_needed(pool.open_capacity(), pool.unallocated_blocks(), size) {
                Some(needed) => needed,
                None => return Ok(&mut []),
            };

        for _ in 0..needed {
            let block = Self::allocate_heap_block(&device, pool.heaps.len())?;
            pool.heaps.push(block);
        }

        let start = pool.current.min(pool.heaps.len());
        Ok(&mut pool.heaps[start..])
    }

    /// Index of a block with at least `size` bytes free, advancing and
    /// allocating as required.
    fn next_available_heap_index(&mut self, size: u64) -> Result<usize> {
        let device = self.device.clone();
        let pool = &mut self.pools[self.current_pool];

        while pool.current < pool.heaps.len() {
            if pool.heaps[pool.current].remaining_capacity() >= size {
                return Ok(pool.current);
            }
            pool.current += 1;
        }

        if pool.unallocated_blocks() == 0 {
            return Err(anyhow::anyhow!(
                "Upload heap pool exhausted; flush with send_to_gpu before staging more data"
            ));
        }
        let block = Self::allocate_heap_block(&device, pool.heaps.len())?;
        pool.heaps.push(block);
        Ok(pool.heaps.len() - 1)
    }

    fn next_upload_id(&self) -> UploadId {
        UploadId(self.cpu_upload_timeline + 1)
    }

    fn check_upload_budget(&self) -> Result<()> {
        let pending = self.buffer_uploads[self.current_pool].len()
            + self.image_uploads[self.current_pool].len();
        if pending >= MAX_UPLOADS_PER_POOL {
            return Err(anyhow::anyhow!(
                "Upload ring full ({} uploads pending); flush with send_to_gpu",
                pending
            ));
        }
        Ok(())
    }

    /// Stages `data` and records a copy into `dst`, splitting across
    /// staging blocks as needed. Copies are issued in insertion order.
    pub fn upload_data_to_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        data: &[u8],
        dst_queue: DeviceQueue,
    ) -> Result<UploadId> {
        let id = self.next_upload_id();

        let mut written = 0usize;
        while written < data.len() {
            self.check_upload_budget()?;

            let block_index = self.next_available_heap_index(1)?;
            let pool = &mut self.pools[self.current_pool];
            let block = &mut pool.heaps[block_index];

            let chunk = (data.len() - written).min(block.remaining_capacity() as usize);
            let src_offset = block.write(&data[written..written + chunk])?;
            let src_buffer = block.buffer.clone();

            self.buffer_uploads[self.current_pool].push(BufferUpload {
                src_buffer,
                src_offset,
                dst: dst.clone(),
                dst_offset: dst_offset + written as u64,
                size: chunk as u64,
                dst_queue,
            });
            written += chunk;
        }

        Ok(id)
    }

    /// Stages image texel data and records a buffer-to-image copy for one
    /// mip level. Image data must fit a single staging block.
    pub fn upload_data_to_image(
        &mut self,
        dst: &Arc<Image>,
        data: &[u8],
        mip_level: u32,
        dst_queue: DeviceQueue,
    ) -> Result<UploadId> {
        if data.len() as u64 > HEAP_BLOCK_SIZE {
            return Err(anyhow::anyhow!(
                "Image upload of {} bytes exceeds the {} byte staging block; split into smaller regions",
                data.len(),
                HEAP_BLOCK_SIZE
            ));
        }
        self.check_upload_budget()?;

        let id = self.next_upload_id();

        let block_index = self.next_available_heap_index(data.len() as u64)?;
        let pool = &mut self.pools[self.current_pool];
        let block = &mut pool.heaps[block_index];
        let src_offset = block.write(data)?;
        let src_buffer = block.buffer.clone();

        self.image_uploads[self.current_pool].push(ImageUpload {
            src_buffer,
            src_offset,
            dst: dst.clone(),
            mip_level,
            dst_queue,
        });

        Ok(id)
    }

    /// Records a copy out of a heap block the caller wrote directly via
    /// [`UploadHeap::request_heaps`].
    pub fn upload_heap_to_buffer(
        &mut self,
        heap_buffer: &Arc<Buffer>,
        heap_offset: u64,
        size: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        dst_queue: DeviceQueue,
    ) -> Result<UploadId> {
        self.check_upload_budget()?;
        let id = self.next_upload_id();

        self.buffer_uploads[self.current_pool].push(BufferUpload {
            src_buffer: heap_buffer.clone(),
            src_offset: heap_offset,
            dst: dst.clone(),
            dst_offset,
            size,
            dst_queue,
        });

        Ok(id)
    }

    /// Flushes the staged uploads on the transfer queue.
    ///
    /// Buffer and image copies are recorded in insertion order, followed by
    /// queue family release barriers for every resource whose destination
    /// queue lives on another family. A matching acquire command buffer is
    /// recorded per destination queue and enqueued in a submission group
    /// waiting on the returned fence value; the caller flushes those queues.
    pub fn send_to_gpu(&mut self, wait_idle: bool) -> Result<FenceSignal> {
        let pool_index = self.current_pool;
        let buffer_uploads = std::mem::take(&mut self.buffer_uploads[pool_index]);
        let image_uploads = std::mem::take(&mut self.image_uploads[pool_index]);

        if buffer_uploads.is_empty() && image_uploads.is_empty() {
            return Ok(FenceSignal {
                fence: self.upload_fence.clone(),
                value: self.cpu_upload_timeline,
            });
        }

        let transfer_family = self.device.queue_family_index(DeviceQueue::Transfer);
        let value = self.cpu_upload_timeline + 1;

        let mut cmd = self
            .command_queue
            .next_free_command_buffer(DeviceQueue::Transfer)?;
        cmd.begin()
            .with_context(|| "Failed to begin the upload command buffer!")?;

        for upload in &image_uploads {
            cmd.pipeline_image_barrier(
                &upload.dst,
                ImageBarrierDescriptor {
                    src: Access::NONE,
                    dst: Access::TRANSFER_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    ..Default::default()
                },
            );
        }
        cmd.flush_barriers();

        for upload in &buffer_uploads {
            cmd.copy_buffer_to_buffer(
                &upload.src_buffer,
                &upload.dst,
                upload.src_offset,
                upload.dst_offset,
                upload.size,
            );
        }
        for upload in &image_uploads {
            cmd.copy_buffer_to_image(
                &upload.src_buffer,
                &upload.dst,
                upload.src_offset,
                upload.mip_level,
            );
        }

        // Release ownership towards every destination queue on a foreign
        // family.
        for upload in &buffer_uploads {
            if self.device.queue_family_index(upload.dst_queue) != transfer_family {
                cmd.pipeline_buffer_barrier(
                    &upload.dst,
                    BufferBarrierDescriptor {
                        offset: upload.dst_offset,
                        size: upload.size,
                        src: Access::TRANSFER_WRITE,
                        dst: Access::NONE,
                        src_queue: DeviceQueue::Transfer,
                        dst_queue: upload.dst_queue,
                    },
                );
            }
        }
        for upload in &image_uploads {
            let (src, dst_queue) = if self.device.queue_family_index(upload.dst_queue)
                != transfer_family
            {
                (DeviceQueue::Transfer, upload.dst_queue)
            } else {
                (upload.dst_queue, upload.dst_queue)
            };
            cmd.pipeline_image_barrier(
                &upload.dst,
                ImageBarrierDescriptor {
                    src: Access::TRANSFER_WRITE,
                    dst: Access::NONE,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src_queue: src,
                    dst_queue,
                    ..Default::default()
                },
            );
        }
        cmd.flush_barriers();
        cmd.end()?;

        let group = self
            .command_queue
            .new_submission_group(DeviceQueue::Transfer)?;
        group.submit(&mut cmd)?;
        group.signal_fence(&self.upload_fence, value)?;
        self.command_queue.send_to_gpu(DeviceQueue::Transfer)?;

        self.cpu_upload_timeline = value;
        self.pools[pool_index].cpu_timeline_value = value;

        self.record_acquire_commands(&buffer_uploads, &image_uploads, transfer_family, value)?;

        self.advance_pool()?;

        if wait_idle {
            self.upload_fence.wait_for_value(value, u64::MAX)?;
        }

        Ok(FenceSignal {
            fence: self.upload_fence.clone(),
            value,
        })
    }

    /// Records the acquire side of each pending ownership transfer and
    /// parks it in a submission group on the destination queue.
    fn record_acquire_commands(
        &mut self,
        buffer_uploads: &[BufferUpload],
        image_uploads: &[ImageUpload],
        transfer_family: u32,
        value: u64,
    ) -> Result<()> {
        for queue in [DeviceQueue::Main, DeviceQueue::Compute] {
            let queue_family = self.device.queue_family_index(queue);
            if queue_family == transfer_family {
                continue;
            }

            let buffers = buffer_uploads
                .iter()
                .filter(|upload| {
                    self.device.queue_family_index(upload.dst_queue) == queue_family
                })
                .collect::<Vec<_>>();
            let images = image_uploads
                .iter()
                .filter(|upload| {
                    self.device.queue_family_index(upload.dst_queue) == queue_family
                })
                .collect::<Vec<_>>();
            if buffers.is_empty() && images.is_empty() {
                continue;
            }

            let mut cmd = self.command_queue.next_free_command_buffer(queue)?;
            cmd.begin()?;
            for upload in &buffers {
                cmd.pipeline_buffer_barrier(
                    &upload.dst,
                    BufferBarrierDescriptor {
                        offset: upload.dst_offset,
                        size: upload.size,
                        src: Access::NONE,
                        dst: Access::new(
                            vk::PipelineStageFlags2::ALL_COMMANDS,
                            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                        ),
                        src_queue: DeviceQueue::Transfer,
                        dst_queue: upload.dst_queue,
                    },
                );
            }
            for upload in &images {
                cmd.pipeline_image_barrier(
                    &upload.dst,
                    ImageBarrierDescriptor {
                        src: Access::NONE,
                        dst: Access::SHADER_READ,
                        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        src_queue: DeviceQueue::Transfer,
                        dst_queue: upload.dst_queue,
                        ..Default::default()
                    },
                );
            }
            cmd.flush_barriers();
            cmd.end()?;

            let group = self.command_queue.new_submission_group(queue)?;
            group.wait_fence(&self.upload_fence, value)?;
            group.submit(&mut cmd)?;
        }

        Ok(())
    }

    /// Moves onto the next pool in the ring; blocks only when that pool's
    /// previous batch has not finished on the GPU yet.
    fn advance_pool(&mut self) -> Result<()> {
        self.current_pool = (self.current_pool + 1) % MAX_POOL_IN_QUEUE;

        let pending = self.pools[self.current_pool].cpu_timeline_value;
        if pending > 0 {
            self.upload_fence.wait_for_value(pending, u64::MAX)?;
        }
        self.pools[self.current_pool].reset();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_extra_blocks_needed_when_open_capacity_fits() {
        assert_eq!(additional_blocks_needed(HEAP_BLOCK_SIZE, 7, 1024), Some(0));
    }

    #[test]
    fn deficits_round_up_to_whole_blocks() {
        assert_eq!(
            additional_blocks_needed(0, MAX_UPLOAD_HEAP_PER_POOL, HEAP_BLOCK_SIZE + 1),
            Some(2)
        );
        assert_eq!(
            additional_blocks_needed(512, MAX_UPLOAD_HEAP_PER_POOL, HEAP_BLOCK_SIZE),
            Some(1)
        );
    }

    #[test]
    fn requests_past_the_pool_cap_are_rejected() {
        assert_eq!(additional_blocks_needed(0, 2, 3 * HEAP_BLOCK_SIZE), None);
        assert_eq!(additional_blocks_needed(0, 0, 1), None);
    }

    #[test]
    fn pool_capacity_matches_the_bar_budget() {
        assert_eq!(
            HEAP_BLOCK_SIZE * MAX_UPLOAD_HEAP_PER_POOL as u64,
            HEAP_POOL_MAX_SIZE
        );
    }

    #[test]
    fn upload_ids_order_with_their_timeline_values() {
        assert!(UploadId(1) < UploadId(2));
        assert_eq!(UploadId(7), UploadId(7));
    }
}
