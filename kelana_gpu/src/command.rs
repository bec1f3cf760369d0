/*! Command recording.
 *
 * `CommandPool` owns a bounded ring of reusable command buffers per
 * queue-family/thread pair. `CommandBuffer` tracks the
 * Initial/Recording/Executable/Pending state machine, batches pipeline
 * barriers and records rendering work through dynamic rendering; no
 * renderpass or framebuffer objects exist anywhere.
 */

use std::{collections::VecDeque, sync::Arc};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use super::{
    device::Device,
    pipeline::Pipeline,
    resource::{Buffer, Image},
    swapchain::Swapchain,
    sync::{Event, Fence},
    DeviceQueue, MAX_COMMAND_BUFFER_PER_POOL, MAX_PIPELINE_BARRIER_BATCH_SIZE,
};

/// Pipeline barrier access scope. Only the coarse read/write style masks
/// are expected here; finer grained masks still pass through untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Access {
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
}

impl Access {
    pub const NONE: Self = Self {
        stage_mask: vk::PipelineStageFlags2::NONE,
        access_mask: vk::AccessFlags2::NONE,
    };

    pub const TRANSFER_WRITE: Self = Self {
        stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        access_mask: vk::AccessFlags2::TRANSFER_WRITE,
    };

    pub const TRANSFER_READ: Self = Self {
        stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        access_mask: vk::AccessFlags2::TRANSFER_READ,
    };

    pub const HOST_WRITE: Self = Self {
        stage_mask: vk::PipelineStageFlags2::HOST,
        access_mask: vk::AccessFlags2::HOST_WRITE,
    };

    pub const SHADER_READ: Self = Self {
        stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        access_mask: vk::AccessFlags2::SHADER_READ,
    };

    pub const SHADER_WRITE: Self = Self {
        stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        access_mask: vk::AccessFlags2::SHADER_WRITE,
    };

    pub fn new(stage_mask: vk::PipelineStageFlags2, access_mask: vk::AccessFlags2) -> Self {
        Self {
            stage_mask,
            access_mask,
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct MemoryBarrierDescriptor {
    pub src: Access,
    pub dst: Access,
}

#[derive(Clone, Copy)]
pub struct BufferBarrierDescriptor {
    pub offset: u64,
    pub size: u64,
    pub src: Access,
    pub dst: Access,
    pub src_queue: DeviceQueue,
    pub dst_queue: DeviceQueue,
}

impl Default for BufferBarrierDescriptor {
    fn default() -> Self {
        Self {
            offset: 0,
            size: vk::WHOLE_SIZE,
            src: Access::NONE,
            dst: Access::NONE,
            src_queue: DeviceQueue::Main,
            dst_queue: DeviceQueue::Main,
        }
    }
}

#[derive(Clone, Copy)]
pub struct ImageBarrierDescriptor {
    pub src: Access,
    pub dst: Access,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    /// Defaults to the image's full subresource range.
    pub subresource_range: Option<vk::ImageSubresourceRange>,
    pub src_queue: DeviceQueue,
    pub dst_queue: DeviceQueue,
}

impl Default for ImageBarrierDescriptor {
    fn default() -> Self {
        Self {
            src: Access::NONE,
            dst: Access::NONE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            subresource_range: None,
            src_queue: DeviceQueue::Main,
            dst_queue: DeviceQueue::Main,
        }
    }
}

/// In-memory barrier staging. Barriers accumulate until a state changing
/// command flushes them as one `vkCmdPipelineBarrier2`; each kind is capped
/// and overflowing a cap flushes automatically.
#[derive(Default)]
pub(crate) struct BarrierBatch {
    memory: Vec<vk::MemoryBarrier2<'static>>,
    buffer: Vec<vk::BufferMemoryBarrier2<'static>>,
    image: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffer.is_empty() && self.image.is_empty()
    }

    pub(crate) fn memory_is_full(&self) -> bool {
        self.memory.len() >= MAX_PIPELINE_BARRIER_BATCH_SIZE
    }

    pub(crate) fn buffer_is_full(&self) -> bool {
        self.buffer.len() >= MAX_PIPELINE_BARRIER_BATCH_SIZE
    }

    pub(crate) fn image_is_full(&self) -> bool {
        self.image.len() >= MAX_PIPELINE_BARRIER_BATCH_SIZE
    }

    pub(crate) fn push_memory(&mut self, barrier: vk::MemoryBarrier2<'static>) {
        self.memory.push(barrier);
    }

    pub(crate) fn push_buffer(&mut self, barrier: vk::BufferMemoryBarrier2<'static>) {
        self.buffer.push(barrier);
    }

    pub(crate) fn push_image(&mut self, barrier: vk::ImageMemoryBarrier2<'static>) {
        self.image.push(barrier);
    }

    pub(crate) fn clear(&mut self) {
        self.memory.clear();
        self.buffer.clear();
        self.image.clear();
    }
}

/// `Initial -> Recording -> Executable -> Pending -> Executable` once the
/// completion timeline catches up; `reset` returns any non pending buffer
/// to `Initial`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

impl CommandBufferState {
    pub(crate) fn can_reset(self) -> bool {
        self != Self::Pending
    }

    pub(crate) fn can_begin(self) -> bool {
        self == Self::Initial
    }

    pub(crate) fn is_recording(self) -> bool {
        self == Self::Recording
    }
}

struct PoolSlot {
    raw: vk::CommandBuffer,
    completion_fence: Arc<Fence>,
    recording_timeline: u64,
}

struct PoolSlots {
    slots: Vec<PoolSlot>,
    free: VecDeque<usize>,
}

/// One pool per queue-family/thread pair. Buffers handed out are returned
/// to the free ring on drop rather than released back to vulkan.
pub struct CommandPool {
    pub(crate) raw: vk::CommandPool,
    queue: DeviceQueue,
    slots: Mutex<PoolSlots>,
    device: Arc<Device>,
}

impl CommandPool {
    pub fn new(device: &Arc<Device>, queue: DeviceQueue, name: &str) -> Result<Arc<Self>> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_family_index(queue));

        let raw = unsafe {
            device
                .shared
                .raw
                .create_command_pool(&pool_info, None)
                .with_context(|| "Failed to create command pool!")?
        };
        device.shared.set_object_name(raw, "command_pool", name);

        Ok(Arc::new(Self {
            raw,
            queue,
            slots: Mutex::new(PoolSlots {
                slots: Vec::new(),
                free: VecDeque::new(),
            }),
            device: device.clone(),
        }))
    }

    pub fn queue(&self) -> DeviceQueue {
        self.queue
    }

    /// Resets every command buffer owned by the pool. The caller must make
    /// sure none of them is still pending on the GPU.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .shared
                .raw
                .reset_command_pool(self.raw, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.schedule_destruction_command_pool(self.raw);
    }
}

struct BoundPipeline {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_constant_size: u32,
}

pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    state: CommandBufferState,
    barriers: BarrierBatch,
    recording_timeline: u64,
    completion_fence: Arc<Fence>,
    bound_pipeline: Option<BoundPipeline>,
    slot_index: usize,
    pool: Arc<CommandPool>,
    device: Arc<Device>,
}

impl CommandBuffer {
    /// Draws a command buffer from the pool's free ring, allocating a new
    /// vulkan command buffer while the pool is below its cap.
    pub fn from(pool: &Arc<CommandPool>) -> Result<Self> {
        let device = pool.device.clone();
        let mut slots = pool.slots.lock();

        let slot_index = if let Some(index) = slots.free.pop_front() {
            unsafe {
                device.shared.raw.reset_command_buffer(
                    slots.slots[index].raw,
                    vk::CommandBufferResetFlags::empty(),
                )?;
            }
            index
        } else {
            if slots.slots.len() >= MAX_COMMAND_BUFFER_PER_POOL {
                return Err(anyhow::anyhow!(
                    "Command pool exhausted; all {} command buffers are in use",
                    MAX_COMMAND_BUFFER_PER_POOL
                ));
            }

            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool.raw)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let raw = unsafe {
                device
                    .shared
                    .raw
                    .allocate_command_buffers(&allocate_info)
                    .with_context(|| "Failed to allocate command buffer!")?[0]
            };
            let completion_fence = Fence::new(
                &device,
                &format!("command_buffer_completion_{}", slots.slots.len()),
                0,
            )?;

            slots.slots.push(PoolSlot {
                raw,
                completion_fence,
                recording_timeline: 0,
            });
            slots.slots.len() - 1
        };

        let slot = &slots.slots[slot_index];
        Ok(Self {
            raw: slot.raw,
            state: CommandBufferState::Initial,
            barriers: BarrierBatch::default(),
            recording_timeline: slot.recording_timeline,
            completion_fence: slot.completion_fence.clone(),
            bound_pipeline: None,
            slot_index,
            pool: pool.clone(),
            device,
        })
    }

    pub fn state(&mut self) -> CommandBufferState {
        self.refresh_pending_state();
        self.state
    }

    /// Timeline value the completion fence reaches once the most recent
    /// submission of this buffer finished.
    pub fn recording_timeline(&self) -> u64 {
        self.recording_timeline
    }

    pub fn completion_fence(&self) -> &Arc<Fence> {
        &self.completion_fence
    }

    /// Whether submission number `value` of this buffer has completed.
    pub fn submission_complete(&self, value: u64) -> Result<bool> {
        Ok(self.completion_fence.value()? >= value)
    }

    fn refresh_pending_state(&mut self) {
        if self.state == CommandBufferState::Pending {
            if let Ok(value) = self.completion_fence.value() {
                if value >= self.recording_timeline {
                    self.state = CommandBufferState::Executable;
                }
            }
        }
    }

    /// Returns the buffer to `Initial`, discarding all recorded commands.
    /// Fails while a submission is still pending; wait on the completion
    /// fence first.
    pub fn reset(&mut self) -> Result<()> {
        self.refresh_pending_state();
        if !self.state.can_reset() {
            return Err(anyhow::anyhow!(
                "Cannot reset a pending command buffer; wait on its completion fence first"
            ));
        }

        unsafe {
            self.device
                .shared
                .raw
                .reset_command_buffer(self.raw, vk::CommandBufferResetFlags::empty())?;
        }
        self.barriers.clear();
        self.bound_pipeline = None;
        self.state = CommandBufferState::Initial;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.refresh_pending_state();
        debug_assert!(self.state.can_begin(), "begin on a non-initial command buffer");
        if !self.state.can_begin() {
            return Err(anyhow::anyhow!(
                "Command buffer must be in the initial state to begin recording"
            ));
        }

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .shared
                .raw
                .begin_command_buffer(self.raw, &begin_info)?;
        }
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        debug_assert!(self.state.is_recording(), "end on a non-recording command buffer");
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.end_command_buffer(self.raw)?;
        }
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Transitions to pending for submission and returns the raw handle
    /// plus the completion fence target for this submission.
    pub(crate) fn prepare_submit(&mut self) -> Result<(vk::CommandBuffer, vk::Semaphore, u64)> {
        self.refresh_pending_state();
        if self.state != CommandBufferState::Executable {
            return Err(anyhow::anyhow!(
                "Only executable command buffers can be submitted (state: {:?})",
                self.state
            ));
        }
        self.recording_timeline += 1;
        self.state = CommandBufferState::Pending;
        Ok((self.raw, self.completion_fence.raw, self.recording_timeline))
    }

    /// Issues all batched barriers as a single combined dependency.
    /// A no-op when every batch is empty.
    pub fn flush_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }

        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(&self.barriers.memory)
            .buffer_memory_barriers(&self.barriers.buffer)
            .image_memory_barriers(&self.barriers.image);
        unsafe {
            self.device
                .shared
                .raw
                .cmd_pipeline_barrier2(self.raw, &dependency_info);
        }
        self.barriers.clear();
    }

    pub fn pipeline_barrier(&mut self, barrier: MemoryBarrierDescriptor) {
        debug_assert!(self.state.is_recording());
        if self.barriers.memory_is_full() {
            self.flush_barriers();
        }
        self.barriers.push_memory(
            vk::MemoryBarrier2::default()
                .src_stage_mask(barrier.src.stage_mask)
                .src_access_mask(barrier.src.access_mask)
                .dst_stage_mask(barrier.dst.stage_mask)
                .dst_access_mask(barrier.dst.access_mask),
        );
    }

    /// A buffer barrier is a memory barrier plus an optional queue family
    /// ownership transfer.
    pub fn pipeline_buffer_barrier(&mut self, buffer: &Buffer, barrier: BufferBarrierDescriptor) {
        debug_assert!(self.state.is_recording());
        if self.barriers.buffer_is_full() {
            self.flush_barriers();
        }

        let (src_family, dst_family) =
            self.ownership_transfer_families(barrier.src_queue, barrier.dst_queue);

        self.barriers.push_buffer(
            vk::BufferMemoryBarrier2::default()
                .buffer(buffer.raw)
                .offset(barrier.offset)
                .size(barrier.size)
                .src_stage_mask(barrier.src.stage_mask)
                .src_access_mask(barrier.src.access_mask)
                .dst_stage_mask(barrier.dst.stage_mask)
                .dst_access_mask(barrier.dst.access_mask)
                .src_queue_family_index(src_family)
                .dst_queue_family_index(dst_family),
        );
        buffer.set_owner_queue(barrier.dst_queue);
    }

    /// An image barrier is a memory barrier plus a layout transition and an
    /// optional queue family ownership transfer.
    pub fn pipeline_image_barrier(&mut self, image: &Image, barrier: ImageBarrierDescriptor) {
        debug_assert!(self.state.is_recording());
        if self.barriers.image_is_full() {
            self.flush_barriers();
        }

        let (src_family, dst_family) =
            self.ownership_transfer_families(barrier.src_queue, barrier.dst_queue);
        let subresource_range = barrier
            .subresource_range
            .unwrap_or_else(|| image.full_subresource_range());

        self.barriers.push_image(
            vk::ImageMemoryBarrier2::default()
                .image(image.raw)
                .old_layout(barrier.old_layout)
                .new_layout(barrier.new_layout)
                .subresource_range(subresource_range)
                .src_stage_mask(barrier.src.stage_mask)
                .src_access_mask(barrier.src.access_mask)
                .dst_stage_mask(barrier.dst.stage_mask)
                .dst_access_mask(barrier.dst.access_mask)
                .src_queue_family_index(src_family)
                .dst_queue_family_index(dst_family),
        );
        image.set_owner_queue(barrier.dst_queue);
    }

    fn ownership_transfer_families(&self, src: DeviceQueue, dst: DeviceQueue) -> (u32, u32) {
        let src_family = self.device.queue_family_index(src);
        let dst_family = self.device.queue_family_index(dst);
        if src_family == dst_family {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (src_family, dst_family)
        }
    }

    pub fn begin_rendering(&mut self, desc: &RenderingDescriptor) {
        debug_assert!(self.state.is_recording());
        self.flush_barriers();

        let color_attachments = desc
            .color_attachments
            .iter()
            .map(|attachment| attachment.to_vulkan_attachment())
            .collect::<Vec<_>>();
        let depth_attachment = desc
            .depth_attachment
            .as_ref()
            .map(|attachment| attachment.to_vulkan_attachment());
        let stencil_attachment = desc
            .stencil_attachment
            .as_ref()
            .map(|attachment| attachment.to_vulkan_attachment());

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(desc.render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        if let Some(stencil_attachment) = &stencil_attachment {
            rendering_info = rendering_info.stencil_attachment(stencil_attachment);
        }

        unsafe {
            self.device
                .shared
                .raw
                .cmd_begin_rendering(self.raw, &rendering_info);
        }
    }

    pub fn end_rendering(&mut self) {
        unsafe {
            self.device.shared.raw.cmd_end_rendering(self.raw);
        }
    }

    /// Binds the pipeline and the global bindless descriptor set through
    /// the pipeline's shared layout.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        debug_assert!(self.state.is_recording());
        unsafe {
            self.device
                .shared
                .raw
                .cmd_bind_pipeline(self.raw, pipeline.bind_point, pipeline.raw);
            self.device.shared.raw.cmd_bind_descriptor_sets(
                self.raw,
                pipeline.bind_point,
                pipeline.layout,
                0,
                std::slice::from_ref(&self.device.descriptor_cache.set),
                &[],
            );
        }
        self.bound_pipeline = Some(BoundPipeline {
            layout: pipeline.layout,
            bind_point: pipeline.bind_point,
            push_constant_size: pipeline.push_constant_size,
        });
    }

    /// Pushes constants through the layout of the currently bound pipeline.
    pub fn bind_push_constant(&mut self, data: &[u8], offset: u32) -> Result<()> {
        let bound = self
            .bound_pipeline
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No pipeline bound for push constants"))?;
        if data.len() as u32 + offset > bound.push_constant_size {
            return Err(anyhow::anyhow!(
                "Push constant write of {} bytes at offset {} exceeds the pipeline's {} bytes",
                data.len(),
                offset,
                bound.push_constant_size
            ));
        }

        unsafe {
            self.device.shared.raw.cmd_push_constants(
                self.raw,
                bound.layout,
                vk::ShaderStageFlags::ALL,
                offset,
                data,
            );
        }
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &Buffer, first_binding: u32, offset: u64) {
        unsafe {
            self.device.shared.raw.cmd_bind_vertex_buffers(
                self.raw,
                first_binding,
                &[buffer.raw],
                &[offset],
            );
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .shared
                .raw
                .cmd_bind_index_buffer(self.raw, buffer.raw, offset, index_type);
        }
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe {
            self.device
                .shared
                .raw
                .cmd_set_viewport(self.raw, 0, std::slice::from_ref(&viewport));
        }
    }

    pub fn set_scissor(&mut self, rect: vk::Rect2D) {
        unsafe {
            self.device
                .shared
                .raw
                .cmd_set_scissor(self.raw, 0, std::slice::from_ref(&rect));
        }
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_draw(
                self.raw,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn draw_indirect(&mut self, buffer: &Buffer, offset: u64, draw_count: u32, stride: u32) {
        self.flush_barriers();
        unsafe {
            self.device
                .shared
                .raw
                .cmd_draw_indirect(self.raw, buffer.raw, offset, draw_count, stride);
        }
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_draw_indexed_indirect(
                self.raw,
                buffer.raw,
                offset,
                draw_count,
                stride,
            );
        }
    }

    pub fn draw_indirect_count(
        &mut self,
        buffer: &Buffer,
        buffer_offset: u64,
        count_buffer: &Buffer,
        count_buffer_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_draw_indirect_count(
                self.raw,
                buffer.raw,
                buffer_offset,
                count_buffer.raw,
                count_buffer_offset,
                max_draw_count,
                stride,
            );
        }
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        buffer: &Buffer,
        buffer_offset: u64,
        count_buffer: &Buffer,
        count_buffer_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_draw_indexed_indirect_count(
                self.raw,
                buffer.raw,
                buffer_offset,
                count_buffer.raw,
                count_buffer_offset,
                max_draw_count,
                stride,
            );
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_dispatch(self.raw, x, y, z);
        }
    }

    pub fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) {
        self.flush_barriers();
        unsafe {
            self.device
                .shared
                .raw
                .cmd_dispatch_indirect(self.raw, buffer.raw, offset);
        }
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) {
        self.flush_barriers();
        let region = vk::BufferCopy2::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        let info = vk::CopyBufferInfo2::default()
            .src_buffer(src.raw)
            .dst_buffer(dst.raw)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device.shared.raw.cmd_copy_buffer2(self.raw, &info);
        }
    }

    pub fn copy_buffer_to_image(
        &mut self,
        buffer: &Buffer,
        image: &Image,
        buffer_offset: u64,
        mip_level: u32,
    ) {
        self.flush_barriers();
        let region = vk::BufferImageCopy2::default()
            .buffer_offset(buffer_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(image.full_subresource_layers(mip_level))
            .image_offset(vk::Offset3D::default())
            .image_extent(image.extent);

        let info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(buffer.raw)
            .dst_image(image.raw)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device
                .shared
                .raw
                .cmd_copy_buffer_to_image2(self.raw, &info);
        }
    }

    pub fn copy_image_to_buffer(&mut self, image: &Image, buffer: &Buffer, buffer_offset: u64) {
        self.flush_barriers();
        let region = vk::BufferImageCopy2::default()
            .buffer_offset(buffer_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(image.full_subresource_layers(0))
            .image_offset(vk::Offset3D::default())
            .image_extent(image.extent);

        let info = vk::CopyImageToBufferInfo2::default()
            .src_image(image.raw)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_buffer(buffer.raw)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device
                .shared
                .raw
                .cmd_copy_image_to_buffer2(self.raw, &info);
        }
    }

    pub fn copy_image_to_image(&mut self, src: &Image, dst: &Image) {
        self.flush_barriers();
        let region = vk::ImageCopy2::default()
            .src_subresource(src.full_subresource_layers(0))
            .dst_subresource(dst.full_subresource_layers(0))
            .extent(src.extent);
        let info = vk::CopyImageInfo2::default()
            .src_image(src.raw)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst.raw)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device.shared.raw.cmd_copy_image2(self.raw, &info);
        }
    }

    pub fn blit_image(&mut self, desc: &ImageBlitDescriptor) {
        self.flush_barriers();
        let region = vk::ImageBlit2::default()
            .src_subresource(desc.src.full_subresource_layers(desc.src_mip_level))
            .src_offsets(desc.src_offsets)
            .dst_subresource(desc.dst.full_subresource_layers(desc.dst_mip_level))
            .dst_offsets(desc.dst_offsets);
        let info = vk::BlitImageInfo2::default()
            .src_image(desc.src.raw)
            .src_image_layout(desc.src_layout)
            .dst_image(desc.dst.raw)
            .dst_image_layout(desc.dst_layout)
            .filter(desc.filter)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device.shared.raw.cmd_blit_image2(self.raw, &info);
        }
    }

    /// Blits into the swapchain image acquired for the current frame.
    pub fn blit_image_swapchain(&mut self, desc: &SwapchainBlitDescriptor) {
        self.flush_barriers();
        let dst_subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let region = vk::ImageBlit2::default()
            .src_subresource(desc.src.full_subresource_layers(desc.src_mip_level))
            .src_offsets(desc.src_offsets)
            .dst_subresource(dst_subresource)
            .dst_offsets(desc.dst_offsets);
        let info = vk::BlitImageInfo2::default()
            .src_image(desc.src.raw)
            .src_image_layout(desc.src_layout)
            .dst_image(desc.dst.current_image_raw())
            .dst_image_layout(desc.dst_layout)
            .filter(desc.filter)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device.shared.raw.cmd_blit_image2(self.raw, &info);
        }
    }

    pub fn clear_color_image(
        &mut self,
        image: &Image,
        layout: vk::ImageLayout,
        clear_color: vk::ClearColorValue,
    ) {
        self.flush_barriers();
        unsafe {
            self.device.shared.raw.cmd_clear_color_image(
                self.raw,
                image.raw,
                layout,
                &clear_color,
                std::slice::from_ref(&image.full_subresource_range()),
            );
        }
    }

    pub fn clear_buffer(&mut self, buffer: &Buffer, offset: u64, size: u64, data: u32) {
        self.flush_barriers();
        unsafe {
            self.device
                .shared
                .raw
                .cmd_fill_buffer(self.raw, buffer.raw, offset, size, data);
        }
    }

    /// Signals the event with the supplied dependency scope. The matching
    /// wait applies the same barriers on the consuming side.
    pub fn signal_event(&mut self, event: &Event, barriers: &EventBarrierDescriptor) {
        debug_assert!(self.state.is_recording());
        let built = self.build_event_dependency(barriers);
        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(&built.memory)
            .buffer_memory_barriers(&built.buffer)
            .image_memory_barriers(&built.image);
        unsafe {
            self.device
                .shared
                .raw
                .cmd_set_event2(self.raw, event.raw, &dependency_info);
        }
    }

    pub fn wait_event(&mut self, event: &Event, barriers: &EventBarrierDescriptor) {
        self.wait_events(&[event], std::slice::from_ref(barriers));
    }

    pub fn wait_events(&mut self, events: &[&Event], barriers: &[EventBarrierDescriptor]) {
        debug_assert!(self.state.is_recording());
        debug_assert_eq!(events.len(), barriers.len());

        let raw_events = events.iter().map(|event| event.raw).collect::<Vec<_>>();
        let built = barriers
            .iter()
            .map(|barriers| self.build_event_dependency(barriers))
            .collect::<Vec<_>>();
        let dependency_infos = built
            .iter()
            .map(|built| {
                vk::DependencyInfo::default()
                    .memory_barriers(&built.memory)
                    .buffer_memory_barriers(&built.buffer)
                    .image_memory_barriers(&built.image)
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device
                .shared
                .raw
                .cmd_wait_events2(self.raw, &raw_events, &dependency_infos);
        }
    }

    pub fn reset_event(&mut self, event: &Event, stage_mask: vk::PipelineStageFlags2) {
        debug_assert!(self.state.is_recording());
        unsafe {
            self.device
                .shared
                .raw
                .cmd_reset_event2(self.raw, event.raw, stage_mask);
        }
    }

    fn build_event_dependency(&self, barriers: &EventBarrierDescriptor) -> BuiltEventDependency {
        let memory = barriers
            .memory_barriers
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier2::default()
                    .src_stage_mask(barrier.src.stage_mask)
                    .src_access_mask(barrier.src.access_mask)
                    .dst_stage_mask(barrier.dst.stage_mask)
                    .dst_access_mask(barrier.dst.access_mask)
            })
            .collect::<Vec<_>>();

        let buffer = barriers
            .buffer_barriers
            .iter()
            .map(|(buffer, barrier)| {
                let (src_family, dst_family) =
                    self.ownership_transfer_families(barrier.src_queue, barrier.dst_queue);
                vk::BufferMemoryBarrier2::default()
                    .buffer(buffer.raw)
                    .offset(barrier.offset)
                    .size(barrier.size)
                    .src_stage_mask(barrier.src.stage_mask)
                    .src_access_mask(barrier.src.access_mask)
                    .dst_stage_mask(barrier.dst.stage_mask)
                    .dst_access_mask(barrier.dst.access_mask)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
            })
            .collect::<Vec<_>>();

        let image = barriers
            .image_barriers
            .iter()
            .map(|(image, barrier)| {
                let (src_family, dst_family) =
                    self.ownership_transfer_families(barrier.src_queue, barrier.dst_queue);
                let subresource_range = barrier
                    .subresource_range
                    .unwrap_or_else(|| image.full_subresource_range());
                vk::ImageMemoryBarrier2::default()
                    .image(image.raw)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .subresource_range(subresource_range)
                    .src_stage_mask(barrier.src.stage_mask)
                    .src_access_mask(barrier.src.access_mask)
                    .dst_stage_mask(barrier.dst.stage_mask)
                    .dst_access_mask(barrier.dst.access_mask)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
            })
            .collect::<Vec<_>>();

        BuiltEventDependency {
            memory,
            buffer,
            image,
        }
    }

    pub fn begin_debug_label(&mut self, name: &str, color: [f32; 4]) {
        if let Some(debug_utils) = &self.device.shared.debug_utils {
            let label_name = std::ffi::CString::new(name).unwrap_or_default();
            let label = vk::DebugUtilsLabelEXT::default()
                .label_name(label_name.as_c_str())
                .color(color);
            unsafe {
                debug_utils.cmd_begin_debug_utils_label(self.raw, &label);
            }
        }
    }

    pub fn end_debug_label(&mut self) {
        if let Some(debug_utils) = &self.device.shared.debug_utils {
            unsafe {
                debug_utils.cmd_end_debug_utils_label(self.raw);
            }
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // Returned to the owning pool's free ring, not released to vulkan.
        let mut slots = self.pool.slots.lock();
        slots.slots[self.slot_index].recording_timeline = self.recording_timeline;
        slots.free.push_back(self.slot_index);
    }
}

struct BuiltEventDependency {
    memory: Vec<vk::MemoryBarrier2<'static>>,
    buffer: Vec<vk::BufferMemoryBarrier2<'static>>,
    image: Vec<vk::ImageMemoryBarrier2<'static>>,
}

pub struct EventBarrierDescriptor<'a> {
    pub memory_barriers: &'a [MemoryBarrierDescriptor],
    pub buffer_barriers: &'a [(&'a Buffer, BufferBarrierDescriptor)],
    pub image_barriers: &'a [(&'a Image, ImageBarrierDescriptor)],
}

pub struct RenderingAttachmentDescriptor<'a> {
    pub image: &'a Image,
    pub image_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    /// Defaults to the image's own clear value.
    pub clear_value: Option<vk::ClearValue>,
}

impl<'a> RenderingAttachmentDescriptor<'a> {
    fn to_vulkan_attachment(&self) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(self.image.raw_view)
            .image_layout(self.image_layout)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .clear_value(self.clear_value.unwrap_or_else(|| self.image.clear_value()))
    }
}

pub struct RenderingDescriptor<'a> {
    pub color_attachments: &'a [RenderingAttachmentDescriptor<'a>],
    pub depth_attachment: Option<RenderingAttachmentDescriptor<'a>>,
    pub stencil_attachment: Option<RenderingAttachmentDescriptor<'a>>,
    pub render_area: vk::Rect2D,
}

pub struct ImageBlitDescriptor<'a> {
    pub src: &'a Image,
    pub dst: &'a Image,
    pub src_layout: vk::ImageLayout,
    pub dst_layout: vk::ImageLayout,
    pub src_offsets: [vk::Offset3D; 2],
    pub dst_offsets: [vk::Offset3D; 2],
    pub src_mip_level: u32,
    pub dst_mip_level: u32,
    pub filter: vk::Filter,
}

pub struct SwapchainBlitDescriptor<'a> {
    pub src: &'a Image,
    pub dst: &'a Swapchain,
    pub src_layout: vk::ImageLayout,
    pub dst_layout: vk::ImageLayout,
    pub src_offsets: [vk::Offset3D; 2],
    pub dst_offsets: [vk::Offset3D; 2],
    pub src_mip_level: u32,
    pub filter: vk::Filter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_batch_starts_empty_and_clears() {
        let mut batch = BarrierBatch::default();
        assert!(batch.is_empty());

        batch.push_memory(vk::MemoryBarrier2::default());
        assert!(!batch.is_empty());

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn barrier_batch_caps_each_kind_independently() {
        let mut batch = BarrierBatch::default();
        for _ in 0..MAX_PIPELINE_BARRIER_BATCH_SIZE {
            batch.push_memory(vk::MemoryBarrier2::default());
        }
        assert!(batch.memory_is_full());
        assert!(!batch.buffer_is_full());
        assert!(!batch.image_is_full());

        for _ in 0..MAX_PIPELINE_BARRIER_BATCH_SIZE {
            batch.push_image(vk::ImageMemoryBarrier2::default());
        }
        assert!(batch.image_is_full());
    }

    #[test]
    fn non_pending_states_can_reset() {
        assert!(CommandBufferState::Initial.can_reset());
        assert!(CommandBufferState::Recording.can_reset());
        assert!(CommandBufferState::Executable.can_reset());
        assert!(CommandBufferState::Invalid.can_reset());
        assert!(!CommandBufferState::Pending.can_reset());
    }

    #[test]
    fn only_initial_buffers_can_begin() {
        assert!(CommandBufferState::Initial.can_begin());
        assert!(!CommandBufferState::Recording.can_begin());
        assert!(!CommandBufferState::Executable.can_begin());
        assert!(!CommandBufferState::Pending.can_begin());
    }
}
