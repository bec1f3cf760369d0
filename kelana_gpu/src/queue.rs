/*! Command submission.
 *
 * Each logical queue carries a bounded ring of submission groups plus a map
 * of per-thread command pools. Groups batch command buffers with their
 * wait/signal fences and semaphores; `send_to_gpu` collates every group of
 * a queue into one `vkQueueSubmit2` call.
 */

use std::{collections::HashMap, sync::Arc, thread::ThreadId};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use super::{
    command::{CommandBuffer, CommandPool},
    device::Device,
    swapchain::{Swapchain, SwapchainState},
    sync::{Fence, Semaphore},
    DeviceQueue,
};

pub const MAX_SUBMISSION_GROUPS: usize = 8;
pub const MAX_SUBMISSIONS_PER_GROUP: usize = 16;

#[derive(Default)]
struct SubmissionGroupData {
    command_buffers: Vec<vk::CommandBuffer>,
    wait_fences: Vec<(vk::Semaphore, u64)>,
    signal_fences: Vec<(vk::Semaphore, u64)>,
    wait_semaphores: Vec<vk::Semaphore>,
    signal_semaphores: Vec<vk::Semaphore>,

    /// Keeps submitted synchronization objects alive through the flush;
    /// resource memory itself is protected by the deferred destruction
    /// timeline.
    retained_fences: Vec<Arc<Fence>>,
    retained_semaphores: Vec<Arc<Semaphore>>,
}

struct QueueState {
    groups: Vec<SubmissionGroupData>,
    pools: HashMap<ThreadId, Arc<CommandPool>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            groups: Vec::new(),
            pools: HashMap::new(),
        }
    }
}

/// Facade over one submission group slot. Writes go through the owning
/// queue; the group stays valid until the next `send_to_gpu` on its queue.
pub struct SubmissionGroup<'a> {
    owner: &'a CommandQueue,
    queue: DeviceQueue,
    index: usize,
}

impl<'a> SubmissionGroup<'a> {
    fn with_group<R>(
        &self,
        access: impl FnOnce(&mut SubmissionGroupData) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.owner.state(self.queue).lock();
        let group = state
            .groups
            .get_mut(self.index)
            .ok_or_else(|| anyhow::anyhow!("Submission group was already flushed"))?;
        access(group)
    }

    /// Adds an executable command buffer; it transitions to pending and its
    /// completion fence is signalled at its new recording timeline.
    pub fn submit(&self, command_buffer: &mut CommandBuffer) -> Result<()> {
        self.with_group(|group| {
            if group.command_buffers.len() >= MAX_SUBMISSIONS_PER_GROUP {
                return Err(anyhow::anyhow!("Submission group command buffer cap reached"));
            }
            Ok(())
        })?;

        let (raw, fence_raw, timeline) = command_buffer.prepare_submit()?;
        let fence = command_buffer.completion_fence().clone();
        self.with_group(|group| {
            group.command_buffers.push(raw);
            group.signal_fences.push((fence_raw, timeline));
            group.retained_fences.push(fence);
            Ok(())
        })
    }

    pub fn signal_fence(&self, fence: &Arc<Fence>, value: u64) -> Result<()> {
        self.with_group(|group| {
            if group.signal_fences.len() >= MAX_SUBMISSIONS_PER_GROUP {
                return Err(anyhow::anyhow!("Submission group signal fence cap reached"));
            }
            group.signal_fences.push((fence.raw, value));
            group.retained_fences.push(fence.clone());
            Ok(())
        })
    }

    pub fn wait_fence(&self, fence: &Arc<Fence>, value: u64) -> Result<()> {
        self.with_group(|group| {
            if group.wait_fences.len() >= MAX_SUBMISSIONS_PER_GROUP {
                return Err(anyhow::anyhow!("Submission group wait fence cap reached"));
            }
            group.wait_fences.push((fence.raw, value));
            group.retained_fences.push(fence.clone());
            Ok(())
        })
    }

    pub fn signal_semaphore(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        self.with_group(|group| {
            if group.signal_semaphores.len() >= MAX_SUBMISSIONS_PER_GROUP {
                return Err(anyhow::anyhow!("Submission group signal semaphore cap reached"));
            }
            group.signal_semaphores.push(semaphore.raw);
            group.retained_semaphores.push(semaphore.clone());
            Ok(())
        })
    }

    pub fn wait_semaphore(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        self.with_group(|group| {
            if group.wait_semaphores.len() >= MAX_SUBMISSIONS_PER_GROUP {
                return Err(anyhow::anyhow!("Submission group wait semaphore cap reached"));
            }
            group.wait_semaphores.push(semaphore.raw);
            group.retained_semaphores.push(semaphore.clone());
            Ok(())
        })
    }
}

pub struct CommandQueue {
    main: Mutex<QueueState>,
    transfer: Mutex<QueueState>,
    compute: Mutex<QueueState>,
    device: Arc<Device>,
}

impl CommandQueue {
    pub fn new(device: &Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            main: Mutex::new(QueueState::new()),
            transfer: Mutex::new(QueueState::new()),
            compute: Mutex::new(QueueState::new()),
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn state(&self, queue: DeviceQueue) -> &Mutex<QueueState> {
        match queue {
            DeviceQueue::Main => &self.main,
            DeviceQueue::Transfer => &self.transfer,
            DeviceQueue::Compute => &self.compute,
        }
    }

    /// Opens the next submission group slot on the queue.
    pub fn new_submission_group(&self, queue: DeviceQueue) -> Result<SubmissionGroup> {
        let mut state = self.state(queue).lock();
        if state.groups.len() >= MAX_SUBMISSION_GROUPS {
            return Err(anyhow::anyhow!(
                "All {} submission groups are in use; flush the queue first",
                MAX_SUBMISSION_GROUPS
            ));
        }
        state.groups.push(SubmissionGroupData::default());
        let index = state.groups.len() - 1;

        Ok(SubmissionGroup {
            owner: self,
            queue,
            index,
        })
    }

    /// Draws a command buffer from the calling thread's pool for the queue,
    /// creating the pool lazily on first use.
    pub fn next_free_command_buffer(&self, queue: DeviceQueue) -> Result<CommandBuffer> {
        let tid = std::thread::current().id();

        let pool = {
            let mut state = self.state(queue).lock();
            match state.pools.get(&tid) {
                Some(pool) => pool.clone(),
                None => {
                    let pool = CommandPool::new(
                        &self.device,
                        queue,
                        &format!("{:?}:{:?}", queue, tid),
                    )?;
                    state.pools.insert(tid, pool.clone());
                    pool
                }
            }
        };

        CommandBuffer::from(&pool)
    }

    /// Collates every submission group of the queue into a single
    /// `vkQueueSubmit2`. Fire and forget; completion is observable on the
    /// submitted command buffers' timeline fences. The main queue
    /// additionally signals the device frame timeline, advancing the frame.
    pub fn send_to_gpu(&self, queue: DeviceQueue) -> Result<()> {
        let groups = {
            let mut state = self.state(queue).lock();
            std::mem::take(&mut state.groups)
        };
        if groups.is_empty() {
            if queue == DeviceQueue::Main {
                // An empty frame still advances the timeline so garbage
                // collection and frame throttling keep moving.
                let frame = self.device.advance_cpu_frame();
                let signals = [(self.device.frame_timeline_semaphore(), frame)];
                self.submit_raw(queue, &[], &[], &signals)?;
            }
            return Ok(());
        }

        let frame_signal = (queue == DeviceQueue::Main).then(|| {
            (
                self.device.frame_timeline_semaphore(),
                self.device.advance_cpu_frame(),
            )
        });

        let mut built = Vec::with_capacity(groups.len());
        for (index, group) in groups.iter().enumerate() {
            let mut waits = Vec::with_capacity(group.wait_fences.len() + group.wait_semaphores.len());
            for (semaphore, value) in &group.wait_fences {
                waits.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(*semaphore)
                        .value(*value)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }
            for semaphore in &group.wait_semaphores {
                waits.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(*semaphore)
                        .value(0)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }

            let mut signals =
                Vec::with_capacity(group.signal_fences.len() + group.signal_semaphores.len() + 1);
            for (semaphore, value) in &group.signal_fences {
                signals.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(*semaphore)
                        .value(*value)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }
            for semaphore in &group.signal_semaphores {
                signals.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(*semaphore)
                        .value(0)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }
            if index == groups.len() - 1 {
                if let Some((frame_timeline, frame)) = frame_signal {
                    signals.push(
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(frame_timeline)
                            .value(frame)
                            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                    );
                }
            }

            let command_buffers = group
                .command_buffers
                .iter()
                .map(|raw| vk::CommandBufferSubmitInfo::default().command_buffer(*raw))
                .collect::<Vec<_>>();

            built.push((waits, signals, command_buffers));
        }

        let submit_infos = built
            .iter()
            .map(|(waits, signals, command_buffers)| {
                vk::SubmitInfo2::default()
                    .wait_semaphore_infos(waits)
                    .signal_semaphore_infos(signals)
                    .command_buffer_infos(command_buffers)
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device
                .shared
                .raw
                .queue_submit2(
                    self.device.queue(queue).raw,
                    &submit_infos,
                    vk::Fence::null(),
                )
                .with_context(|| "Failed queue submission!")?;
        }

        // Retained fences and semaphores drop here; their vulkan handles
        // outlive the submission through the deferred destruction timeline.
        Ok(())
    }

    fn submit_raw(
        &self,
        queue: DeviceQueue,
        command_buffers: &[vk::CommandBuffer],
        waits: &[(vk::Semaphore, u64)],
        signals: &[(vk::Semaphore, u64)],
    ) -> Result<()> {
        let wait_infos = waits
            .iter()
            .map(|(semaphore, value)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .value(*value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<Vec<_>>();
        let signal_infos = signals
            .iter()
            .map(|(semaphore, value)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .value(*value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<Vec<_>>();
        let command_buffer_infos = command_buffers
            .iter()
            .map(|raw| vk::CommandBufferSubmitInfo::default().command_buffer(*raw))
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&command_buffer_infos);

        unsafe {
            self.device.shared.raw.queue_submit2(
                self.device.queue(queue).raw,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )?;
        }
        Ok(())
    }

    /// Discards every submission group without sending it to the GPU.
    pub fn clear(&self, queue: DeviceQueue) {
        let mut state = self.state(queue).lock();
        state.groups.clear();
    }

    /// Presents each swapchain's acquired image, waiting on its current
    /// present semaphore. Returns the worst state across the swapchains.
    pub fn present(&self, swapchains: &[&Swapchain]) -> Result<SwapchainState> {
        if swapchains.is_empty() {
            return Ok(SwapchainState::Ok);
        }

        let wait_semaphores = swapchains
            .iter()
            .map(|swapchain| swapchain.current_present_semaphore().raw)
            .collect::<Vec<_>>();
        let handles = swapchains
            .iter()
            .map(|swapchain| swapchain.raw())
            .collect::<Vec<_>>();
        let image_indices = swapchains
            .iter()
            .map(|swapchain| swapchain.next_image_index())
            .collect::<Vec<_>>();

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&handles)
            .image_indices(&image_indices);

        let result = unsafe {
            swapchains[0]
                .loader()
                .queue_present(self.device.queue(DeviceQueue::Main).raw, &present_info)
        };

        let state = match result {
            Ok(false) => SwapchainState::Ok,
            Ok(true) => SwapchainState::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => SwapchainState::Error,
            Err(error) => {
                return Err(error).with_context(|| "Failed swapchain queue present!");
            }
        };
        for swapchain in swapchains {
            swapchain.set_state(state);
        }

        Ok(state)
    }
}
