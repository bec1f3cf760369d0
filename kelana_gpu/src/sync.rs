/*! Synchronization primitives.
 *
 * `Semaphore` is a plain binary semaphore for queue and presentation
 * handoffs. `Fence` wraps a timeline semaphore and carries the 64-bit
 * monotonic progress counters the rest of the crate schedules against.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use super::device::Device;

pub struct Semaphore {
    pub(crate) raw: vk::Semaphore,
    device: Arc<Device>,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, name: &str) -> Result<Arc<Self>> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe {
            device
                .shared
                .raw
                .create_semaphore(&semaphore_info, None)
                .with_context(|| "Failed to create binary semaphore!")?
        };
        device.shared.set_object_name(raw, "semaphore", name);

        Ok(Arc::new(Self {
            raw,
            device: device.clone(),
        }))
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.schedule_destruction_semaphore(self.raw);
    }
}

/// Timeline semaphore with a monotonically increasing 64-bit value, used
/// for CPU-GPU progress tracking and cross queue scheduling.
pub struct Fence {
    pub(crate) raw: vk::Semaphore,
    device: Arc<Device>,
}

impl Fence {
    pub fn new(device: &Arc<Device>, name: &str, initial_value: u64) -> Result<Arc<Self>> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let raw = unsafe {
            device
                .shared
                .raw
                .create_semaphore(&semaphore_info, None)
                .with_context(|| "Failed to create timeline semaphore!")?
        };
        device.shared.set_object_name(raw, "fence", name);

        Ok(Arc::new(Self {
            raw,
            device: device.clone(),
        }))
    }

    /// Current value observed on the GPU timeline.
    pub fn value(&self) -> Result<u64> {
        let value = unsafe {
            self.device
                .shared
                .raw
                .get_semaphore_counter_value(self.raw)?
        };
        Ok(value)
    }

    /// Signals the timeline from the host.
    pub fn signal(&self, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.raw)
            .value(value);
        unsafe {
            self.device.shared.raw.signal_semaphore(&signal_info)?;
        }
        Ok(())
    }

    /// Blocks until the timeline reaches `value` or the timeout elapses.
    /// Returns whether the value was reached.
    pub fn wait_for_value(&self, value: u64, timeout_ns: u64) -> Result<bool> {
        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        let result = unsafe { self.device.shared.raw.wait_semaphores(&wait_info, timeout_ns) };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(error) => Err(error).with_context(|| "Failed waiting on timeline semaphore!"),
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.schedule_destruction_semaphore(self.raw);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    Signaled,
    Unsignaled,
}

/// Device event for fine grained barrier handshakes inside a queue.
pub struct Event {
    pub(crate) raw: vk::Event,
    device: Arc<Device>,
}

impl Event {
    pub fn new(device: &Arc<Device>, name: &str) -> Result<Arc<Self>> {
        let event_info = vk::EventCreateInfo::default();
        let raw = unsafe {
            device
                .shared
                .raw
                .create_event(&event_info, None)
                .with_context(|| "Failed to create event!")?
        };
        device.shared.set_object_name(raw, "event", name);

        Ok(Arc::new(Self {
            raw,
            device: device.clone(),
        }))
    }

    pub fn state(&self) -> Result<EventState> {
        let signaled = unsafe { self.device.shared.raw.get_event_status(self.raw)? };
        Ok(if signaled {
            EventState::Signaled
        } else {
            EventState::Unsignaled
        })
    }

    /// Signals the event from the host.
    pub fn signal(&self) -> Result<()> {
        unsafe {
            self.device.shared.raw.set_event(self.raw)?;
        }
        Ok(())
    }

    /// Resets the event from the host.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device.shared.raw.reset_event(self.raw)?;
        }
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.device.schedule_destruction_event(self.raw);
    }
}
