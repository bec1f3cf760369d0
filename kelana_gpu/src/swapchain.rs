/*! Surface and swapchain.
 *
 * Surfaces are cached per `instance | window` address key so repeated
 * swapchain creation against the same window reuses the surface. The
 * swapchain owns its images, one acquire and one present semaphore per
 * frame slot and a timeline fence that throttles the CPU to the configured
 * frames in flight.
 */

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::{
    device::{Device, PendingDestructionSwapchain},
    resource::Image,
    sync::{Fence, Semaphore},
    DeviceShared,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Ok,
    TimedOut,
    NotReady,
    Suboptimal,
    Error,
}

fn display_handle_address(handle: RawDisplayHandle) -> u64 {
    match handle {
        RawDisplayHandle::Windows(_) => 0,
        RawDisplayHandle::Xlib(display) => display
            .display
            .map(|display| display.as_ptr() as u64)
            .unwrap_or(0),
        RawDisplayHandle::Xcb(display) => display
            .connection
            .map(|connection| connection.as_ptr() as u64)
            .unwrap_or(0),
        RawDisplayHandle::Wayland(display) => display.display.as_ptr() as u64,
        RawDisplayHandle::AppKit(_) => 0,
        _ => 0,
    }
}

fn window_handle_address(handle: RawWindowHandle) -> u64 {
    match handle {
        RawWindowHandle::Win32(window) => {
            let hinstance = window
                .hinstance
                .map(|hinstance| hinstance.get() as u64)
                .unwrap_or(0);
            hinstance | window.hwnd.get() as u64
        }
        RawWindowHandle::Xlib(window) => window.window as u64,
        RawWindowHandle::Xcb(window) => window.window.get() as u64,
        RawWindowHandle::Wayland(window) => window.surface.as_ptr() as u64,
        RawWindowHandle::AppKit(window) => window.ns_view.as_ptr() as u64,
        _ => 0,
    }
}

/// Cache key combining the native instance/display and window addresses.
pub(crate) fn surface_cache_key(display: RawDisplayHandle, window: RawWindowHandle) -> u64 {
    display_handle_address(display) | window_handle_address(window)
}

/// A cached vulkan surface plus the color formats it advertises.
pub struct Surface {
    pub(crate) raw: vk::SurfaceKHR,
    pub(crate) formats: Vec<vk::SurfaceFormatKHR>,
    device: Arc<DeviceShared>,
}

impl Surface {
    fn new(
        device: &Arc<Device>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        name: &str,
    ) -> Result<Arc<Self>> {
        let shared = &device.shared;
        let raw = unsafe {
            ash_window::create_surface(
                &shared.instance.entry,
                &shared.instance.raw,
                display_handle,
                window_handle,
                None,
            )
            .with_context(|| "Failed to create window surface!")?
        };

        let formats = unsafe {
            shared
                .instance
                .surface_fn
                .get_physical_device_surface_formats(shared.physical_device.raw, raw)?
        };
        shared.set_object_name(raw, "surface", name);

        Ok(Arc::new(Self {
            raw,
            formats,
            device: shared.clone(),
        }))
    }

    pub(crate) fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let capabilities = unsafe {
            self.device
                .instance
                .surface_fn
                .get_physical_device_surface_capabilities(self.device.physical_device.raw, self.raw)?
        };
        Ok(capabilities)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.device
                .instance
                .surface_fn
                .destroy_surface(self.raw, None);
        }
    }
}

/// First preferred format supported by the surface; the surface's first
/// advertised format otherwise.
fn choose_surface_format(
    preferred: &[vk::Format],
    available: &[vk::SurfaceFormatKHR],
) -> vk::SurfaceFormatKHR {
    for format in preferred {
        if let Some(found) = available.iter().find(|available| available.format == *format) {
            return *found;
        }
    }
    available.first().copied().unwrap_or(vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    })
}

fn clamp_swapchain_extent(requested: vk::Extent2D, current: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: requested.width.min(current.width),
        height: requested.height.min(current.height),
    }
}

fn clamp_swapchain_image_count(requested: u32, min: u32, max: u32) -> u32 {
    let max = if max == 0 { u32::MAX } else { max };
    requested.clamp(min, max)
}

/// Timeline value to wait on before acquiring, keeping at most
/// `frames_in_flight` frames between CPU and GPU. `None` during the first
/// frames when nothing can be in flight yet.
fn frame_throttle_wait_value(cpu_elapsed: u64, frames_in_flight: u64) -> Option<u64> {
    (cpu_elapsed >= frames_in_flight).then(|| cpu_elapsed - frames_in_flight + 1)
}

pub struct SwapchainDescriptor<'a> {
    pub name: String,
    pub display_handle: RawDisplayHandle,
    pub window_handle: RawWindowHandle,
    pub preferred_surface_formats: &'a [vk::Format],
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub image_usage: vk::ImageUsageFlags,
    pub present_mode: vk::PresentModeKHR,
}

pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    images: Vec<Arc<Image>>,

    acquire_semaphores: Vec<Arc<Semaphore>>,
    present_semaphores: Vec<Arc<Semaphore>>,
    /// Signalled by the caller's frame submission at each cpu frame value.
    gpu_elapsed_frames: Arc<Fence>,
    cpu_elapsed_frames: AtomicU64,

    current_frame_index: AtomicU32,
    previous_frame_index: AtomicU32,
    next_image_index: AtomicU32,
    state: Mutex<SwapchainState>,

    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    image_usage: vk::ImageUsageFlags,
    present_mode: vk::PresentModeKHR,
    frames_in_flight: u32,
    name: String,

    surface: Arc<Surface>,
    device: Arc<Device>,
}

impl Swapchain {
    pub fn new(device: &Arc<Device>, desc: SwapchainDescriptor) -> Result<Self> {
        let key = surface_cache_key(desc.display_handle, desc.window_handle);
        let surface = {
            let mut cache = device.surface_cache.lock();
            match cache.get(&key) {
                Some(surface) => surface.clone(),
                None => {
                    let surface =
                        Surface::new(device, desc.display_handle, desc.window_handle, &desc.name)?;
                    cache.insert(key, surface.clone());
                    surface
                }
            }
        };

        let loader =
            ash::khr::swapchain::Device::new(&device.shared.instance.raw, &device.shared.raw);
        let format = choose_surface_format(desc.preferred_surface_formats, &surface.formats);

        let (raw, extent, images) = Self::create_raw_swapchain(
            device,
            &loader,
            &surface,
            format,
            desc.extent,
            desc.image_count,
            desc.image_usage,
            desc.present_mode,
            &desc.name,
            vk::SwapchainKHR::null(),
        )?;

        let frames_in_flight = device.config().max_frames_in_flight;
        let mut acquire_semaphores = Vec::with_capacity(frames_in_flight as usize);
        let mut present_semaphores = Vec::with_capacity(frames_in_flight as usize);
        for index in 0..frames_in_flight {
            acquire_semaphores.push(Semaphore::new(
                device,
                &format!("{}_acquire_{}", desc.name, index),
            )?);
            present_semaphores.push(Semaphore::new(
                device,
                &format!("{}_present_{}", desc.name, index),
            )?);
        }
        let gpu_elapsed_frames =
            Fence::new(device, &format!("{}_gpu_elapsed_frames", desc.name), 0)?;

        Ok(Self {
            loader,
            raw,
            images,
            acquire_semaphores,
            present_semaphores,
            gpu_elapsed_frames,
            cpu_elapsed_frames: AtomicU64::new(0),
            current_frame_index: AtomicU32::new(0),
            previous_frame_index: AtomicU32::new(0),
            next_image_index: AtomicU32::new(0),
            state: Mutex::new(SwapchainState::Ok),
            format,
            extent,
            image_usage: desc.image_usage,
            present_mode: desc.present_mode,
            frames_in_flight,
            name: desc.name,
            surface,
            device: device.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_raw_swapchain(
        device: &Arc<Device>,
        loader: &ash::khr::swapchain::Device,
        surface: &Arc<Surface>,
        format: vk::SurfaceFormatKHR,
        requested_extent: vk::Extent2D,
        requested_image_count: u32,
        image_usage: vk::ImageUsageFlags,
        present_mode: vk::PresentModeKHR,
        name: &str,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<(vk::SwapchainKHR, vk::Extent2D, Vec<Arc<Image>>)> {
        let capabilities = surface.capabilities()?;

        let extent = clamp_swapchain_extent(requested_extent, capabilities.current_extent);
        let image_count = clamp_swapchain_image_count(
            requested_image_count,
            capabilities.min_image_count,
            capabilities.max_image_count,
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .with_context(|| "Failed to create swapchain!")?
        };
        device.shared.set_object_name(raw, "swapchain", name);

        let raw_images = unsafe { loader.get_swapchain_images(raw)? };
        let images = raw_images
            .into_iter()
            .enumerate()
            .map(|(index, raw_image)| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(raw_image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                let raw_view = unsafe { device.shared.raw.create_image_view(&view_info, None)? };
                device
                    .shared
                    .set_object_name(raw_image, "image", &format!("{}_image_{}", name, index));

                Ok(Arc::new(Image::from_swapchain_handle(
                    device.clone(),
                    raw_image,
                    raw_view,
                    format.format,
                    extent,
                )))
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Swapchain {}: {} images at {}x{}",
            name,
            images.len(),
            extent.width,
            extent.height
        );

        Ok((raw, extent, images))
    }

    pub fn state(&self) -> SwapchainState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SwapchainState) {
        *self.state.lock() = state;
    }

    pub fn image_format(&self) -> vk::Format {
        self.format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn cpu_frame_count(&self) -> u64 {
        self.cpu_elapsed_frames.load(Ordering::Acquire)
    }

    pub fn gpu_frame_count(&self) -> Result<u64> {
        self.gpu_elapsed_frames.value()
    }

    /// The frame timeline the caller's submissions must signal at each cpu
    /// frame value to keep the throttle moving.
    pub fn gpu_frame_fence(&self) -> &Arc<Fence> {
        &self.gpu_elapsed_frames
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame_index.load(Ordering::Acquire)
    }

    pub fn previous_frame_index(&self) -> u32 {
        self.previous_frame_index.load(Ordering::Acquire)
    }

    pub fn next_image_index(&self) -> u32 {
        self.next_image_index.load(Ordering::Acquire)
    }

    pub fn current_image(&self) -> Arc<Image> {
        self.images[self.next_image_index() as usize].clone()
    }

    pub(crate) fn current_image_raw(&self) -> vk::Image {
        self.images[self.next_image_index() as usize].raw
    }

    /// Semaphore signalled by the most recent acquire; wait on it before
    /// writing the acquired image.
    pub fn current_acquire_semaphore(&self) -> Arc<Semaphore> {
        self.acquire_semaphores[self.current_frame_index() as usize].clone()
    }

    /// Semaphore presentation waits on; signal it on the frame's last
    /// submission.
    pub fn current_present_semaphore(&self) -> Arc<Semaphore> {
        self.present_semaphores[self.current_frame_index() as usize].clone()
    }

    pub(crate) fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub(crate) fn loader(&self) -> &ash::khr::swapchain::Device {
        &self.loader
    }

    /// Acquires the next image, first throttling the CPU to the configured
    /// frames in flight against the gpu frame fence.
    pub fn acquire_next_image(&self) -> Result<Arc<Image>> {
        let cpu_elapsed = self.cpu_elapsed_frames.load(Ordering::Acquire);
        if let Some(wait_value) =
            frame_throttle_wait_value(cpu_elapsed, self.frames_in_flight as u64)
        {
            self.gpu_elapsed_frames.wait_for_value(wait_value, u64::MAX)?;
        }

        let frame_index = (cpu_elapsed % self.frames_in_flight as u64) as u32;
        self.previous_frame_index
            .store(self.current_frame_index.load(Ordering::Acquire), Ordering::Release);
        self.current_frame_index.store(frame_index, Ordering::Release);

        let acquire_semaphore = self.acquire_semaphores[frame_index as usize].raw;
        let result = unsafe {
            self.loader.acquire_next_image(
                self.raw,
                u64::MAX - 1,
                acquire_semaphore,
                vk::Fence::null(),
            )
        };

        let (image_index, state) = match result {
            Ok((image_index, false)) => (image_index, SwapchainState::Ok),
            Ok((image_index, true)) => (image_index, SwapchainState::Suboptimal),
            Err(vk::Result::TIMEOUT) => {
                self.set_state(SwapchainState::TimedOut);
                return Err(anyhow::anyhow!("Swapchain image acquisition timed out"));
            }
            Err(vk::Result::NOT_READY) => {
                self.set_state(SwapchainState::NotReady);
                return Err(anyhow::anyhow!("Swapchain has no image ready"));
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.set_state(SwapchainState::Error);
                return Err(anyhow::anyhow!(
                    "Swapchain is out of date; resize it to the current window extent"
                ));
            }
            Err(error) => {
                self.set_state(SwapchainState::Error);
                return Err(error).with_context(|| "Failed swapchain image acquisition!");
            }
        };

        self.set_state(state);
        self.next_image_index.store(image_index, Ordering::Release);
        self.cpu_elapsed_frames.fetch_add(1, Ordering::AcqRel);

        Ok(self.images[image_index as usize].clone())
    }

    /// Recreates the swapchain at the new extent. The retired swapchain is
    /// handed to vulkan as `oldSwapchain` and scheduled for deferred
    /// destruction together with its image views.
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        let (raw, extent, images) = Self::create_raw_swapchain(
            &self.device,
            &self.loader,
            &self.surface,
            self.format,
            extent,
            self.images.len() as u32,
            self.image_usage,
            self.present_mode,
            &self.name,
            self.raw,
        )?;

        let retired_views = self.images.iter().map(|image| image.raw_view).collect();
        self.device
            .schedule_destruction_swapchain(PendingDestructionSwapchain {
                loader: self.loader.clone(),
                raw: self.raw,
                image_views: retired_views,
                surface: Some(self.surface.clone()),
            });

        self.raw = raw;
        self.extent = extent;
        self.images = images;
        self.set_state(SwapchainState::Ok);

        log::debug!(
            "Swapchain {} resized to {}x{}",
            self.name,
            extent.width,
            extent.height
        );

        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let image_views = self.images.iter().map(|image| image.raw_view).collect();
        self.device
            .schedule_destruction_swapchain(PendingDestructionSwapchain {
                loader: self.loader.clone(),
                raw: self.raw,
                image_views,
                surface: Some(self.surface.clone()),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn preferred_surface_formats_win_in_order() {
        let available = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];

        let chosen = choose_surface_format(
            &[vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_UNORM],
            &available,
        );
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn unmatched_preferences_fall_back_to_the_first_available() {
        let available = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];

        let chosen = choose_surface_format(&[vk::Format::R16G16B16A16_SFLOAT], &available);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn extent_clamps_per_dimension() {
        let clamped = clamp_swapchain_extent(
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            vk::Extent2D {
                width: 1280,
                height: 1440,
            },
        );
        assert_eq!(clamped.width, 1280);
        assert_eq!(clamped.height, 1080);
    }

    #[test]
    fn image_count_clamps_between_surface_limits() {
        assert_eq!(clamp_swapchain_image_count(3, 2, 8), 3);
        assert_eq!(clamp_swapchain_image_count(1, 2, 8), 2);
        assert_eq!(clamp_swapchain_image_count(16, 2, 8), 8);
        // A zero maximum means the surface imposes no upper bound.
        assert_eq!(clamp_swapchain_image_count(16, 2, 0), 16);
    }

    #[test]
    fn frame_throttle_kicks_in_after_frames_in_flight() {
        assert_eq!(frame_throttle_wait_value(0, 2), None);
        assert_eq!(frame_throttle_wait_value(1, 2), None);
        assert_eq!(frame_throttle_wait_value(2, 2), Some(1));
        assert_eq!(frame_throttle_wait_value(5, 2), Some(4));
        assert_eq!(frame_throttle_wait_value(3, 3), Some(1));
    }

    #[test]
    fn surface_cache_keys_combine_display_and_window() {
        let window = RawWindowHandle::Xlib(raw_window_handle::XlibWindowHandle::new(0x1234));
        let display = RawDisplayHandle::Xlib(raw_window_handle::XlibDisplayHandle::new(None, 0));
        assert_eq!(surface_cache_key(display, window), 0x1234);

        let other_window = RawWindowHandle::Xlib(raw_window_handle::XlibWindowHandle::new(0x9999));
        assert_ne!(
            surface_cache_key(display, window),
            surface_cache_key(display, other_window)
        );
    }
}
