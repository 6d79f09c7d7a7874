//! Vulkan logical device and queue management.
//!
//! This module handles VkDevice creation, queue retrieval, gpu-allocator
//! initialization, and the [`GpuDevice`] implementation that drives the
//! submission layer on real hardware.
//!
//! # Overview
//!
//! The [`Device`] struct owns:
//! - the logical device, with timeline semaphores enabled when supported
//! - one graphics queue, used for every submission and presentation
//! - the gpu-allocator instance backing render targets
//!
//! Instance creation and physical device selection belong to the embedding
//! application; [`Device::new`] takes their results.
//!
//! Devices without the `timelineSemaphore` feature complete ticks through a
//! [`FenceTimeline`] instead, see [`crate::timeline`].
//!
//! # Example
//!
//! ```no_run
//! use cadence_rhi::device::Device;
//! use ash::vk;
//!
//! # fn example(instance: &ash::Instance, gpu: vk::PhysicalDevice) -> Result<(), cadence_rhi::RhiError> {
//! let device = Device::new(instance, gpu, 0)?;
//! let queue = device.queue();
//! # Ok(())
//! # }
//! ```

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{GpuDevice, Submission};
use crate::command::CommandAllocator;
use crate::error::{RhiError, RhiResult};
use crate::image::{
    RENDER_TARGET_FORMAT, RenderTarget, SurfaceCopy, surface_blit_region, surface_copy_region,
};
use crate::swapchain::SwapchainImage;
use crate::sync::{Semaphore, TimelineSemaphore};
use crate::timeline::{DeviceTimeline, FenceTimeline};

/// Required device extensions.
const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// The [`Device`] is shared across threads using `Arc`. Queue access is
/// serialized internally, and the allocator is protected by a `Mutex`.
pub struct Device {
    /// Vulkan logical device handle.
    device: ash::Device,
    instance: ash::Instance,
    /// Physical device handle.
    physical_device: vk::PhysicalDevice,
    /// GPU memory allocator. Dropped before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    /// Graphics queue, also used for presentation.
    queue: vk::Queue,
    queue_family_index: u32,
    /// Ticks are signalled on a timeline semaphore rather than fences.
    timeline_semaphores: bool,
    /// vkQueueSubmit and vkQueuePresentKHR require external synchronization.
    queue_lock: Mutex<()>,
    /// Lets `&self` trait methods hand an owning reference to the RAII types they create.
    self_ref: Weak<Device>,
}

impl Device {
    /// Creates a new logical device with one queue from `queue_family_index`.
    ///
    /// The family must support graphics and presentation to the target surface.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance (API version 1.2 or later)
    /// * `physical_device` - The selected physical device
    /// * `queue_family_index` - Queue family used for all submissions
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Device creation fails
    /// - Allocator initialization fails
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> RhiResult<Arc<Self>> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];

        let timeline_semaphores = {
            let mut supported_1_2 = vk::PhysicalDeviceVulkan12Features::default();
            let mut supported = vk::PhysicalDeviceFeatures2::default().push_next(&mut supported_1_2);
            unsafe { instance.get_physical_device_features2(physical_device, &mut supported) };
            supported_1_2.timeline_semaphore == vk::TRUE
        };
        if !timeline_semaphores {
            warn!("Timeline semaphores unsupported, completing submissions with fences");
        }

        let mut features_1_2 =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);
        if timeline_semaphores {
            create_info = create_info.push_next(&mut features_1_2);
        }

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };

        info!(
            "Logical device created with {} extension(s), queue family {}",
            DEVICE_EXTENSIONS.len(),
            queue_family_index
        );

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        Ok(Arc::new_cyclic(|self_ref| Self {
            device,
            instance: instance.clone(),
            physical_device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queue,
            queue_family_index,
            timeline_semaphores,
            queue_lock: Mutex::new(()),
            self_ref: self_ref.clone(),
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the queue handle.
    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Returns true if ticks are signalled on a timeline semaphore.
    #[inline]
    pub fn has_timeline_semaphores(&self) -> bool {
        self.timeline_semaphores
    }

    /// Optimal-tiling features of `format` on this device.
    pub fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
                .optimal_tiling_features
        }
    }

    /// Locks the queue for a submission or presentation.
    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock()
    }

    fn shared(&self) -> RhiResult<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| RhiError::InvalidState("device is being destroyed".to_string()))
    }
}

impl GpuDevice for Device {
    type Timeline = DeviceTimeline;
    type CommandAllocator = CommandAllocator;
    type CommandBuffer = vk::CommandBuffer;
    type Signal = Semaphore;
    type RenderTarget = RenderTarget;
    type SurfaceImage = SwapchainImage;

    fn create_timeline(&self) -> RhiResult<Self::Timeline> {
        if self.timeline_semaphores {
            TimelineSemaphore::new(self.shared()?, 0).map(DeviceTimeline::Semaphore)
        } else {
            FenceTimeline::new(self.shared()?).map(DeviceTimeline::Fences)
        }
    }

    fn timeline_value(&self, timeline: &Self::Timeline) -> RhiResult<u64> {
        timeline.value()
    }

    fn wait_timeline(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Duration,
    ) -> RhiResult<bool> {
        timeline.wait(value, timeout)
    }

    fn create_command_allocator(
        &self,
        count: usize,
    ) -> RhiResult<(Self::CommandAllocator, Vec<Self::CommandBuffer>)> {
        let count = u32::try_from(count).map_err(|_| {
            RhiError::InvalidConfig(format!("{} command buffers per allocator", count))
        })?;
        CommandAllocator::new(self.shared()?, self.queue_family_index, count)
    }

    fn begin_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn submit(&self, submission: Submission<'_, Self>) -> RhiResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submission.wait.iter().map(|s| s.handle()).collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let command_buffers = [submission.command_buffer];

        match submission.timeline {
            DeviceTimeline::Semaphore(timeline) => {
                // Values for binary semaphores are ignored but must be present.
                let wait_values = vec![0u64; wait_semaphores.len()];

                let mut signal_semaphores = vec![timeline.handle()];
                let mut signal_values = vec![submission.tick];
                if let Some(signal) = submission.signal {
                    signal_semaphores.push(signal.handle());
                    signal_values.push(0);
                }

                let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&wait_values)
                    .signal_semaphore_values(&signal_values);

                let submit_info = vk::SubmitInfo::default()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .command_buffers(&command_buffers)
                    .signal_semaphores(&signal_semaphores)
                    .push_next(&mut timeline_info);

                let _queue = self.lock_queue();
                unsafe {
                    self.device
                        .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
                }
            }
            DeviceTimeline::Fences(timeline) => {
                let signal_semaphores: Vec<vk::Semaphore> =
                    submission.signal.iter().map(|s| s.handle()).collect();

                let submit_info = vk::SubmitInfo::default()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .command_buffers(&command_buffers)
                    .signal_semaphores(&signal_semaphores);

                let fence = timeline.acquire_fence()?;
                let submitted = {
                    let _queue = self.lock_queue();
                    unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
                };
                match submitted {
                    Ok(()) => timeline.submitted(submission.tick, fence),
                    Err(e) => {
                        timeline.discard(fence);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    fn create_signal(&self) -> RhiResult<Self::Signal> {
        Semaphore::new(self.shared()?)
    }

    fn create_render_target(&self, extent: vk::Extent2D) -> RhiResult<Self::RenderTarget> {
        RenderTarget::new(self.shared()?, extent, RENDER_TARGET_FORMAT)
    }

    fn cmd_copy_to_surface(
        &self,
        cmd: Self::CommandBuffer,
        src: &Self::RenderTarget,
        dst: Self::SurfaceImage,
        dst_extent: vk::Extent2D,
    ) {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);

        // The surface image's previous contents are discarded.
        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(range);
        let source_ready = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(src.handle())
            .subresource_range(range);

        let to_present = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(range);

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer, source_ready],
            );
            match dst.copy {
                SurfaceCopy::Blit => self.device.cmd_blit_image(
                    cmd,
                    src.handle(),
                    vk::ImageLayout::GENERAL,
                    dst.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[surface_blit_region(src.extent(), dst_extent)],
                    vk::Filter::LINEAR,
                ),
                // Formats must be size-compatible; the region is clamped to both images.
                SurfaceCopy::Copy => self.device.cmd_copy_image(
                    cmd,
                    src.handle(),
                    vk::ImageLayout::GENERAL,
                    dst.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[surface_copy_region(src.extent(), dst_extent)],
                ),
            }
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("Failed to wait for device idle during drop: {:?}", e);
            }

            // Every allocation must be freed before the allocator goes, and
            // the allocator before the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        debug!("Logical device destroyed");
    }
}

// Safety: Device is Send+Sync because:
// - ash::Device and ash::Instance are Send+Sync
// - vk::PhysicalDevice and vk::Queue are handles, and queue use is serialized by queue_lock
// - Allocator is protected by Mutex
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
