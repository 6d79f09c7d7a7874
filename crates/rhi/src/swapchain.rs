//! Presentation surfaces.
//!
//! [`SwapchainSurface`] is the interface the presentation cycle consumes:
//! acquire an image, present it after a signal, recreate on invalidation.
//! [`Swapchain`] implements it over `VkSwapchainKHR`;
//! [`HeadlessSurface`](crate::headless::HeadlessSurface) implements it for tests.
//!
//! # Acquire Signals
//!
//! Acquisition raises a binary signal once the image may be written. The
//! surface owns a ring of these signals, one more than its image count, so a
//! signal is never reused while an earlier acquisition might still be pending.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadence_rhi::device::Device;
//! use cadence_rhi::swapchain::{Swapchain, SwapchainSurface};
//! use ash::vk;
//!
//! # fn example(
//! #     entry: &ash::Entry,
//! #     instance: &ash::Instance,
//! #     device: Arc<Device>,
//! #     surface: vk::SurfaceKHR,
//! # ) -> Result<(), cadence_rhi::RhiError> {
//! let mut swapchain = Swapchain::new(entry, instance, device, surface, 1280, 720)?;
//!
//! let acquired = swapchain.acquire_next_image()?;
//! // ... copy into acquired.image, signalling `ready` ...
//! # let ready = swapchain.acquire_signal(&acquired);
//! # let _ = ready;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::GpuDevice;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::image::{RENDER_TARGET_FORMAT, SurfaceCopy, choose_surface_copy};
use crate::sync::Semaphore;

/// An image acquired from a [`SwapchainSurface`].
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage<I> {
    /// Index of the image within the surface.
    pub index: u32,
    /// The image handle.
    pub image: I,
    /// Size of the image.
    pub extent: vk::Extent2D,
    /// The surface still works but no longer matches optimally.
    pub suboptimal: bool,
    /// Acquire signal slot, resolved with [`SwapchainSurface::acquire_signal`].
    pub signal_slot: usize,
}

/// A swapchain image and how frames are transferred into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub copy: SurfaceCopy,
}

/// A set of displayable images with acquire/present primitives.
pub trait SwapchainSurface<D: GpuDevice> {
    /// Acquires the next image to copy into.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceInvalidated`] when the surface is out of date
    /// or lost. No signal is raised in that case.
    fn acquire_next_image(&mut self) -> RhiResult<AcquiredImage<D::SurfaceImage>>;

    /// Signal raised once `acquired` may be written.
    fn acquire_signal(&self, acquired: &AcquiredImage<D::SurfaceImage>) -> &D::Signal;

    /// Queues `acquired` for display once `wait` is raised.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SurfaceInvalidated`] when the surface is out of date or lost.
    fn present(&mut self, acquired: &AcquiredImage<D::SurfaceImage>, wait: &D::Signal)
    -> RhiResult<()>;

    /// Gives up on `acquired` without presenting it.
    ///
    /// Used when the copy into the image could not be submitted. The surface
    /// is flagged for recreation, which returns the image.
    fn discard(&mut self, acquired: &AcquiredImage<D::SurfaceImage>);

    /// Rebuilds the surface images at the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if the new images cannot be created.
    fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()>;

    /// Current image size.
    fn extent(&self) -> vk::Extent2D;

    /// Returns true once an acquire or present reported the surface suboptimal or invalid.
    fn needs_recreation(&self) -> bool;
}

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, min {} images",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Vulkan swapchain wrapper.
///
/// Images are written by transfer (the frame copy), so they are created with
/// `TRANSFER_DST` usage and no image views.
///
/// # Thread Safety
///
/// The swapchain is used only by the thread driving presentation.
pub struct Swapchain {
    device: Arc<Device>,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    /// Swapchain images (owned by the swapchain)
    images: Vec<vk::Image>,
    format: vk::Format,
    copy: SurfaceCopy,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    acquire_semaphores: Vec<Semaphore>,
    next_semaphore: usize,
    needs_recreation: bool,
}

impl Swapchain {
    /// Creates a new swapchain for `surface`.
    ///
    /// - Preferred format: B8G8R8A8_SRGB with SRGB_NONLINEAR color space
    /// - Preferred present mode: MAILBOX, fallback to FIFO
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Surface queries fail
    /// - No suitable format or present mode is available
    /// - Swapchain or semaphore creation fails
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> RhiResult<Self> {
        let surface_loader = ash::khr::surface::Instance::new(entry, instance);
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, device.handle());

        let mut swapchain = Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: vk::Format::UNDEFINED,
            copy: SurfaceCopy::Blit,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            acquire_semaphores: Vec::new(),
            next_semaphore: 0,
            needs_recreation: false,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    /// Creates the swapchain, replacing (and retiring) the current one if any.
    fn build(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let support = SwapchainSupportDetails::query(
            self.device.physical_device(),
            self.surface,
            &self.surface_loader,
        )?;

        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images",
            extent.width, extent.height, surface_format.format, present_mode, image_count
        );

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        self.format = surface_format.format;
        self.copy = choose_surface_copy(
            self.device.format_features(RENDER_TARGET_FORMAT),
            self.device.format_features(surface_format.format),
        );
        if self.copy == SurfaceCopy::Copy {
            warn!(
                "{:?} cannot be blitted to {:?}, frames are copied unscaled",
                RENDER_TARGET_FORMAT, surface_format.format
            );
        }
        self.extent = extent;
        self.present_mode = present_mode;

        self.acquire_semaphores = (0..=self.images.len())
            .map(|_| Semaphore::new(self.device.clone()))
            .collect::<RhiResult<Vec<_>>>()?;
        self.next_semaphore = 0;
        self.needs_recreation = false;

        info!("Swapchain created with {} images", self.images.len());
        Ok(())
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// How frames are transferred into the images.
    #[inline]
    pub fn copy_mode(&self) -> SurfaceCopy {
        self.copy
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn classify(&mut self, result: vk::Result) -> RhiError {
        let err = RhiError::from(result);
        if matches!(err, RhiError::SurfaceInvalidated(_)) {
            self.needs_recreation = true;
        }
        err
    }
}

impl SwapchainSurface<Device> for Swapchain {
    fn acquire_next_image(&mut self) -> RhiResult<AcquiredImage<SwapchainImage>> {
        let slot = self.next_semaphore;
        let semaphore = self.acquire_semaphores[slot].handle();

        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        let (index, suboptimal) = acquired.map_err(|e| self.classify(e))?;

        let image = self.images.get(index as usize).copied().ok_or_else(|| {
            RhiError::SwapchainError(format!("acquired image {} out of range", index))
        })?;

        self.next_semaphore = (slot + 1) % self.acquire_semaphores.len();
        if suboptimal {
            self.needs_recreation = true;
        }

        Ok(AcquiredImage {
            index,
            image: SwapchainImage {
                image,
                copy: self.copy,
            },
            extent: self.extent,
            suboptimal,
            signal_slot: slot,
        })
    }

    fn acquire_signal(&self, acquired: &AcquiredImage<SwapchainImage>) -> &Semaphore {
        &self.acquire_semaphores[acquired.signal_slot]
    }

    fn present(
        &mut self,
        acquired: &AcquiredImage<SwapchainImage>,
        wait: &Semaphore,
    ) -> RhiResult<()> {
        let swapchains = [self.swapchain];
        let image_indices = [acquired.index];
        let wait_semaphores = [wait.handle()];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = {
            let _queue = self.device.lock_queue();
            unsafe {
                self.swapchain_loader
                    .queue_present(self.device.queue(), &present_info)
            }
        };

        match presented {
            Ok(suboptimal) => {
                if suboptimal {
                    self.needs_recreation = true;
                }
                Ok(())
            }
            Err(e) => Err(self.classify(e)),
        }
    }

    fn discard(&mut self, acquired: &AcquiredImage<SwapchainImage>) {
        // An acquired image cannot be handed back except by retiring the swapchain.
        warn!("Discarding swapchain image {} without presenting it", acquired.index);
        self.needs_recreation = true;
    }

    fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        // Acquire semaphores and images may still be referenced by queued work.
        self.device.wait_idle()?;
        info!("Recreating swapchain for new size: {}x{}", width, height);
        self.build(width, height)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader
                    .destroy_swapchain(self.swapchain, None);
            }
            info!(
                "Swapchain destroyed (was {}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
    }
}

/// Chooses the best surface format from the available formats.
///
/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR, then B8G8R8A8_UNORM, then the
/// first format offered.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let find = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    };

    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
        return format;
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_UNORM) {
        warn!("Using fallback surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    warn!(
        "Using first available surface format: {:?}",
        formats[0].format
    );
    formats[0]
}

/// Prefers MAILBOX; FIFO is always available.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Uses the surface's current extent when it is defined, otherwise clamps the
/// requested size to the surface limits.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image more than the minimum, capped by the maximum (0 means unlimited).
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}
