//! Offscreen render targets.
//!
//! A [`RenderTarget`] is the image a frame slot renders into before it is
//! copied to the surface. Memory comes from gpu-allocator.
//!
//! Render targets are created in `UNDEFINED` layout. Recording code must
//! leave them in `GENERAL` layout before the frame is presented, since the
//! surface copy reads them in that layout.
//!
//! The copy to the surface is a scaled blit when the device can blit between
//! the two formats, otherwise an unscaled copy of the overlapping region.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::device::Device;
use crate::error::RhiResult;

/// Format of every frame render target.
pub const RENDER_TARGET_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// Usage of every frame render target: rendered to, then blitted to the surface.
pub const RENDER_TARGET_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
);

/// How a render target reaches a surface image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceCopy {
    /// Scaled, filtered blit to the full surface extent.
    Blit,
    /// Unscaled copy clamped to the smaller of the two extents.
    Copy,
}

/// Picks the copy method from the optimal-tiling features of the render
/// target format and the surface format.
pub fn choose_surface_copy(
    source: vk::FormatFeatureFlags,
    destination: vk::FormatFeatureFlags,
) -> SurfaceCopy {
    if source.contains(vk::FormatFeatureFlags::BLIT_SRC)
        && destination.contains(vk::FormatFeatureFlags::BLIT_DST)
    {
        SurfaceCopy::Blit
    } else {
        SurfaceCopy::Copy
    }
}

/// Region stretching all of `src` over all of `dst`.
pub fn surface_blit_region(src: vk::Extent2D, dst: vk::Extent2D) -> vk::ImageBlit {
    let corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    vk::ImageBlit::default()
        .src_subresource(color_layers())
        .src_offsets([vk::Offset3D::default(), corner(src)])
        .dst_subresource(color_layers())
        .dst_offsets([vk::Offset3D::default(), corner(dst)])
}

/// Region covering the top-left area both images share.
pub fn surface_copy_region(src: vk::Extent2D, dst: vk::Extent2D) -> vk::ImageCopy {
    vk::ImageCopy::default()
        .src_subresource(color_layers())
        .dst_subresource(color_layers())
        .extent(vk::Extent3D {
            width: src.width.min(dst.width),
            height: src.height.min(dst.height),
            depth: 1,
        })
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .layer_count(1)
}

/// GPU-only 2D color image with its allocation.
pub struct RenderTarget {
    device: Arc<Device>,
    image: vk::Image,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl RenderTarget {
    /// Creates a render target of the given size and format.
    ///
    /// # Errors
    ///
    /// Returns an error if image creation, memory allocation or binding fails.
    /// Partially created resources are released.
    pub fn new(device: Arc<Device>, extent: vk::Extent2D, format: vk::Format) -> RhiResult<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(RENDER_TARGET_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&create_info, None)? };
        let mut target = Self {
            device,
            image,
            allocation: None,
            extent,
            format,
        };

        let requirements = unsafe {
            target
                .device
                .handle()
                .get_image_memory_requirements(image)
        };
        let allocation = target.device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "frame render target",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let bound = unsafe {
            target
                .device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        target.allocation = Some(allocation);
        bound?;

        debug!(
            "Created {}x{} render target ({:?})",
            extent.width, extent.height, format
        );
        Ok(target)
    }

    /// Returns the Vulkan image handle.
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.allocator().lock().free(allocation)
        {
            error!("Failed to free render target allocation: {:?}", e);
        }

        unsafe {
            self.device.handle().destroy_image(self.image, None);
        }

        debug!(
            "Destroyed {}x{} render target",
            self.extent.width, self.extent.height
        );
    }
}
