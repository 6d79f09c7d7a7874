//! Frame slots.

use std::fmt;

use ash::vk;
use cadence_rhi::{GpuDevice, RhiResult};

/// One reusable render-target and signal bundle.
///
/// A frame is handed out by value from
/// [`PresentationCycle::get_frame`](crate::PresentationCycle::get_frame) and
/// must be given back through `present` or `release`.
///
/// # Synchronization Flow
///
/// ```text
/// 1. Caller records into the render target
/// 2. Flush signals render_finished
/// 3. Copy to the surface waits on (acquire, render_finished), signals present_ready
/// 4. Presentation waits on present_ready
/// 5. last_use_tick = tick of the copy; the slot is reused once it completes
/// ```
pub struct Frame<D: GpuDevice> {
    slot: usize,
    target: D::RenderTarget,
    render_finished: D::Signal,
    present_ready: D::Signal,
    pub(crate) last_use_tick: u64,
    extent: vk::Extent2D,
}

impl<D: GpuDevice> fmt::Debug for Frame<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("slot", &self.slot)
            .field("last_use_tick", &self.last_use_tick)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice> Frame<D> {
    pub(crate) fn new(device: &D, slot: usize, extent: vk::Extent2D) -> RhiResult<Self> {
        Ok(Self {
            slot,
            target: device.create_render_target(extent)?,
            render_finished: device.create_signal()?,
            present_ready: device.create_signal()?,
            last_use_tick: 0,
            extent,
        })
    }

    /// Replaces the render target. The previous one must no longer be in use.
    pub(crate) fn recreate_target(&mut self, device: &D, extent: vk::Extent2D) -> RhiResult<()> {
        self.target = device.create_render_target(extent)?;
        self.extent = extent;
        Ok(())
    }

    /// Index of this slot within its presentation cycle.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The image to render into.
    #[inline]
    pub fn render_target(&self) -> &D::RenderTarget {
        &self.target
    }

    #[inline]
    pub fn render_finished(&self) -> &D::Signal {
        &self.render_finished
    }

    #[inline]
    pub fn present_ready(&self) -> &D::Signal {
        &self.present_ready
    }

    /// Tick after which the slot may be rewritten.
    #[inline]
    pub fn last_use_tick(&self) -> u64 {
        self.last_use_tick
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
