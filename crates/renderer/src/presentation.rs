//! Frame presentation cycle.
//!
//! [`PresentationCycle`] owns a fixed set of [`Frame`] slots and cycles them
//! between the caller and the surface. The slot count bounds how far the CPU
//! can run ahead of the display: once every slot is waiting on the device,
//! [`get_frame`](PresentationCycle::get_frame) blocks.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_rhi::headless::{HeadlessDevice, HeadlessSurface};
//! use cadence_rhi::scheduler::Scheduler;
//! use cadence_rhi::sync::CompletionCounter;
//! use cadence_rhi::vk;
//! use cadence_renderer::PresentationCycle;
//!
//! # fn example() -> Result<(), cadence_rhi::RhiError> {
//! let device = HeadlessDevice::immediate();
//! let config = Default::default();
//! let counter = Arc::new(CompletionCounter::new(device.clone(), &config)?);
//! let mut scheduler = Scheduler::new(device.clone(), counter.clone(), &config)?;
//! let extent = vk::Extent2D { width: 320, height: 240 };
//! let mut cycle = PresentationCycle::new(device.clone(), counter, extent)?;
//! let mut surface = HeadlessSurface::new(&device, 320, 240, 3)?;
//!
//! let frame = cycle.get_frame()?;
//! scheduler.record(|_device, _cmd| {
//!     // draw into frame.render_target()
//! })?;
//! cycle.present(&mut scheduler, &mut surface, frame)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use ash::vk;
use cadence_rhi::scheduler::Scheduler;
use cadence_rhi::sync::CompletionCounter;
use cadence_rhi::{AcquiredImage, GpuDevice, RhiError, RhiResult, SwapchainSurface};
use tracing::{debug, error, trace, warn};

use crate::FRAMES_IN_FLIGHT;
use crate::frame::Frame;

/// Hands out frame slots and returns them to the surface after rendering.
pub struct PresentationCycle<D: GpuDevice> {
    device: Arc<D>,
    counter: Arc<CompletionCounter<D>>,
    /// Slots not on loan, least recently used first.
    free: VecDeque<Frame<D>>,
    frame_count: usize,
    extent: vk::Extent2D,
    newest_tick: u64,
}

impl<D: GpuDevice> fmt::Debug for PresentationCycle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationCycle")
            .field("available", &self.free.len())
            .field("frame_count", &self.frame_count)
            .field("extent", &self.extent)
            .field("newest_tick", &self.newest_tick)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice> PresentationCycle<D> {
    /// Creates [`FRAMES_IN_FLIGHT`] slots with render targets of `extent`.
    ///
    /// # Errors
    ///
    /// Returns an error if a render target or signal cannot be created.
    pub fn new(
        device: Arc<D>,
        counter: Arc<CompletionCounter<D>>,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        Self::with_frame_count(device, counter, extent, FRAMES_IN_FLIGHT)
    }

    /// Creates `frame_count` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`] for zero slots, or a creation error.
    pub fn with_frame_count(
        device: Arc<D>,
        counter: Arc<CompletionCounter<D>>,
        extent: vk::Extent2D,
        frame_count: usize,
    ) -> RhiResult<Self> {
        if frame_count == 0 {
            return Err(RhiError::InvalidConfig(
                "presentation needs at least one frame slot".to_string(),
            ));
        }

        let free = (0..frame_count)
            .map(|slot| Frame::new(&*device, slot, extent))
            .collect::<RhiResult<VecDeque<_>>>()?;

        debug!(
            "Presentation cycle created with {} frame slot(s) at {}x{}",
            frame_count, extent.width, extent.height
        );

        Ok(Self {
            device,
            counter,
            free,
            frame_count,
            extent,
            newest_tick: 0,
        })
    }

    /// Takes the least recently used slot, waiting until the device is done with it.
    ///
    /// # Errors
    ///
    /// - [`RhiError::ResourceExhausted`] if every slot is on loan
    /// - [`RhiError::DeviceLost`] if the wait fails; the slot stays in the cycle
    pub fn get_frame(&mut self) -> RhiResult<Frame<D>> {
        let frame = self.free.pop_front().ok_or_else(|| {
            RhiError::ResourceExhausted(format!(
                "all {} frame slots are on loan",
                self.frame_count
            ))
        })?;

        if !self.counter.is_free(frame.last_use_tick()) {
            trace!(
                "Frame slot {} waiting for tick {}",
                frame.slot(),
                frame.last_use_tick()
            );
        }
        if let Err(e) = self.counter.wait(frame.last_use_tick()) {
            self.free.push_front(frame);
            return Err(e);
        }

        Ok(frame)
    }

    /// Returns a slot to the cycle without presenting it.
    pub fn release(&mut self, frame: Frame<D>) {
        self.newest_tick = self.newest_tick.max(frame.last_use_tick());
        self.free.push_back(frame);
    }

    /// Submits the caller's recorded work and displays `frame`.
    ///
    /// 1. flush the recorded work, signalling `render_finished`
    /// 2. recreate the surface if it asked for it
    /// 3. acquire a surface image
    /// 4. copy the render target into it, waiting on the acquire signal and
    ///    `render_finished`, signalling `present_ready`
    /// 5. present, waiting on `present_ready`
    ///
    /// The frame returns to the cycle whatever the outcome, tagged with the
    /// last tick that used it. Returns the tick of the copy.
    ///
    /// # Errors
    ///
    /// - [`RhiError::SurfaceInvalidated`] if the surface could not be acquired
    ///   (it has been recreated) or presented to
    /// - [`RhiError::SubmissionFailed`] if the queue rejected either submission.
    ///   A rejected copy discards the acquired image, so the surface is
    ///   recreated before the next acquisition
    /// - [`RhiError::DeviceLost`] if the device is gone
    pub fn present<S: SwapchainSurface<D>>(
        &mut self,
        scheduler: &mut Scheduler<D>,
        surface: &mut S,
        mut frame: Frame<D>,
    ) -> RhiResult<u64> {
        let result = self.present_frame(scheduler, surface, &mut frame);
        self.release(frame);
        result
    }

    fn present_frame<S: SwapchainSurface<D>>(
        &self,
        scheduler: &mut Scheduler<D>,
        surface: &mut S,
        frame: &mut Frame<D>,
    ) -> RhiResult<u64> {
        frame.last_use_tick = scheduler.flush(Some(frame.render_finished()))?;

        let acquired = match acquire::<D, S>(surface) {
            Ok(acquired) => acquired,
            Err(e) => {
                // Nothing will wait on render_finished now; retire it so the
                // slot can signal it again.
                frame.last_use_tick = scheduler.flush_with(&[frame.render_finished()], None)?;
                return Err(e);
            }
        };

        let copy_tick = match self.copy_to_surface(scheduler, surface, frame, &acquired) {
            Ok(tick) => tick,
            Err(e) => {
                // The copy never reached the queue. Retire both of its wait
                // signals and give the image back through recreation.
                match scheduler.flush_with(
                    &[surface.acquire_signal(&acquired), frame.render_finished()],
                    None,
                ) {
                    Ok(tick) => frame.last_use_tick = tick,
                    Err(retire) => warn!(
                        "Failed to retire the signals of frame slot {}: {}",
                        frame.slot(),
                        retire
                    ),
                }
                surface.discard(&acquired);
                return Err(e);
            }
        };
        frame.last_use_tick = copy_tick;

        surface.present(&acquired, frame.present_ready())?;

        trace!(
            "Presented frame slot {} to image {} at tick {}",
            frame.slot(),
            acquired.index,
            copy_tick
        );
        Ok(copy_tick)
    }

    /// Records and submits the copy of `frame` into `acquired`.
    fn copy_to_surface<S: SwapchainSurface<D>>(
        &self,
        scheduler: &mut Scheduler<D>,
        surface: &S,
        frame: &Frame<D>,
        acquired: &AcquiredImage<D::SurfaceImage>,
    ) -> RhiResult<u64> {
        let cmd = scheduler.begin_recording()?;
        self.device
            .cmd_copy_to_surface(cmd, frame.render_target(), acquired.image, acquired.extent);
        scheduler.flush_with(
            &[surface.acquire_signal(acquired), frame.render_finished()],
            Some(frame.present_ready()),
        )
    }

    /// Recreates every render target at `extent`.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidState`] if a slot is on loan
    /// - wait or creation errors
    pub fn resize(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        if self.free.len() != self.frame_count {
            return Err(RhiError::InvalidState(format!(
                "cannot resize while {} frame slot(s) are on loan",
                self.frame_count - self.free.len()
            )));
        }

        self.wait_idle()?;
        for frame in self.free.iter_mut() {
            frame.recreate_target(&self.device, extent)?;
        }
        self.extent = extent;

        debug!(
            "Frame render targets recreated at {}x{}",
            extent.width, extent.height
        );
        Ok(())
    }

    /// Blocks until no slot is in use by the device.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the wait fails.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.counter.wait(self.newest_tick)
    }

    /// Number of slots in the cycle.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Slots not currently on loan.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn counter(&self) -> &Arc<CompletionCounter<D>> {
        &self.counter
    }
}

impl<D: GpuDevice> Drop for PresentationCycle<D> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to wait for frame slots while dropping: {}", e);
        }
    }
}

/// Acquires the next surface image, recreating the surface when needed.
fn acquire<D: GpuDevice, S: SwapchainSurface<D>>(
    surface: &mut S,
) -> RhiResult<AcquiredImage<D::SurfaceImage>> {
    if surface.needs_recreation() {
        let extent = surface.extent();
        surface.recreate(extent.width, extent.height)?;
    }

    match surface.acquire_next_image() {
        Err(RhiError::SurfaceInvalidated(reason)) => {
            let extent = surface.extent();
            surface.recreate(extent.width, extent.height)?;
            Err(RhiError::SurfaceInvalidated(reason))
        }
        acquired => acquired,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cadence_rhi::headless::HeadlessDevice;

    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 64,
        height: 32,
    };

    fn cycle(device: &Arc<HeadlessDevice>, frames: usize) -> PresentationCycle<HeadlessDevice> {
        let counter = Arc::new(
            CompletionCounter::with_timeouts(
                device.clone(),
                Duration::from_millis(5),
                Some(Duration::from_secs(2)),
            )
            .unwrap(),
        );
        PresentationCycle::with_frame_count(device.clone(), counter, EXTENT, frames).unwrap()
    }

    #[test]
    fn test_default_cycle_has_fixed_slot_count() {
        let device = HeadlessDevice::immediate();
        let counter = Arc::new(CompletionCounter::new(device.clone(), &Default::default()).unwrap());
        let cycle = PresentationCycle::new(device.clone(), counter, EXTENT).unwrap();

        assert_eq!(cycle.frame_count(), FRAMES_IN_FLIGHT);
        assert_eq!(device.live_render_targets(), FRAMES_IN_FLIGHT);
        assert_eq!(device.live_signals(), 2 * FRAMES_IN_FLIGHT);
    }

    #[test]
    fn test_zero_slots_rejected() {
        let device = HeadlessDevice::immediate();
        let counter = Arc::new(CompletionCounter::new(device.clone(), &Default::default()).unwrap());
        let result = PresentationCycle::with_frame_count(device, counter, EXTENT, 0);
        assert!(matches!(result, Err(RhiError::InvalidConfig(_))));
    }

    #[test]
    fn test_slots_rotate_least_recently_used_first() {
        let device = HeadlessDevice::immediate();
        let mut cycle = cycle(&device, 3);

        let a = cycle.get_frame().unwrap();
        assert_eq!(a.slot(), 0);
        cycle.release(a);

        let b = cycle.get_frame().unwrap();
        assert_eq!(b.slot(), 1);
        cycle.release(b);

        let c = cycle.get_frame().unwrap();
        assert_eq!(c.slot(), 2);
        cycle.release(c);

        assert_eq!(cycle.get_frame().unwrap().slot(), 0);
    }

    #[test]
    fn test_all_slots_on_loan_is_exhaustion() {
        let device = HeadlessDevice::immediate();
        let mut cycle = cycle(&device, 2);

        let a = cycle.get_frame().unwrap();
        let b = cycle.get_frame().unwrap();
        assert_eq!(cycle.available(), 0);

        let Err(err) = cycle.get_frame() else {
            panic!("a third frame was handed out from two slots");
        };
        assert!(matches!(err, RhiError::ResourceExhausted(_)));

        cycle.release(a);
        cycle.release(b);
        assert_eq!(cycle.available(), 2);
    }

    #[test]
    fn test_resize_requires_every_slot() {
        let device = HeadlessDevice::immediate();
        let mut cycle = cycle(&device, 2);
        let new_extent = vk::Extent2D {
            width: 128,
            height: 128,
        };

        let loaned = cycle.get_frame().unwrap();
        let err = cycle.resize(new_extent).unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
        cycle.release(loaned);

        cycle.resize(new_extent).unwrap();
        assert_eq!(cycle.extent(), new_extent);
        let frame = cycle.get_frame().unwrap();
        assert_eq!(frame.extent(), new_extent);
        assert_eq!(frame.render_target().extent(), new_extent);
        cycle.release(frame);
        assert_eq!(device.live_render_targets(), 2);
    }

    #[test]
    fn test_dropping_cycle_releases_slots() {
        let device = HeadlessDevice::immediate();
        let cycle = cycle(&device, 3);
        assert_eq!(device.live_render_targets(), 3);

        drop(cycle);
        assert_eq!(device.live_render_targets(), 0);
        assert_eq!(device.live_signals(), 0);
    }
}
