//! Frame loop driver.
//!
//! [`FrameManager`] wires a [`Scheduler`] and a [`PresentationCycle`] to one
//! [`CompletionCounter`] and applies the frame-boundary error policy:
//!
//! - `SubmissionFailed` and `SurfaceInvalidated` cost one frame. The frame is
//!   skipped with a warning and rendering continues.
//! - everything else (`DeviceLost`, `ResourceExhausted`, ...) is returned to
//!   the application.
//!
//! # Example
//!
//! ```
//! use cadence_core::RenderConfig;
//! use cadence_rhi::headless::{HeadlessDevice, HeadlessSurface};
//! use cadence_renderer::{FrameManager, FrameOutcome};
//!
//! # fn example() -> Result<(), cadence_rhi::RhiError> {
//! let device = HeadlessDevice::immediate();
//! let config = RenderConfig::default();
//! let mut frames = FrameManager::new(device.clone(), &config)?;
//! let mut surface = HeadlessSurface::new(&device, 1280, 720, 3)?;
//!
//! for _ in 0..3 {
//!     match frames.render_frame(&mut surface, |_device, _cmd, _frame| {
//!         // record draw commands targeting _frame.render_target()
//!     })? {
//!         FrameOutcome::Presented { tick } => assert!(tick > 0),
//!         FrameOutcome::Skipped { .. } => {}
//!     }
//! }
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

use ash::vk;
use cadence_core::RenderConfig;
use cadence_rhi::scheduler::Scheduler;
use cadence_rhi::sync::CompletionCounter;
use cadence_rhi::{GpuDevice, RhiError, RhiResult, SwapchainSurface};
use tracing::{info, warn};

use crate::frame::Frame;
use crate::presentation::PresentationCycle;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the surface; `tick` is the submission that copied it.
    Presented { tick: u64 },
    /// The frame was dropped after a transient failure.
    Skipped { reason: String },
}

/// Running totals kept by a [`FrameManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
}

/// Renders and presents frames, one call per frame.
///
/// # Thread Safety
///
/// The frame manager is driven from a single thread. The device may complete
/// work from any thread.
pub struct FrameManager<D: GpuDevice> {
    presentation: PresentationCycle<D>,
    scheduler: Scheduler<D>,
    counter: Arc<CompletionCounter<D>>,
    stats: FrameStats,
}

impl<D: GpuDevice> fmt::Debug for FrameManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameManager")
            .field("presentation", &self.presentation)
            .field("scheduler", &self.scheduler)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice> FrameManager<D> {
    /// Creates the counter, scheduler and presentation cycle for `device`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`] if `config` does not validate, or
    /// any error creating the timeline, frame slots or pools.
    pub fn new(device: Arc<D>, config: &RenderConfig) -> RhiResult<Self> {
        config
            .validate()
            .map_err(|e| RhiError::InvalidConfig(e.to_string()))?;

        let extent = vk::Extent2D {
            width: config.presentation.width,
            height: config.presentation.height,
        };
        let counter = Arc::new(CompletionCounter::new(device.clone(), &config.scheduler)?);
        let scheduler = Scheduler::new(device.clone(), counter.clone(), &config.scheduler)?;
        let presentation = PresentationCycle::new(device, counter.clone(), extent)?;

        info!(
            "Frame manager ready: {} frame slot(s) at {}x{}",
            presentation.frame_count(),
            extent.width,
            extent.height
        );

        Ok(Self {
            presentation,
            scheduler,
            counter,
            stats: FrameStats::default(),
        })
    }

    /// Renders one frame and presents it to `surface`.
    ///
    /// `record` is called with the open command buffer and the frame slot.
    /// Blocks while every slot is still in use by the device.
    ///
    /// # Errors
    ///
    /// Returns every error that is not transient to the frame, most
    /// importantly [`RhiError::DeviceLost`].
    pub fn render_frame<S, F>(&mut self, surface: &mut S, record: F) -> RhiResult<FrameOutcome>
    where
        S: SwapchainSurface<D>,
        F: FnOnce(&D, D::CommandBuffer, &Frame<D>),
    {
        let frame = self.presentation.get_frame()?;

        if let Err(e) = self
            .scheduler
            .record(|device, cmd| record(device, cmd, &frame))
        {
            self.presentation.release(frame);
            return Err(e);
        }

        match self
            .presentation
            .present(&mut self.scheduler, surface, frame)
        {
            Ok(tick) => {
                self.stats.presented += 1;
                Ok(FrameOutcome::Presented { tick })
            }
            Err(e) if e.is_frame_transient() => {
                warn!("Skipping frame: {}", e);
                self.stats.skipped += 1;
                Ok(FrameOutcome::Skipped {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Recreates the frame render targets at a new size.
    ///
    /// # Errors
    ///
    /// Returns wait or creation errors.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        info!("Resizing frame render targets to {}x{}", width, height);
        self.presentation.resize(vk::Extent2D { width, height })
    }

    /// Blocks until every submitted frame has completed.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the wait fails.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.presentation.wait_idle()?;
        self.counter.wait(self.scheduler.last_tick())
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler<D> {
        &self.scheduler
    }

    #[inline]
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<D> {
        &mut self.scheduler
    }

    #[inline]
    pub fn presentation(&self) -> &PresentationCycle<D> {
        &self.presentation
    }

    #[inline]
    pub fn counter(&self) -> &Arc<CompletionCounter<D>> {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use cadence_rhi::device::Device;
    use cadence_rhi::headless::{HeadlessDevice, HeadlessSurface};

    use super::*;

    #[test]
    fn test_invalid_config_is_rejected() {
        let device = HeadlessDevice::immediate();
        let mut config = RenderConfig::default();
        config.scheduler.max_command_chunks = 1;

        let result = FrameManager::new(device, &config);
        assert!(matches!(result, Err(RhiError::InvalidConfig(_))));
    }

    #[test]
    fn test_recording_failure_returns_the_slot() {
        let device = HeadlessDevice::immediate();
        let mut manager = FrameManager::new(device.clone(), &RenderConfig::default()).unwrap();
        let mut surface = HeadlessSurface::new(&device, 1280, 720, 3).unwrap();

        device.set_allocator_limit(Some(0));
        let err = manager.render_frame(&mut surface, |_, _, _| {}).unwrap_err();
        assert!(matches!(err, RhiError::ResourceExhausted(_)));
        assert_eq!(manager.presentation().available(), crate::FRAMES_IN_FLIGHT);

        device.set_allocator_limit(None);
        let outcome = manager.render_frame(&mut surface, |_, _, _| {}).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { .. }));
    }

    #[test]
    fn test_frame_manager_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameManager<HeadlessDevice>>();
        assert_send::<FrameManager<Device>>();
    }
}
