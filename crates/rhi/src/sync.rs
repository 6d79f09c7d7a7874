//! Synchronization primitives.
//!
//! This module provides:
//! - [`CompletionCounter`] - the master tick counter every reuse decision is keyed on
//! - [`TimelineSemaphore`] - the Vulkan primitive backing the counter where supported
//! - [`Semaphore`] - binary GPU-to-GPU signal used between submissions and presentation
//!
//! # Ticks
//!
//! Every submission to the queue is assigned the next tick from
//! [`CompletionCounter::advance`] and signals the timeline to that value when
//! it finishes. Because the queue completes work in order, observing tick `T`
//! on the timeline means every tick `< T` has completed too, so a resource
//! tagged with `T` may be reused once `completed_tick() >= T`.
//!
//! ```text
//!   CPU:  advance() -> 1   advance() -> 2   advance() -> 3
//!   GPU:        ........ 1 done ....... 2 done ...
//!               completed_tick = 0 -> 1 -> 2
//! ```
//!
//! # Example
//!
//! ```
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::sync::CompletionCounter;
//!
//! # fn example() -> Result<(), cadence_rhi::RhiError> {
//! let device = HeadlessDevice::manual();
//! let counter = CompletionCounter::new(device.clone(), &Default::default())?;
//!
//! let tick = counter.advance();
//! assert!(!counter.is_free(tick));
//!
//! device.signal_timeline(counter.timeline(), tick);
//! counter.wait(tick)?;
//! assert_eq!(counter.completed_tick(), tick);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use cadence_core::SchedulerConfig;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::backend::GpuDevice;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Monotonic record of how much submitted work the device has finished.
///
/// `submitted_tick` is advanced by the scheduler once per submission.
/// `completed_tick` follows the device timeline and never decreases.
/// `completed_tick <= submitted_tick` always holds.
///
/// # Thread Safety
///
/// Reads are lock-free and may happen from any thread. [`refresh`](Self::refresh)
/// serializes with itself internally, so several consumers may refresh
/// concurrently without regressing the value.
pub struct CompletionCounter<D: GpuDevice> {
    device: Arc<D>,
    timeline: D::Timeline,
    submitted: AtomicU64,
    completed: AtomicU64,
    refresh_lock: Mutex<()>,
    poll_interval: Duration,
    stall_timeout: Option<Duration>,
}

impl<D: GpuDevice> fmt::Debug for CompletionCounter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCounter")
            .field("submitted", &self.submitted_tick())
            .field("completed", &self.completed_tick())
            .field("poll_interval", &self.poll_interval)
            .field("stall_timeout", &self.stall_timeout)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice> CompletionCounter<D> {
    /// Creates a counter at `submitted = completed = 0` backed by a new device timeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeline cannot be created.
    pub fn new(device: Arc<D>, config: &SchedulerConfig) -> RhiResult<Self> {
        Self::with_timeouts(device, config.wait_poll_interval(), config.stall_timeout())
    }

    /// Creates a counter with explicit wait slicing.
    ///
    /// `stall_timeout` bounds how long [`wait`](Self::wait) tolerates a tick
    /// that makes no progress before declaring the device lost.
    pub fn with_timeouts(
        device: Arc<D>,
        poll_interval: Duration,
        stall_timeout: Option<Duration>,
    ) -> RhiResult<Self> {
        let timeline = device.create_timeline()?;

        debug!(
            "Completion counter created (poll {:?}, stall timeout {:?})",
            poll_interval, stall_timeout
        );

        Ok(Self {
            device,
            timeline,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            poll_interval,
            stall_timeout,
        })
    }

    /// Reserves the next tick and returns it.
    ///
    /// Called exactly once per submission, after the queue accepted it.
    #[inline]
    pub fn advance(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Tick of the most recent submission.
    #[inline]
    pub fn submitted_tick(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Last completed tick observed on the device.
    #[inline]
    pub fn completed_tick(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Returns true when `tick` is known to have completed, without querying the device.
    #[inline]
    pub fn is_free(&self, tick: u64) -> bool {
        self.completed_tick() >= tick
    }

    /// The device timeline this counter follows.
    #[inline]
    pub fn timeline(&self) -> &D::Timeline {
        &self.timeline
    }

    /// Returns the device this counter queries.
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Polls the device for its latest completed tick.
    ///
    /// The stored value only moves forward and is clamped to
    /// `submitted_tick`. Returns the updated completed tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried.
    pub fn refresh(&self) -> RhiResult<u64> {
        let _guard = self.refresh_lock.lock();
        let reported = self.device.timeline_value(&self.timeline)?;
        let value = reported.min(self.submitted_tick());
        let previous = self.completed.fetch_max(value, Ordering::AcqRel);
        Ok(previous.max(value))
    }

    /// Blocks until `tick` has completed on the device.
    ///
    /// Returns immediately when the tick is already known to be complete.
    /// Otherwise the wait proceeds in bounded slices so that a configured
    /// stall timeout can be enforced.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidState`] if `tick` was never submitted, since
    ///   nothing would ever signal it
    /// - [`RhiError::DeviceLost`] if the device fails while waiting or the
    ///   stall timeout elapses
    pub fn wait(&self, tick: u64) -> RhiResult<()> {
        if self.is_free(tick) {
            return Ok(());
        }

        let submitted = self.submitted_tick();
        if tick > submitted {
            return Err(RhiError::InvalidState(format!(
                "waiting on tick {} but only {} submitted",
                tick, submitted
            )));
        }

        if self.refresh().map_err(as_device_lost)? >= tick {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            match self
                .device
                .wait_timeline(&self.timeline, tick, self.poll_interval)
            {
                Ok(true) => break,
                Ok(false) => {
                    let waited = started.elapsed();
                    if let Some(limit) = self.stall_timeout
                        && waited >= limit
                    {
                        error!(
                            "Tick {} made no progress for {:?} (completed {}), treating device as lost",
                            tick,
                            waited,
                            self.completed_tick()
                        );
                        return Err(RhiError::DeviceLost(format!(
                            "tick {} not reached after {:?}",
                            tick, waited
                        )));
                    }
                    trace!("Still waiting for tick {} after {:?}", tick, waited);
                }
                Err(e) => return Err(as_device_lost(e)),
            }
        }

        self.refresh().map_err(as_device_lost)?;
        trace!("Tick {} completed after {:?}", tick, started.elapsed());
        Ok(())
    }
}

fn as_device_lost(err: RhiError) -> RhiError {
    if err.is_device_lost() {
        err
    } else {
        RhiError::DeviceLost(format!("completion wait failed: {}", err))
    }
}

/// Vulkan binary semaphore wrapper.
///
/// Used as the GPU-to-GPU signal between a frame's render submission, its
/// copy to the surface and the presentation engine.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        trace!("Created semaphore");

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        trace!("Destroyed semaphore");
    }
}

/// Vulkan timeline semaphore wrapper.
///
/// Backs [`CompletionCounter`] on Vulkan devices. Requires the
/// `timelineSemaphore` feature (core in Vulkan 1.2).
pub struct TimelineSemaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Creates a timeline semaphore starting at `initial_value`.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created timeline semaphore at {}", initial_value);

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Reads the current counter value.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails (e.g. device lost).
    pub fn value(&self) -> RhiResult<u64> {
        let value = unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Waits until the counter reaches `value`. Returns `Ok(false)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails for a reason other than timeout.
    pub fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe { self.device.handle().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline semaphore");
    }
}
