//! Submission scheduling.
//!
//! The [`Scheduler`] is the single writer of the completion counter. It
//! records work into pooled command buffers, submits them, and tags each
//! buffer's chunk with the tick its submission will complete.
//!
//! # State Machine
//!
//! ```text
//!   Idle --begin_recording--> Recording --flush--> Submitted --(device)--> Completed
//!    ^                            |                                           |
//!    +------- failed flush -------+                  begin_recording <--------+
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::scheduler::Scheduler;
//! use cadence_rhi::sync::CompletionCounter;
//!
//! # fn example() -> Result<(), cadence_rhi::RhiError> {
//! let device = HeadlessDevice::immediate();
//! let config = Default::default();
//! let counter = Arc::new(CompletionCounter::new(device.clone(), &config)?);
//! let mut scheduler = Scheduler::new(device, counter, &config)?;
//!
//! scheduler.record(|_device, _cmd| {
//!     // issue commands here
//! })?;
//! let tick = scheduler.flush(None)?;
//! scheduler.wait(tick)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

use cadence_core::SchedulerConfig;
use tracing::{debug, error, trace, warn};

use crate::backend::{GpuDevice, Submission};
use crate::command::{CommandBufferPool, CommittedBuffer};
use crate::error::{RhiError, RhiResult};
use crate::sync::CompletionCounter;

/// Where the scheduler is in its submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Nothing is being recorded and nothing has been submitted since the last failure.
    Idle,
    /// A command buffer is open for recording.
    Recording,
    /// The last flush is executing on the device.
    Submitted,
    /// The device has finished the last flush.
    Completed,
}

/// Records and submits work, advancing the completion counter once per submission.
///
/// One command buffer is recorded at a time. Recording from several threads
/// needs one scheduler per thread or external synchronization.
pub struct Scheduler<D: GpuDevice> {
    device: Arc<D>,
    counter: Arc<CompletionCounter<D>>,
    command_pool: CommandBufferPool<D>,
    recording: Option<CommittedBuffer<D::CommandBuffer>>,
    state: SubmissionState,
    last_tick: u64,
}

impl<D: GpuDevice> fmt::Debug for Scheduler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("last_tick", &self.last_tick)
            .field("command_pool", &self.command_pool)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice> Scheduler<D> {
    /// Creates a scheduler with an empty command buffer pool sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`] for an unusable pool configuration.
    pub fn new(
        device: Arc<D>,
        counter: Arc<CompletionCounter<D>>,
        config: &SchedulerConfig,
    ) -> RhiResult<Self> {
        let command_pool = CommandBufferPool::new(
            device.clone(),
            counter.clone(),
            config.command_buffers_per_chunk,
            config.max_command_chunks,
        )?;

        debug!(
            "Scheduler created ({} command buffers per chunk, at most {} chunks)",
            config.command_buffers_per_chunk, config.max_command_chunks
        );

        Ok(Self {
            device,
            counter,
            command_pool,
            recording: None,
            state: SubmissionState::Idle,
            last_tick: 0,
        })
    }

    /// Returns the command buffer being recorded, opening a fresh one if needed.
    ///
    /// Opening a buffer may block until the device has finished with it.
    ///
    /// # Errors
    ///
    /// Propagates pool failures (`ResourceExhausted`, `DeviceLost`) and
    /// failures to begin recording.
    pub fn begin_recording(&mut self) -> RhiResult<D::CommandBuffer> {
        if let Some(current) = &self.recording {
            return Ok(current.handle);
        }

        let committed = self.command_pool.commit()?;
        self.device.begin_commands(committed.handle)?;
        self.recording = Some(committed);
        self.state = SubmissionState::Recording;

        trace!("Recording command buffer {}", committed.index);
        Ok(committed.handle)
    }

    /// Runs `record` against the open command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if no command buffer could be opened.
    pub fn record<R>(&mut self, record: impl FnOnce(&D, D::CommandBuffer) -> R) -> RhiResult<R> {
        let cmd = self.begin_recording()?;
        Ok(record(&self.device, cmd))
    }

    /// Submits the recorded work, raising `signal` when it completes.
    ///
    /// Returns the tick of the submission without waiting for it.
    ///
    /// # Errors
    ///
    /// See [`flush_with`](Self::flush_with).
    pub fn flush(&mut self, signal: Option<&D::Signal>) -> RhiResult<u64> {
        self.flush_with(&[], signal)
    }

    /// Submits the recorded work after the device has seen every signal in `wait`.
    ///
    /// Flushing with nothing recorded submits an empty command buffer, so the
    /// tick still advances and `signal` is still raised.
    ///
    /// # Errors
    ///
    /// - [`RhiError::SubmissionFailed`] if the queue rejected the work; the
    ///   buffer is dropped, the counter does not advance and the scheduler
    ///   returns to `Idle`
    /// - [`RhiError::DeviceLost`] if the device is gone
    pub fn flush_with(
        &mut self,
        wait: &[&D::Signal],
        signal: Option<&D::Signal>,
    ) -> RhiResult<u64> {
        self.begin_recording()?;
        let Some(committed) = self.recording.take() else {
            return Err(RhiError::InvalidState(
                "no command buffer open after begin_recording".to_string(),
            ));
        };

        let tick = self.counter.submitted_tick() + 1;
        let submitted = self.device.end_commands(committed.handle).and_then(|()| {
            self.device.submit(Submission {
                command_buffer: committed.handle,
                wait,
                signal,
                timeline: self.counter.timeline(),
                tick,
            })
        });

        if let Err(e) = submitted {
            self.state = SubmissionState::Idle;
            self.command_pool.abandon(committed.chunk);
            let err = e.into_submission_failure();
            warn!(
                "Dropping command buffer {} after failed submission: {}",
                committed.index, err
            );
            return Err(err);
        }

        let advanced = self.counter.advance();
        debug_assert_eq!(advanced, tick);
        self.command_pool.stamp(committed.chunk, tick);
        self.last_tick = tick;
        self.state = SubmissionState::Submitted;

        trace!(
            "Submitted command buffer {} as tick {} ({} wait(s))",
            committed.index,
            tick,
            wait.len()
        );
        Ok(tick)
    }

    /// Flushes and blocks until the submission has completed.
    ///
    /// # Errors
    ///
    /// Returns flush errors, or [`RhiError::DeviceLost`] if the wait fails.
    pub fn finish(&mut self, signal: Option<&D::Signal>) -> RhiResult<u64> {
        let tick = self.flush(signal)?;
        self.counter.wait(tick)?;
        Ok(tick)
    }

    /// Blocks until `tick` has completed.
    ///
    /// If `tick` is the one the next flush would produce, the pending work is
    /// flushed first so the wait can make progress.
    ///
    /// # Errors
    ///
    /// Returns flush errors, or the errors of [`CompletionCounter::wait`].
    pub fn wait(&mut self, tick: u64) -> RhiResult<()> {
        if tick == self.counter.submitted_tick() + 1 {
            self.flush(None)?;
        }
        self.counter.wait(tick)
    }

    /// Returns true if `tick` is known to be complete.
    #[inline]
    pub fn is_free(&self, tick: u64) -> bool {
        self.counter.is_free(tick)
    }

    /// Current position in the submission cycle.
    pub fn state(&self) -> SubmissionState {
        match self.state {
            SubmissionState::Submitted if self.counter.is_free(self.last_tick) => {
                SubmissionState::Completed
            }
            state => state,
        }
    }

    /// Tick of the most recent submission.
    #[inline]
    pub fn submitted_tick(&self) -> u64 {
        self.counter.submitted_tick()
    }

    /// Tick of the last successful flush from this scheduler.
    #[inline]
    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    #[inline]
    pub fn counter(&self) -> &Arc<CompletionCounter<D>> {
        &self.counter
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline]
    pub fn command_pool(&self) -> &CommandBufferPool<D> {
        &self.command_pool
    }
}

impl<D: GpuDevice> Drop for Scheduler<D> {
    fn drop(&mut self) {
        // Command allocators must outlive the work recorded from them.
        if self.last_tick > 0
            && let Err(e) = self.counter.wait(self.last_tick)
        {
            error!(
                "Failed to wait for tick {} while dropping scheduler: {}",
                self.last_tick, e
            );
        }
        debug!("Scheduler destroyed at tick {}", self.last_tick);
    }
}
