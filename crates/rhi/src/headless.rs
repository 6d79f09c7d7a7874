//! Software device for running the submission layer without a GPU.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] entirely on the CPU. It executes
//! nothing, but it tracks the state every handle would have on a real queue
//! and rejects misuse the validation layers would flag:
//!
//! - beginning a command buffer whose previous submission has not completed
//! - submitting a buffer that is not in the executable state
//! - waiting on a signal that nothing has raised
//! - signalling a timeline with a tick that does not increase
//!
//! Completion is controlled by [`CompletionMode`]. In `Immediate` mode every
//! submission completes as soon as it is queued. In `Manual` mode submissions
//! stay pending until the owner calls [`HeadlessDevice::complete_next`],
//! [`HeadlessDevice::complete_through`] or [`HeadlessDevice::complete_all`],
//! which lets tests and the demo simulate a device running behind the CPU.
//!
//! Faults can be injected with [`HeadlessDevice::set_allocator_limit`],
//! [`HeadlessDevice::fail_next_submit`] and [`HeadlessDevice::lose_device`].
//!
//! [`HeadlessSurface`] is the matching [`SwapchainSurface`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::backend::{GpuDevice, Submission};
use crate::error::{RhiError, RhiResult};
use crate::swapchain::{AcquiredImage, SwapchainSurface};

/// When submitted work completes on a [`HeadlessDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work completes as soon as it is submitted.
    Immediate,
    /// Work completes only when the owner says so.
    Manual,
}

/// Timeline primitive of the headless device.
#[derive(Debug)]
pub struct HeadlessTimeline {
    id: u64,
    value: Arc<AtomicU64>,
}

impl HeadlessTimeline {
    /// Current signalled value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// Binary signal of the headless device.
#[derive(Debug)]
pub struct HeadlessSignal {
    id: u64,
    raised: Arc<AtomicBool>,
    _live: LiveHandle,
}

impl HeadlessSignal {
    /// Returns true if the signal has been raised and not yet consumed.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    fn consume(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Command allocator of the headless device. Dropping it releases its buffers.
#[derive(Debug)]
pub struct HeadlessCommandAllocator {
    id: u64,
    _live: LiveHandle,
}

impl HeadlessCommandAllocator {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Command buffer handle of the headless device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessCommandBuffer(u64);

impl HeadlessCommandBuffer {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Render target of the headless device.
#[derive(Debug)]
pub struct HeadlessRenderTarget {
    id: u64,
    extent: vk::Extent2D,
    _live: LiveHandle,
}

impl HeadlessRenderTarget {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Surface image handle of [`HeadlessSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessImage {
    pub index: u32,
}

/// One accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffer: HeadlessCommandBuffer,
    pub tick: u64,
    pub waits: Vec<u64>,
    pub signal: Option<u64>,
}

/// One recorded render-target-to-surface copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    pub command_buffer: HeadlessCommandBuffer,
    pub render_target: u64,
    pub image: HeadlessImage,
    pub extent: vk::Extent2D,
}

/// Decrements a live-object counter when dropped.
#[derive(Debug)]
struct LiveHandle(Arc<AtomicUsize>);

impl LiveHandle {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct LiveCounts {
    allocators: Arc<AtomicUsize>,
    signals: Arc<AtomicUsize>,
    render_targets: Arc<AtomicUsize>,
}

#[derive(Debug)]
enum BufferState {
    Initial,
    Recording,
    Executable,
    Pending { timeline: Arc<AtomicU64>, tick: u64 },
}

struct PendingWork {
    timeline_id: u64,
    timeline: Arc<AtomicU64>,
    tick: u64,
}

#[derive(Default)]
struct State {
    buffers: HashMap<HeadlessCommandBuffer, BufferState>,
    last_ticks: HashMap<u64, u64>,
    pending: VecDeque<PendingWork>,
    submissions: Vec<SubmissionRecord>,
    copies: Vec<CopyRecord>,
    allocator_limit: Option<usize>,
    fail_next_submit: bool,
    allocators_created: usize,
}

/// A [`GpuDevice`] that runs on the CPU.
///
/// # Thread Safety
///
/// All state sits behind one mutex; completion and device loss wake every
/// thread blocked in [`GpuDevice::wait_timeline`].
pub struct HeadlessDevice {
    mode: CompletionMode,
    state: Mutex<State>,
    changed: Condvar,
    lost: AtomicBool,
    next_id: AtomicU64,
    live: LiveCounts,
}

impl HeadlessDevice {
    /// Creates a device with the given completion mode.
    pub fn new(mode: CompletionMode) -> Self {
        debug!("Headless device created ({:?} completion)", mode);
        Self {
            mode,
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            lost: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            live: LiveCounts::default(),
        }
    }

    /// Shared device whose work completes on submission.
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self::new(CompletionMode::Immediate))
    }

    /// Shared device whose work completes on request.
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::new(CompletionMode::Manual))
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Completes the oldest pending submission and returns its tick.
    pub fn complete_next(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let work = state.pending.pop_front()?;
        work.timeline.fetch_max(work.tick, Ordering::AcqRel);
        self.changed.notify_all();
        trace!("Headless tick {} completed", work.tick);
        Some(work.tick)
    }

    /// Completes every pending submission with a tick up to and including `tick`.
    ///
    /// Returns how many submissions completed.
    pub fn complete_through(&self, tick: u64) -> usize {
        let mut state = self.state.lock();
        let mut completed = 0;
        while let Some(work) = state.pending.front() {
            if work.tick > tick {
                break;
            }
            work.timeline.fetch_max(work.tick, Ordering::AcqRel);
            state.pending.pop_front();
            completed += 1;
        }
        if completed > 0 {
            self.changed.notify_all();
        }
        completed
    }

    /// Completes every pending submission.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let completed = state.pending.len();
        for work in state.pending.drain(..) {
            work.timeline.fetch_max(work.tick, Ordering::AcqRel);
        }
        self.changed.notify_all();
        completed
    }

    /// Raises `timeline` to `value` directly, as an external signal would.
    ///
    /// Pending submissions on that timeline up to `value` are retired.
    pub fn signal_timeline(&self, timeline: &HeadlessTimeline, value: u64) {
        let mut state = self.state.lock();
        timeline.value.fetch_max(value, Ordering::AcqRel);
        state
            .pending
            .retain(|work| work.timeline_id != timeline.id || work.tick > value);
        self.changed.notify_all();
    }

    /// Ticks submitted but not yet completed, oldest first.
    pub fn pending_ticks(&self) -> Vec<u64> {
        self.state.lock().pending.iter().map(|w| w.tick).collect()
    }

    /// Limits how many command allocators may be alive at once.
    pub fn set_allocator_limit(&self, limit: Option<usize>) {
        self.state.lock().allocator_limit = limit;
    }

    /// Makes the next call to `submit` fail with [`RhiError::SubmissionFailed`].
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Puts the device into the lost state and wakes every waiter.
    pub fn lose_device(&self) {
        warn!("Headless device lost");
        self.lost.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Every accepted submission, in queue order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Every recorded render-target copy, in recording order.
    pub fn copies(&self) -> Vec<CopyRecord> {
        self.state.lock().copies.clone()
    }

    /// Total command allocators ever created.
    pub fn allocators_created(&self) -> usize {
        self.state.lock().allocators_created
    }

    pub fn live_allocators(&self) -> usize {
        self.live.allocators.load(Ordering::Acquire)
    }

    pub fn live_signals(&self) -> usize {
        self.live.signals.load(Ordering::Acquire)
    }

    pub fn live_render_targets(&self) -> usize {
        self.live.render_targets.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> RhiResult<()> {
        if self.is_lost() {
            Err(RhiError::DeviceLost("headless device lost".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl GpuDevice for HeadlessDevice {
    type Timeline = HeadlessTimeline;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandBuffer = HeadlessCommandBuffer;
    type Signal = HeadlessSignal;
    type RenderTarget = HeadlessRenderTarget;
    type SurfaceImage = HeadlessImage;

    fn create_timeline(&self) -> RhiResult<Self::Timeline> {
        self.check_alive()?;
        Ok(HeadlessTimeline {
            id: self.next_id(),
            value: Arc::new(AtomicU64::new(0)),
        })
    }

    fn timeline_value(&self, timeline: &Self::Timeline) -> RhiResult<u64> {
        self.check_alive()?;
        Ok(timeline.value())
    }

    fn wait_timeline(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Duration,
    ) -> RhiResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            self.check_alive()?;
            if timeline.value() >= value {
                return Ok(true);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                self.check_alive()?;
                return Ok(timeline.value() >= value);
            }
        }
    }

    fn create_command_allocator(
        &self,
        count: usize,
    ) -> RhiResult<(Self::CommandAllocator, Vec<Self::CommandBuffer>)> {
        self.check_alive()?;
        let mut state = self.state.lock();
        if let Some(limit) = state.allocator_limit
            && self.live_allocators() >= limit
        {
            return Err(RhiError::ResourceExhausted(format!(
                "command allocator limit of {} reached",
                limit
            )));
        }

        let allocator = HeadlessCommandAllocator {
            id: self.next_id(),
            _live: LiveHandle::new(&self.live.allocators),
        };
        let buffers: Vec<_> = (0..count)
            .map(|_| HeadlessCommandBuffer(self.next_id()))
            .collect();
        for buffer in &buffers {
            state.buffers.insert(*buffer, BufferState::Initial);
        }
        state.allocators_created += 1;

        trace!(
            "Headless allocator {} created with {} buffer(s)",
            allocator.id, count
        );
        Ok((allocator, buffers))
    }

    fn begin_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&cmd)
            .ok_or_else(|| RhiError::InvalidState(format!("unknown command buffer {:?}", cmd)))?;
        if let BufferState::Pending { timeline, tick } = entry {
            let completed = timeline.load(Ordering::Acquire);
            if completed < *tick {
                return Err(RhiError::InvalidState(format!(
                    "command buffer {:?} reused while tick {} is in flight (completed {})",
                    cmd, tick, completed
                )));
            }
        }
        *entry = BufferState::Recording;
        Ok(())
    }

    fn end_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock();
        match state.buffers.get_mut(&cmd) {
            Some(entry) if matches!(entry, BufferState::Recording) => {
                *entry = BufferState::Executable;
                Ok(())
            }
            other => Err(RhiError::InvalidState(format!(
                "ending command buffer {:?} in state {:?}",
                cmd, other
            ))),
        }
    }

    fn submit(&self, submission: Submission<'_, Self>) -> RhiResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock();

        if std::mem::take(&mut state.fail_next_submit) {
            return Err(RhiError::SubmissionFailed(
                "queue rejected submission".to_string(),
            ));
        }

        let cmd = submission.command_buffer;
        if !matches!(state.buffers.get(&cmd), Some(BufferState::Executable)) {
            return Err(RhiError::InvalidState(format!(
                "submitting command buffer {:?} that is not executable",
                cmd
            )));
        }

        let timeline = submission.timeline;
        let last = state.last_ticks.get(&timeline.id).copied().unwrap_or(0);
        if submission.tick <= last {
            return Err(RhiError::InvalidState(format!(
                "tick {} does not advance timeline past {}",
                submission.tick, last
            )));
        }

        if let Some(unraised) = submission.wait.iter().find(|s| !s.is_raised()) {
            return Err(RhiError::InvalidState(format!(
                "waiting on signal {} that was never raised",
                unraised.id
            )));
        }
        for signal in submission.wait {
            signal.consume();
        }
        if let Some(signal) = submission.signal {
            signal.raise();
        }

        state.last_ticks.insert(timeline.id, submission.tick);
        state.buffers.insert(
            cmd,
            BufferState::Pending {
                timeline: timeline.value.clone(),
                tick: submission.tick,
            },
        );
        state.submissions.push(SubmissionRecord {
            command_buffer: cmd,
            tick: submission.tick,
            waits: submission.wait.iter().map(|s| s.id).collect(),
            signal: submission.signal.map(|s| s.id),
        });

        match self.mode {
            CompletionMode::Immediate => {
                timeline.value.fetch_max(submission.tick, Ordering::AcqRel);
                self.changed.notify_all();
            }
            CompletionMode::Manual => state.pending.push_back(PendingWork {
                timeline_id: timeline.id,
                timeline: timeline.value.clone(),
                tick: submission.tick,
            }),
        }

        trace!("Headless submission {:?}", submission);
        Ok(())
    }

    fn create_signal(&self) -> RhiResult<Self::Signal> {
        self.check_alive()?;
        Ok(HeadlessSignal {
            id: self.next_id(),
            raised: Arc::new(AtomicBool::new(false)),
            _live: LiveHandle::new(&self.live.signals),
        })
    }

    fn create_render_target(&self, extent: vk::Extent2D) -> RhiResult<Self::RenderTarget> {
        self.check_alive()?;
        Ok(HeadlessRenderTarget {
            id: self.next_id(),
            extent,
            _live: LiveHandle::new(&self.live.render_targets),
        })
    }

    fn cmd_copy_to_surface(
        &self,
        cmd: Self::CommandBuffer,
        src: &Self::RenderTarget,
        dst: Self::SurfaceImage,
        dst_extent: vk::Extent2D,
    ) {
        self.state.lock().copies.push(CopyRecord {
            command_buffer: cmd,
            render_target: src.id,
            image: dst,
            extent: dst_extent,
        });
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        loop {
            self.check_alive()?;
            if state.pending.is_empty() {
                return Ok(());
            }
            self.changed.wait(&mut state);
        }
    }
}

/// A [`SwapchainSurface`] backed by a [`HeadlessDevice`].
///
/// Images are handed out round-robin. Acquisition raises the slot's acquire
/// signal; presentation consumes the signal it is given, so a presentation
/// that was not ordered after its copy is rejected.
pub struct HeadlessSurface {
    extent: vk::Extent2D,
    image_count: u32,
    next_image: u32,
    acquire_signals: Vec<HeadlessSignal>,
    next_signal: usize,
    invalid_acquires: usize,
    invalid_presents: usize,
    needs_recreation: bool,
    presented: Vec<u32>,
    discarded: Vec<u32>,
    recreations: usize,
}

impl HeadlessSurface {
    /// Creates a surface with `image_count` images of the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if the acquire signals cannot be created.
    pub fn new(device: &HeadlessDevice, width: u32, height: u32, image_count: u32) -> RhiResult<Self> {
        let image_count = image_count.max(1);
        let acquire_signals = (0..=image_count)
            .map(|_| device.create_signal())
            .collect::<RhiResult<Vec<_>>>()?;

        Ok(Self {
            extent: vk::Extent2D { width, height },
            image_count,
            next_image: 0,
            acquire_signals,
            next_signal: 0,
            invalid_acquires: 0,
            invalid_presents: 0,
            needs_recreation: false,
            presented: Vec::new(),
            discarded: Vec::new(),
            recreations: 0,
        })
    }

    /// Makes the next acquisition report an out-of-date surface.
    pub fn invalidate_next_acquire(&mut self) {
        self.invalid_acquires += 1;
    }

    /// Makes the next presentation report an out-of-date surface.
    pub fn invalidate_next_present(&mut self) {
        self.invalid_presents += 1;
    }

    /// Image indices presented so far.
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    /// Image indices given up without presentation.
    pub fn discarded(&self) -> &[u32] {
        &self.discarded
    }

    pub fn recreations(&self) -> usize {
        self.recreations
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }
}

impl SwapchainSurface<HeadlessDevice> for HeadlessSurface {
    fn acquire_next_image(&mut self) -> RhiResult<AcquiredImage<HeadlessImage>> {
        if self.invalid_acquires > 0 {
            self.invalid_acquires -= 1;
            self.needs_recreation = true;
            return Err(RhiError::SurfaceInvalidated(
                "surface out of date on acquire".to_string(),
            ));
        }

        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;

        let signal_slot = self.next_signal;
        self.next_signal = (self.next_signal + 1) % self.acquire_signals.len();
        self.acquire_signals[signal_slot].raise();

        Ok(AcquiredImage {
            index,
            image: HeadlessImage { index },
            extent: self.extent,
            suboptimal: false,
            signal_slot,
        })
    }

    fn acquire_signal(&self, acquired: &AcquiredImage<HeadlessImage>) -> &HeadlessSignal {
        &self.acquire_signals[acquired.signal_slot]
    }

    fn present(
        &mut self,
        acquired: &AcquiredImage<HeadlessImage>,
        wait: &HeadlessSignal,
    ) -> RhiResult<()> {
        if !wait.consume() {
            return Err(RhiError::InvalidState(format!(
                "presenting image {} before its wait signal was raised",
                acquired.index
            )));
        }

        if self.invalid_presents > 0 {
            self.invalid_presents -= 1;
            self.needs_recreation = true;
            return Err(RhiError::SurfaceInvalidated(
                "surface out of date on present".to_string(),
            ));
        }

        self.presented.push(acquired.index);
        Ok(())
    }

    fn discard(&mut self, acquired: &AcquiredImage<HeadlessImage>) {
        self.discarded.push(acquired.index);
        self.needs_recreation = true;
    }

    fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        // New images come with fresh acquire signals.
        for signal in &self.acquire_signals {
            signal.consume();
        }
        self.extent = vk::Extent2D { width, height };
        self.next_image = 0;
        self.next_signal = 0;
        self.needs_recreation = false;
        self.recreations += 1;
        debug!("Headless surface recreated at {}x{}", width, height);
        Ok(())
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn submit_one(
        device: &HeadlessDevice,
        timeline: &HeadlessTimeline,
        cmd: HeadlessCommandBuffer,
        tick: u64,
    ) -> RhiResult<()> {
        device.begin_commands(cmd)?;
        device.end_commands(cmd)?;
        device.submit(Submission {
            command_buffer: cmd,
            wait: &[],
            signal: None,
            timeline,
            tick,
        })
    }

    #[test]
    fn test_immediate_mode_completes_on_submit() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(1).unwrap();

        submit_one(&device, &timeline, buffers[0], 1).unwrap();

        assert_eq!(device.timeline_value(&timeline).unwrap(), 1);
        assert!(device.pending_ticks().is_empty());
    }

    #[test]
    fn test_manual_mode_completes_in_order() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(3).unwrap();

        for (i, cmd) in buffers.iter().enumerate() {
            submit_one(&device, &timeline, *cmd, i as u64 + 1).unwrap();
        }
        assert_eq!(device.pending_ticks(), vec![1, 2, 3]);
        assert_eq!(timeline.value(), 0);

        assert_eq!(device.complete_next(), Some(1));
        assert_eq!(timeline.value(), 1);
        assert_eq!(device.complete_through(2), 1);
        assert_eq!(timeline.value(), 2);
        assert_eq!(device.complete_all(), 1);
        assert_eq!(timeline.value(), 3);
        assert_eq!(device.complete_next(), None);
    }

    #[test]
    fn test_in_flight_buffer_cannot_be_restarted() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(1).unwrap();

        submit_one(&device, &timeline, buffers[0], 1).unwrap();
        let err = device.begin_commands(buffers[0]).unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));

        device.complete_all();
        device.begin_commands(buffers[0]).unwrap();
    }

    #[test]
    fn test_submit_requires_ended_buffer() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(1).unwrap();

        device.begin_commands(buffers[0]).unwrap();
        let err = device
            .submit(Submission {
                command_buffer: buffers[0],
                wait: &[],
                signal: None,
                timeline: &timeline,
                tick: 1,
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
    }

    #[test]
    fn test_ticks_must_increase() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(2).unwrap();

        submit_one(&device, &timeline, buffers[0], 1).unwrap();
        let err = submit_one(&device, &timeline, buffers[1], 1).unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
    }

    #[test]
    fn test_wait_on_unraised_signal_is_rejected() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(2).unwrap();
        let signal = device.create_signal().unwrap();

        device.begin_commands(buffers[0]).unwrap();
        device.end_commands(buffers[0]).unwrap();
        let err = device
            .submit(Submission {
                command_buffer: buffers[0],
                wait: &[&signal],
                signal: None,
                timeline: &timeline,
                tick: 1,
            })
            .unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));

        device
            .submit(Submission {
                command_buffer: buffers[0],
                wait: &[],
                signal: Some(&signal),
                timeline: &timeline,
                tick: 1,
            })
            .unwrap();
        assert!(signal.is_raised());

        device.begin_commands(buffers[1]).unwrap();
        device.end_commands(buffers[1]).unwrap();
        device
            .submit(Submission {
                command_buffer: buffers[1],
                wait: &[&signal],
                signal: None,
                timeline: &timeline,
                tick: 2,
            })
            .unwrap();
        assert!(!signal.is_raised());
    }

    #[test]
    fn test_injected_submit_failure_is_one_shot() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let timeline = device.create_timeline().unwrap();
        let (_allocator, buffers) = device.create_command_allocator(1).unwrap();

        device.fail_next_submit();
        let err = submit_one(&device, &timeline, buffers[0], 1).unwrap_err();
        assert!(matches!(err, RhiError::SubmissionFailed(_)));
        assert!(device.submissions().is_empty());

        device.begin_commands(buffers[0]).unwrap();
        device.end_commands(buffers[0]).unwrap();
        device
            .submit(Submission {
                command_buffer: buffers[0],
                wait: &[],
                signal: None,
                timeline: &timeline,
                tick: 1,
            })
            .unwrap();
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn test_allocator_limit_and_live_counts() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        device.set_allocator_limit(Some(1));

        let first = device.create_command_allocator(4).unwrap();
        assert_eq!(device.live_allocators(), 1);
        let err = device.create_command_allocator(4).unwrap_err();
        assert!(matches!(err, RhiError::ResourceExhausted(_)));

        drop(first);
        assert_eq!(device.live_allocators(), 0);
        let _second = device.create_command_allocator(4).unwrap();
        assert_eq!(device.allocators_created(), 2);
    }

    #[test]
    fn test_lost_device_wakes_waiters() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual));
        let timeline = device.create_timeline().unwrap();

        let waiter = {
            let device = device.clone();
            thread::spawn(move || device.wait_timeline(&timeline, 1, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        device.lose_device();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(RhiError::DeviceLost(_))));
    }

    #[test]
    fn test_wait_timeline_times_out() {
        let device = HeadlessDevice::new(CompletionMode::Manual);
        let timeline = device.create_timeline().unwrap();
        let reached = device
            .wait_timeline(&timeline, 1, Duration::from_millis(10))
            .unwrap();
        assert!(!reached);
    }

    #[test]
    fn test_surface_round_robin_and_invalidation() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let mut surface = HeadlessSurface::new(&device, 640, 480, 2).unwrap();

        let first = surface.acquire_next_image().unwrap();
        let second = surface.acquire_next_image().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert!(surface.acquire_signal(&first).is_raised());

        surface.invalidate_next_acquire();
        let err = surface.acquire_next_image().unwrap_err();
        assert!(err.is_frame_transient());
        assert!(surface.needs_recreation());

        surface.recreate(800, 600).unwrap();
        assert!(!surface.needs_recreation());
        assert_eq!(surface.extent().width, 800);
        assert_eq!(surface.recreations(), 1);
    }

    #[test]
    fn test_discarded_image_forces_recreation() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let mut surface = HeadlessSurface::new(&device, 640, 480, 2).unwrap();

        let image = surface.acquire_next_image().unwrap();
        surface.discard(&image);
        assert_eq!(surface.discarded(), &[0]);
        assert!(surface.needs_recreation());
        assert!(surface.presented().is_empty());

        surface.recreate(640, 480).unwrap();
        assert!(!surface.acquire_signal(&image).is_raised());
        assert_eq!(surface.acquire_next_image().unwrap().index, 0);
    }

    #[test]
    fn test_present_requires_raised_signal() {
        let device = HeadlessDevice::new(CompletionMode::Immediate);
        let mut surface = HeadlessSurface::new(&device, 640, 480, 2).unwrap();
        let ready = device.create_signal().unwrap();

        let image = surface.acquire_next_image().unwrap();
        let err = surface.present(&image, &ready).unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));

        ready.raise();
        surface.present(&image, &ready).unwrap();
        assert_eq!(surface.presented(), &[0]);
    }
}
