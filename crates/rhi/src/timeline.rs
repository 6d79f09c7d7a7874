//! Device completion timelines.
//!
//! A [`CompletionCounter`](crate::sync::CompletionCounter) follows one
//! [`DeviceTimeline`]. Devices with the `timelineSemaphore` feature signal a
//! timeline semaphore with every submission. Other devices submit each tick
//! with a fence instead; a wait thread retires the fences in submission order
//! and publishes the tick of the last one it saw signalled.
//!
//! ```text
//!   submit(tick 4, fence A) -> pending [(4, A)]
//!   wait thread: wait A, reset A -> completed = 4, A back to the free list
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::sync::TimelineSemaphore;

/// Fences created up front for the fence timeline.
const FENCE_RESERVE: usize = 8;

/// Longest single fence wait before the wait thread checks for shutdown.
const FENCE_WAIT_SLICE: Duration = Duration::from_millis(100);

/// The Vulkan backing of a completion counter.
pub enum DeviceTimeline {
    /// A timeline semaphore signalled to each submission's tick.
    Semaphore(TimelineSemaphore),
    /// One fence per submission, retired by a wait thread.
    Fences(FenceTimeline),
}

impl DeviceTimeline {
    /// Last tick known to have completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be queried or has been lost.
    pub fn value(&self) -> RhiResult<u64> {
        match self {
            Self::Semaphore(semaphore) => semaphore.value(),
            Self::Fences(fences) => fences.value(),
        }
    }

    /// Blocks until `value` is reached or `timeout` elapses. Returns `Ok(false)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails or the device has been lost.
    pub fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        match self {
            Self::Semaphore(semaphore) => semaphore.wait(value, timeout),
            Self::Fences(fences) => fences.wait(value, timeout),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    /// Submitted fences, oldest first. The front is being waited on.
    pending: VecDeque<(u64, vk::Fence)>,
    /// Unsignalled fences ready for reuse.
    free: Vec<vk::Fence>,
    completed: u64,
    failure: Option<String>,
    stopping: bool,
}

/// Bookkeeping shared between submitters, waiters and the wait thread.
struct FenceTracker {
    state: Mutex<TrackerState>,
    submitted: Condvar,
    retired: Condvar,
}

impl FenceTracker {
    fn new(free: Vec<vk::Fence>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                free,
                ..Default::default()
            }),
            submitted: Condvar::new(),
            retired: Condvar::new(),
        }
    }

    fn take_free(&self) -> Option<vk::Fence> {
        self.state.lock().free.pop()
    }

    fn push(&self, tick: u64, fence: vk::Fence) {
        self.state.lock().pending.push_back((tick, fence));
        self.submitted.notify_one();
    }

    /// Blocks until a fence is pending and returns it without dequeuing.
    /// Returns `None` once the tracker is stopping.
    fn next(&self) -> Option<(u64, vk::Fence)> {
        let mut state = self.state.lock();
        loop {
            if state.stopping {
                return None;
            }
            if let Some(&front) = state.pending.front() {
                return Some(front);
            }
            self.submitted.wait(&mut state);
        }
    }

    /// Retires the oldest pending fence, which completed `tick`.
    fn retire(&self, tick: u64) {
        let mut state = self.state.lock();
        if let Some((_, fence)) = state.pending.pop_front() {
            state.free.push(fence);
        }
        state.completed = state.completed.max(tick);
        self.retired.notify_all();
    }

    fn fail(&self, reason: String) {
        self.state.lock().failure = Some(reason);
        self.retired.notify_all();
    }

    fn stop(&self) {
        self.state.lock().stopping = true;
        self.submitted.notify_all();
    }

    fn value(&self) -> RhiResult<u64> {
        let state = self.state.lock();
        match &state.failure {
            Some(reason) => Err(RhiError::DeviceLost(reason.clone())),
            None => Ok(state.completed),
        }
    }

    fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.failure {
                return Err(RhiError::DeviceLost(reason.clone()));
            }
            if state.completed >= value {
                return Ok(true);
            }
            if self.retired.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.completed >= value);
            }
        }
    }

    /// Takes every fence out of the tracker. Returns whether any was pending.
    fn drain(&self) -> (Vec<vk::Fence>, bool) {
        let mut state = self.state.lock();
        let had_pending = !state.pending.is_empty();
        let mut fences: Vec<_> = state.pending.drain(..).map(|(_, fence)| fence).collect();
        fences.append(&mut state.free);
        (fences, had_pending)
    }
}

/// Completion timeline for devices without timeline semaphores.
///
/// Every submission carries a fence from a small free list. A dedicated thread
/// waits on the fences in submission order, which the queue also completes in.
pub struct FenceTimeline {
    device: Arc<Device>,
    tracker: Arc<FenceTracker>,
    waiter: Option<JoinHandle<()>>,
}

impl FenceTimeline {
    /// Creates the fence reserve and starts the wait thread.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails or the thread cannot start.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let mut fences = Vec::with_capacity(FENCE_RESERVE);
        for _ in 0..FENCE_RESERVE {
            match create_fence(&device) {
                Ok(fence) => fences.push(fence),
                Err(e) => {
                    destroy_fences(&device, &fences);
                    return Err(e);
                }
            }
        }

        let tracker = Arc::new(FenceTracker::new(fences));
        let spawned = thread::Builder::new().name("fence-wait".to_string()).spawn({
            let device = device.clone();
            let tracker = tracker.clone();
            move || wait_fences(&device, &tracker)
        });
        let waiter = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                destroy_fences(&device, &tracker.drain().0);
                return Err(RhiError::InvalidState(format!(
                    "failed to start fence wait thread: {}",
                    e
                )));
            }
        };

        debug!("Fence timeline created with {} fences", FENCE_RESERVE);
        Ok(Self {
            device,
            tracker,
            waiter: Some(waiter),
        })
    }

    /// Takes an unsignalled fence for the next submission.
    pub(crate) fn acquire_fence(&self) -> RhiResult<vk::Fence> {
        match self.tracker.take_free() {
            Some(fence) => Ok(fence),
            None => create_fence(&self.device),
        }
    }

    /// Hands a submitted fence to the wait thread.
    pub(crate) fn submitted(&self, tick: u64, fence: vk::Fence) {
        self.tracker.push(tick, fence);
    }

    /// Destroys a fence whose submission was rejected.
    pub(crate) fn discard(&self, fence: vk::Fence) {
        destroy_fences(&self.device, &[fence]);
    }

    pub fn value(&self) -> RhiResult<u64> {
        self.tracker.value()
    }

    pub fn wait(&self, value: u64, timeout: Duration) -> RhiResult<bool> {
        self.tracker.wait(value, timeout)
    }
}

impl Drop for FenceTimeline {
    fn drop(&mut self) {
        self.tracker.stop();
        if let Some(waiter) = self.waiter.take()
            && waiter.join().is_err()
        {
            error!("Fence wait thread panicked");
        }

        let (fences, had_pending) = self.tracker.drain();
        if had_pending && let Err(e) = unsafe { self.device.handle().device_wait_idle() } {
            error!("Failed to wait for pending fences while dropping: {:?}", e);
        }
        destroy_fences(&self.device, &fences);
        debug!("Fence timeline destroyed");
    }
}

fn wait_fences(device: &Device, tracker: &FenceTracker) {
    let slice = FENCE_WAIT_SLICE.as_nanos() as u64;
    while let Some((tick, fence)) = tracker.next() {
        let waited = unsafe { device.handle().wait_for_fences(&[fence], true, slice) };
        match waited {
            Ok(()) => {
                if let Err(e) = unsafe { device.handle().reset_fences(&[fence]) } {
                    error!("Failed to reset fence for tick {}: {:?}", tick, e);
                    tracker.fail(format!("fence reset failed: {:?}", e));
                    return;
                }
                tracker.retire(tick);
                trace!("Fence for tick {} signalled", tick);
            }
            Err(vk::Result::TIMEOUT) => {}
            Err(e) => {
                error!("Waiting on fence for tick {} failed: {:?}", tick, e);
                tracker.fail(format!("fence wait for tick {} failed: {:?}", tick, e));
                return;
            }
        }
    }
}

fn create_fence(device: &Device) -> RhiResult<vk::Fence> {
    let create_info = vk::FenceCreateInfo::default();
    let fence = unsafe { device.handle().create_fence(&create_info, None)? };
    Ok(fence)
}

fn destroy_fences(device: &Device, fences: &[vk::Fence]) {
    for &fence in fences {
        unsafe { device.handle().destroy_fence(fence, None) };
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    #[test]
    fn test_fences_retire_in_submission_order() {
        let tracker = FenceTracker::new(vec![fence(1), fence(2)]);

        let a = tracker.take_free().unwrap();
        let b = tracker.take_free().unwrap();
        assert!(tracker.take_free().is_none());
        tracker.push(1, a);
        tracker.push(2, b);

        assert_eq!(tracker.next(), Some((1, a)));
        tracker.retire(1);
        assert_eq!(tracker.value().unwrap(), 1);
        assert_eq!(tracker.next(), Some((2, b)));
        tracker.retire(2);

        assert_eq!(tracker.value().unwrap(), 2);
        assert!(tracker.take_free().is_some());
    }

    #[test]
    fn test_wait_blocks_until_retired() {
        let tracker = Arc::new(FenceTracker::new(vec![fence(1)]));
        let f = tracker.take_free().unwrap();
        tracker.push(1, f);

        let retirer = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                tracker.retire(1);
            })
        };

        assert!(tracker.wait(1, Duration::from_secs(5)).unwrap());
        retirer.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_without_progress() {
        let tracker = FenceTracker::new(Vec::new());
        assert!(!tracker.wait(1, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_failed_fence_reports_device_lost() {
        let tracker = FenceTracker::new(Vec::new());
        tracker.fail("fence wait failed".to_string());

        assert!(tracker.value().unwrap_err().is_device_lost());
        assert!(tracker.wait(1, Duration::from_secs(1)).unwrap_err().is_device_lost());
    }

    #[test]
    fn test_stop_releases_the_wait_thread() {
        let tracker = Arc::new(FenceTracker::new(Vec::new()));
        let waiter = {
            let tracker = tracker.clone();
            thread::spawn(move || tracker.next())
        };

        thread::sleep(Duration::from_millis(20));
        tracker.stop();
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_drain_returns_every_fence() {
        let tracker = FenceTracker::new(vec![fence(1), fence(2)]);
        let f = tracker.take_free().unwrap();
        tracker.push(1, f);

        let (fences, had_pending) = tracker.drain();
        assert_eq!(fences.len(), 2);
        assert!(had_pending);
    }

    #[test]
    fn test_timeline_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceTimeline>();
    }
}
