//! Device context abstraction.
//!
//! [`GpuDevice`] is the boundary between the submission/reuse discipline in
//! this crate and whatever actually executes the work. Components receive the
//! device as a shared `Arc` and never own it; the device outlives every
//! component that references it.
//!
//! Two implementations ship with the crate:
//! - [`Device`](crate::device::Device), a Vulkan logical device driven through `ash`
//! - [`HeadlessDevice`](crate::headless::HeadlessDevice), a software device used by
//!   tests, CI and the demo binary
//!
//! Every owned resource type (`Timeline`, `CommandAllocator`, `Signal`,
//! `RenderTarget`) releases its GPU object when dropped. Dropping a command
//! allocator frees every command buffer allocated from it.

use std::fmt;
use std::time::Duration;

use ash::vk;

use crate::error::RhiResult;

/// A device/queue pair able to record, submit and report completion of work.
pub trait GpuDevice: Send + Sync + Sized + 'static {
    /// Monotonic device-side counter signalled by submissions.
    type Timeline: Send + Sync;
    /// Owner of a batch of command buffers.
    type CommandAllocator: Send;
    /// Handle used to record commands.
    type CommandBuffer: Copy + PartialEq + fmt::Debug + Send + Sync;
    /// Binary GPU-to-GPU signal.
    type Signal: Send + Sync;
    /// Offscreen image owned by a frame slot.
    type RenderTarget: Send + Sync;
    /// Displayable image owned by the presentation surface.
    type SurfaceImage: Copy + fmt::Debug + Send + Sync;

    /// Creates the timeline backing a completion counter. Its initial value is 0.
    fn create_timeline(&self) -> RhiResult<Self::Timeline>;

    /// Reads the last value the device has signalled on `timeline`.
    fn timeline_value(&self, timeline: &Self::Timeline) -> RhiResult<u64>;

    /// Blocks until `timeline` reaches `value` or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_timeline(
        &self,
        timeline: &Self::Timeline,
        value: u64,
        timeout: Duration,
    ) -> RhiResult<bool>;

    /// Creates one command allocator and exactly `count` command buffers from it.
    fn create_command_allocator(
        &self,
        count: usize,
    ) -> RhiResult<(Self::CommandAllocator, Vec<Self::CommandBuffer>)>;

    /// Resets `cmd` and opens it for one-time-submit recording.
    fn begin_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()>;

    /// Closes recording on `cmd`.
    fn end_commands(&self, cmd: Self::CommandBuffer) -> RhiResult<()>;

    /// Submits one recorded command buffer to the queue.
    fn submit(&self, submission: Submission<'_, Self>) -> RhiResult<()>;

    /// Creates an unsignalled binary signal.
    fn create_signal(&self) -> RhiResult<Self::Signal>;

    /// Creates a render target that can be copied to a surface image.
    fn create_render_target(&self, extent: vk::Extent2D) -> RhiResult<Self::RenderTarget>;

    /// Records a scaled copy of `src` into the surface image `dst`.
    fn cmd_copy_to_surface(
        &self,
        cmd: Self::CommandBuffer,
        src: &Self::RenderTarget,
        dst: Self::SurfaceImage,
        dst_extent: vk::Extent2D,
    );

    /// Blocks until the device has no outstanding work.
    fn wait_idle(&self) -> RhiResult<()>;
}

/// Everything the queue needs to execute one command buffer.
pub struct Submission<'a, D: GpuDevice> {
    /// The recorded command buffer.
    pub command_buffer: D::CommandBuffer,
    /// Signals the device waits on before executing.
    pub wait: &'a [&'a D::Signal],
    /// Binary signal raised when execution finishes.
    pub signal: Option<&'a D::Signal>,
    /// Timeline raised to `tick` when execution finishes.
    pub timeline: &'a D::Timeline,
    /// Tick this submission completes.
    pub tick: u64,
}

impl<D: GpuDevice> fmt::Debug for Submission<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("command_buffer", &self.command_buffer)
            .field("waits", &self.wait.len())
            .field("signals", &self.signal.is_some())
            .field("tick", &self.tick)
            .finish()
    }
}
