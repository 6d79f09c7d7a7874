//! GPU submission and resource-reuse layer.
//!
//! The CPU records and submits work well ahead of the device executing it,
//! while command buffers, frame images and signals are finite. This crate
//! keeps the two in step:
//! - [`CompletionCounter`] tracks how far the device has got, as a tick
//! - [`ResourcePool`] recycles chunks of resources once their tick completes
//! - [`CommandBufferPool`] is a resource pool of command buffers
//! - [`Scheduler`] records, submits and advances the counter
//!
//! Everything is generic over [`GpuDevice`], implemented for Vulkan by
//! [`device::Device`] and on the CPU by [`headless::HeadlessDevice`].

mod error;

pub mod backend;
pub mod command;
pub mod device;
pub mod headless;
pub mod image;
pub mod pool;
pub mod scheduler;
pub mod swapchain;
pub mod sync;
pub mod timeline;

pub use backend::{GpuDevice, Submission};
pub use command::{CommandBufferPool, CommittedBuffer};
pub use error::{RhiError, RhiResult};
pub use pool::{ChunkAllocator, Commit, ResourcePool};
pub use scheduler::{Scheduler, SubmissionState};
pub use swapchain::{AcquiredImage, SwapchainImage, SwapchainSurface};
pub use sync::CompletionCounter;
pub use timeline::DeviceTimeline;

// Re-export ash types that users might need
pub use ash::vk;
