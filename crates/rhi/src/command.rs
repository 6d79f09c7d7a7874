//! Command allocators and the command buffer pool.
//!
//! This module provides:
//! - [`CommandAllocator`] - Vulkan command pool wrapper owning a batch of buffers
//! - [`CommandChunks`] - the [`ChunkAllocator`] creating one allocator per chunk
//! - [`CommandBufferPool`] - a [`ResourcePool`] of command buffers
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadence_rhi::command::CommandBufferPool;
//! use cadence_rhi::headless::HeadlessDevice;
//! use cadence_rhi::sync::CompletionCounter;
//!
//! # fn example() -> Result<(), cadence_rhi::RhiError> {
//! let device = HeadlessDevice::immediate();
//! let counter = Arc::new(CompletionCounter::new(device.clone(), &Default::default())?);
//! let mut pool = CommandBufferPool::new(device, counter, 4, 16)?;
//!
//! let committed = pool.commit()?;
//! assert_eq!(committed.index, 0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::backend::GpuDevice;
use crate::device::Device;
use crate::error::RhiResult;
use crate::pool::{ChunkAllocator, Commit, ResourcePool};
use crate::sync::CompletionCounter;

/// Vulkan command pool wrapper.
///
/// Owns every command buffer allocated from it; destroying the pool frees
/// them in one call.
///
/// # Thread Safety
///
/// Command pools are externally synchronized. A pool is only ever used by
/// the scheduler that owns it.
pub struct CommandAllocator {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan command pool handle.
    pool: vk::CommandPool,
}

impl CommandAllocator {
    /// Creates a command pool and allocates `count` primary command buffers from it.
    ///
    /// The pool is created with `RESET_COMMAND_BUFFER` so each buffer can be
    /// reset individually when it is reused, and `TRANSIENT` since buffers
    /// are re-recorded for every submission.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or buffer allocation fails. The pool
    /// is destroyed again if only the allocation fails.
    pub fn new(
        device: Arc<Device>,
        queue_family_index: u32,
        count: u32,
    ) -> RhiResult<(Self, Vec<vk::CommandBuffer>)> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        let allocator = Self { device, pool };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe {
            allocator
                .device
                .handle()
                .allocate_command_buffers(&alloc_info)?
        };

        debug!(
            "Command pool created with {} buffer(s) for queue family {}",
            count, queue_family_index
        );

        Ok((allocator, buffers))
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!("Command pool destroyed");
    }
}

/// Chunk storage of a [`CommandBufferPool`]: one allocator and its buffers per chunk.
pub struct CommandChunks<D: GpuDevice> {
    device: Arc<D>,
    chunks: Vec<(D::CommandAllocator, Vec<D::CommandBuffer>)>,
}

impl<D: GpuDevice> CommandChunks<D> {
    fn new(device: Arc<D>) -> Self {
        Self {
            device,
            chunks: Vec::new(),
        }
    }

    /// Command buffer at `slot` of `chunk`.
    pub fn get(&self, chunk: usize, slot: usize) -> Option<D::CommandBuffer> {
        self.chunks
            .get(chunk)
            .and_then(|(_, buffers)| buffers.get(slot))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl<D: GpuDevice> ChunkAllocator for CommandChunks<D> {
    fn allocate(&mut self, begin: usize, end: usize) -> RhiResult<()> {
        let chunk = self.device.create_command_allocator(end - begin)?;
        self.chunks.push(chunk);
        Ok(())
    }
}

/// A command buffer handed out by [`CommandBufferPool::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedBuffer<C> {
    /// Buffer ready for recording. It has not been reset.
    pub handle: C,
    /// Chunk the buffer belongs to; stamp it with the tick of the submission using it.
    pub chunk: usize,
    /// Global commit index.
    pub index: u64,
}

/// Pool of command buffers whose reuse is gated on device completion.
pub struct CommandBufferPool<D: GpuDevice> {
    pool: ResourcePool<D, CommandChunks<D>>,
}

impl<D: GpuDevice> fmt::Debug for CommandBufferPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferPool")
            .field("pool", &self.pool)
            .finish()
    }
}

impl<D: GpuDevice> CommandBufferPool<D> {
    /// Creates an empty pool allocating `chunk_size` buffers per allocator.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`](crate::RhiError::InvalidConfig) on a
    /// zero chunk size or fewer than two chunks.
    pub fn new(
        device: Arc<D>,
        counter: Arc<CompletionCounter<D>>,
        chunk_size: usize,
        max_chunks: usize,
    ) -> RhiResult<Self> {
        let pool = ResourcePool::new(counter, CommandChunks::new(device), chunk_size, max_chunks)?;
        Ok(Self { pool })
    }

    /// Returns the next command buffer whose previous submission has completed.
    ///
    /// # Errors
    ///
    /// Propagates allocation and wait failures from [`ResourcePool::commit`].
    pub fn commit(&mut self) -> RhiResult<CommittedBuffer<D::CommandBuffer>> {
        let Commit { index, chunk, slot } = self.pool.commit()?;
        let handle = self.pool.allocator().get(chunk, slot).ok_or_else(|| {
            crate::RhiError::InvalidState(format!(
                "commit {} maps to missing buffer {}:{}",
                index, chunk, slot
            ))
        })?;

        trace!("Committed command buffer {} (chunk {}, slot {})", index, chunk, slot);
        Ok(CommittedBuffer {
            handle,
            chunk,
            index,
        })
    }

    /// Records that `chunk` is used by the submission completing `tick`.
    #[inline]
    pub fn stamp(&mut self, chunk: usize, tick: u64) {
        self.pool.stamp(chunk, tick);
    }

    /// Releases `chunk`'s claim on a tick after its buffer was not submitted.
    #[inline]
    pub fn abandon(&mut self, chunk: usize) {
        self.pool.abandon(chunk);
    }

    /// Number of command allocators created so far.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.pool.chunk_count()
    }

    #[inline]
    pub fn chunk_tick(&self, chunk: usize) -> Option<u64> {
        self.pool.chunk_tick(chunk)
    }
}
