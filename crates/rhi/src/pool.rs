//! Growable ring of reusable GPU resource chunks.
//!
//! A [`ResourcePool`] hands out resources one index at a time from fixed-size
//! chunks. Each chunk carries the tick of the latest submission that may still
//! reference one of its resources; the pool only moves to a chunk once that
//! tick has completed on the device.
//!
//! # Chunk Selection
//!
//! A new chunk is selected whenever the cursor crosses a chunk boundary.
//! Chunks are kept in least-recently-used order:
//!
//! 1. the LRU chunk is reused if its tick has completed (after one refresh)
//! 2. otherwise, a new chunk is appended while fewer than `max_chunks` exist
//! 3. otherwise, the pool blocks until the LRU chunk's tick completes
//!
//! Steady-state memory is therefore bounded by how many chunks are in flight
//! at once, never by how many resources were ever committed.
//!
//! The resource type itself is opaque here: a [`ChunkAllocator`] creates the
//! backing resources for a chunk and the owner maps `(chunk, slot)` to them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::sync::CompletionCounter;

/// Creates the resources backing one chunk.
pub trait ChunkAllocator {
    /// Appends resources for pool indices `begin..end` as a new chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ResourceExhausted`] when the device cannot create
    /// further handles. The pool is left unchanged and retries on the next commit.
    fn allocate(&mut self, begin: usize, end: usize) -> RhiResult<()>;
}

/// Location of a committed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// Global commit index; strictly increasing from 0.
    pub index: u64,
    /// Ring position of the chunk holding the resource.
    ///
    /// Chunks are reused least recently used first, so this is not
    /// `index / chunk_size` once the ring has wrapped.
    pub chunk: usize,
    /// Position of the resource inside its chunk, `index % chunk_size`.
    pub slot: usize,
}

/// Generic ring pool parameterized over how chunks are allocated.
pub struct ResourcePool<D: GpuDevice, A: ChunkAllocator> {
    counter: Arc<CompletionCounter<D>>,
    allocator: A,
    chunk_size: usize,
    max_chunks: usize,
    /// Completion requirement of each chunk.
    ticks: Vec<u64>,
    /// Chunk ids, least recently selected first.
    ring: VecDeque<usize>,
    current: usize,
    next_index: u64,
}

impl<D: GpuDevice, A: ChunkAllocator> fmt::Debug for ResourcePool<D, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("chunk_size", &self.chunk_size)
            .field("max_chunks", &self.max_chunks)
            .field("ticks", &self.ticks)
            .field("current", &self.current)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl<D: GpuDevice, A: ChunkAllocator> ResourcePool<D, A> {
    /// Creates an empty pool. No chunk is allocated until the first commit.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidConfig`] if `chunk_size` is zero or
    /// `max_chunks` is below two.
    pub fn new(
        counter: Arc<CompletionCounter<D>>,
        allocator: A,
        chunk_size: usize,
        max_chunks: usize,
    ) -> RhiResult<Self> {
        if chunk_size == 0 {
            return Err(RhiError::InvalidConfig(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if max_chunks < 2 {
            return Err(RhiError::InvalidConfig(format!(
                "a pool needs at least 2 chunks to overlap with the device, got {}",
                max_chunks
            )));
        }

        Ok(Self {
            counter,
            allocator,
            chunk_size,
            max_chunks,
            ticks: Vec::new(),
            ring: VecDeque::new(),
            current: 0,
            next_index: 0,
        })
    }

    /// Reserves the next resource, making sure the device is done with it.
    ///
    /// May block in [`CompletionCounter::wait`] when every chunk is in flight
    /// and the pool is at capacity.
    ///
    /// # Errors
    ///
    /// - allocation errors from the [`ChunkAllocator`], unchanged
    /// - [`RhiError::DeviceLost`] if waiting for a chunk fails
    /// - [`RhiError::InvalidState`] if the only reclaimable chunk was never submitted
    pub fn commit(&mut self) -> RhiResult<Commit> {
        let index = self.next_index;
        let slot = (index % self.chunk_size as u64) as usize;
        if slot == 0 {
            self.current = self.select_chunk()?;
        }
        self.next_index += 1;

        Ok(Commit {
            index,
            chunk: self.current,
            slot,
        })
    }

    /// Raises `chunk`'s completion requirement to `tick`.
    pub fn stamp(&mut self, chunk: usize, tick: u64) {
        if let Some(current) = self.ticks.get_mut(chunk) {
            *current = (*current).max(tick);
        }
    }

    /// Gives up the claim of committed resources in `chunk` that will never
    /// be submitted.
    ///
    /// A chunk is tagged with the next tick when it is selected. If nothing
    /// from it reaches the device, that tick would never be signalled, so the
    /// tag is lowered to the last submitted tick. Ticks stamped by real
    /// submissions are kept. No other resource of `chunk` may be awaiting
    /// submission.
    pub fn abandon(&mut self, chunk: usize) {
        let submitted = self.counter.submitted_tick();
        if let Some(current) = self.ticks.get_mut(chunk)
            && *current > submitted
        {
            debug!(
                "Chunk {} holds no submitted work, lowering its tick {} to {}",
                chunk, current, submitted
            );
            *current = submitted;
        }
    }

    fn select_chunk(&mut self) -> RhiResult<usize> {
        if let Some(&lru) = self.ring.front() {
            let tick = self.ticks[lru];
            if self.counter.is_free(tick) || self.counter.refresh()? >= tick {
                return Ok(self.reuse(lru));
            }

            if self.ticks.len() >= self.max_chunks {
                debug!(
                    "All {} chunks in flight, waiting for tick {} to reclaim chunk {}",
                    self.max_chunks, tick, lru
                );
                self.counter.wait(tick)?;
                return Ok(self.reuse(lru));
            }
        }

        self.grow()
    }

    fn reuse(&mut self, chunk: usize) -> usize {
        self.ring.pop_front();
        self.ring.push_back(chunk);
        self.ticks[chunk] = self.counter.submitted_tick() + 1;
        chunk
    }

    fn grow(&mut self) -> RhiResult<usize> {
        let chunk = self.ticks.len();
        let begin = chunk * self.chunk_size;
        self.allocator.allocate(begin, begin + self.chunk_size)?;

        let tick = self.counter.submitted_tick() + 1;
        self.ticks.push(tick);
        self.ring.push_back(chunk);

        debug!(
            "Allocated chunk {} ({} resources, tick {})",
            chunk, self.chunk_size, tick
        );
        Ok(chunk)
    }

    /// Returns the chunk allocator.
    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.ticks.len()
    }

    /// Completion requirement of `chunk`, if it exists.
    #[inline]
    pub fn chunk_tick(&self, chunk: usize) -> Option<u64> {
        self.ticks.get(chunk).copied()
    }

    /// Index the next commit will return.
    #[inline]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    #[inline]
    pub fn counter(&self) -> &Arc<CompletionCounter<D>> {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::headless::HeadlessDevice;

    #[derive(Default)]
    struct RecordingAllocator {
        calls: Vec<(usize, usize)>,
        fail_next: bool,
    }

    impl ChunkAllocator for RecordingAllocator {
        fn allocate(&mut self, begin: usize, end: usize) -> RhiResult<()> {
            if std::mem::take(&mut self.fail_next) {
                return Err(RhiError::ResourceExhausted("no more handles".to_string()));
            }
            self.calls.push((begin, end));
            Ok(())
        }
    }

    fn setup(
        chunk_size: usize,
        max_chunks: usize,
    ) -> (
        Arc<HeadlessDevice>,
        ResourcePool<HeadlessDevice, RecordingAllocator>,
    ) {
        let device = HeadlessDevice::manual();
        let counter = Arc::new(
            CompletionCounter::with_timeouts(
                device.clone(),
                Duration::from_millis(5),
                Some(Duration::from_secs(5)),
            )
            .unwrap(),
        );
        let pool =
            ResourcePool::new(counter, RecordingAllocator::default(), chunk_size, max_chunks)
                .unwrap();
        (device, pool)
    }

    /// Marks `chunk` as used by a new submission and returns its tick.
    fn submit(pool: &mut ResourcePool<HeadlessDevice, RecordingAllocator>, chunk: usize) -> u64 {
        let tick = pool.counter().advance();
        pool.stamp(chunk, tick);
        tick
    }

    #[test]
    fn test_first_five_commits_span_two_chunks() {
        let (_device, mut pool) = setup(4, 16);

        let commits: Vec<_> = (0..5).map(|_| pool.commit().unwrap()).collect();

        let indices: Vec<_> = commits.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(commits[..4].iter().all(|c| c.chunk == 0));
        assert_eq!(commits[3].slot, 3);
        assert_eq!(commits[4].chunk, 1);
        assert_eq!(commits[4].slot, 0);

        assert_eq!(pool.allocator().calls, vec![(0, 4), (4, 8)]);
        assert_eq!(pool.chunk_tick(1), Some(pool.counter().submitted_tick() + 1));
    }

    #[test]
    fn test_chunk_boundary_allocates_exactly_once() {
        let (_device, mut pool) = setup(2, 16);

        pool.commit().unwrap();
        pool.commit().unwrap();
        assert_eq!(pool.allocator().calls.len(), 1);

        pool.commit().unwrap();
        assert_eq!(pool.allocator().calls.len(), 2);

        pool.commit().unwrap();
        assert_eq!(pool.allocator().calls.len(), 2);
    }

    #[test]
    fn test_indices_increase_and_slots_stay_in_chunk() {
        let (device, mut pool) = setup(3, 16);

        for i in 0..20u64 {
            let commit = pool.commit().unwrap();
            assert_eq!(commit.index, i);
            assert_eq!(commit.slot, (i % 3) as usize);
            assert!(commit.chunk < pool.chunk_count());

            let tick = submit(&mut pool, commit.chunk);
            device.signal_timeline(pool.counter().timeline(), tick);
        }

        // Every chunk completed before the next boundary, so one chunk suffices.
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_completed_chunk_is_reused_instead_of_growing() {
        let (device, mut pool) = setup(1, 16);

        let first = pool.commit().unwrap();
        let tick = submit(&mut pool, first.chunk);
        device.signal_timeline(pool.counter().timeline(), tick);

        let second = pool.commit().unwrap();
        assert_eq!(second.chunk, first.chunk);
        assert_eq!(pool.allocator().calls.len(), 1);
    }

    #[test]
    fn test_in_flight_chunk_is_not_reused() {
        let (_device, mut pool) = setup(1, 16);

        let first = pool.commit().unwrap();
        submit(&mut pool, first.chunk);

        let second = pool.commit().unwrap();
        assert_ne!(second.chunk, first.chunk);
        assert_eq!(pool.chunk_count(), 2);
    }

    #[test]
    fn test_full_pool_blocks_until_lru_chunk_completes() {
        let (device, mut pool) = setup(1, 2);

        let a = pool.commit().unwrap();
        let tick_a = submit(&mut pool, a.chunk);
        let b = pool.commit().unwrap();
        submit(&mut pool, b.chunk);
        assert_eq!(pool.chunk_count(), 2);

        let completer = {
            let device = device.clone();
            let counter = pool.counter().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                device.signal_timeline(counter.timeline(), tick_a);
            })
        };

        let started = Instant::now();
        let c = pool.commit().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(c.chunk, a.chunk);
        assert!(pool.counter().completed_tick() >= tick_a);
        assert_eq!(pool.chunk_count(), 2);

        completer.join().unwrap();
    }

    #[test]
    fn test_full_pool_with_unsubmitted_chunks_reports_invalid_state() {
        let (_device, mut pool) = setup(1, 2);

        pool.commit().unwrap();
        pool.commit().unwrap();
        let err = pool.commit().unwrap_err();
        assert!(matches!(err, RhiError::InvalidState(_)));
    }

    #[test]
    fn test_allocation_failure_propagates_and_retries() {
        let (_device, mut pool) = setup(2, 16);
        pool.commit().unwrap();
        pool.commit().unwrap();

        pool.allocator.fail_next = true;
        let err = pool.commit().unwrap_err();
        assert!(matches!(err, RhiError::ResourceExhausted(_)));
        assert_eq!(pool.next_index(), 2);
        assert_eq!(pool.chunk_count(), 1);

        let retry = pool.commit().unwrap();
        assert_eq!(retry.index, 2);
        assert_eq!(retry.chunk, 1);
    }

    #[test]
    fn test_stamp_only_raises_tick() {
        let (_device, mut pool) = setup(1, 4);
        pool.commit().unwrap();
        pool.stamp(0, 7);
        pool.stamp(0, 3);
        assert_eq!(pool.chunk_tick(0), Some(7));
        assert_eq!(pool.chunk_tick(5), None);
    }

    #[test]
    fn test_abandoned_chunk_is_reusable_without_submission() {
        let (_device, mut pool) = setup(1, 2);

        let first = pool.commit().unwrap();
        pool.abandon(first.chunk);
        assert_eq!(pool.chunk_tick(first.chunk), Some(0));

        let second = pool.commit().unwrap();
        assert_eq!(second.chunk, first.chunk);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_abandon_keeps_submitted_ticks() {
        let (_device, mut pool) = setup(2, 4);

        let first = pool.commit().unwrap();
        let tick = submit(&mut pool, first.chunk);
        pool.commit().unwrap();
        pool.abandon(first.chunk);
        assert_eq!(pool.chunk_tick(first.chunk), Some(tick));
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let device = HeadlessDevice::manual();
        let counter = Arc::new(CompletionCounter::new(device, &Default::default()).unwrap());

        let zero = ResourcePool::new(counter.clone(), RecordingAllocator::default(), 0, 4);
        assert!(matches!(zero, Err(RhiError::InvalidConfig(_))));

        let single = ResourcePool::new(counter, RecordingAllocator::default(), 4, 1);
        assert!(matches!(single, Err(RhiError::InvalidConfig(_))));
    }
}
