//! Fixed-capacity slot pool backing one channel.
//!
//! Slots are allocated once when the arena is built and never resized.
//! Each slot moves through a small lifecycle tracked under the arena lock:
//!
//! ```text
//! Free ──acquire──► Writing ──publish──► Current ──superseded──► Retired
//!   ▲                  │                                            │
//!   └──── abandon ─────┘◄──────────── last reader released ─────────┘
//! ```
//!
//! A slot is only handed to a writer from `Free`, which by construction
//! means no reader holds it. The pixel buffer itself sits behind a
//! per-slot `RwLock` so handles are memory-safe, but the lifecycle above
//! guarantees that lock is never contended.

use crate::error::{LiveCoreError, Result};
use crate::types::{FrameFormat, FrameMeta};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pixel storage plus metadata for one slot
pub struct SlotBuffer {
    data: Box<[u8]>,
    pub meta: FrameMeta,
}

impl SlotBuffer {
    fn new(byte_size: usize) -> Self {
        Self {
            data: vec![0u8; byte_size].into_boxed_slice(),
            meta: FrameMeta::default(),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Split borrow of pixel data and metadata
    #[inline]
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut FrameMeta) {
        (&mut self.data, &mut self.meta)
    }
}

/// Lifecycle phase of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Reusable by the next writer
    Free,
    /// Checked out by exactly one writer
    Writing,
    /// The channel's current frame
    Current,
    /// Superseded but still referenced by readers
    Retired,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    phase: SlotPhase,
    readers: u32,
    generation: u64,
}

/// Counters exposed by an arena
#[derive(Debug, Default)]
pub struct ArenaStats {
    acquired: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
}

impl ArenaStats {
    /// Number of successful slot acquisitions
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Number of acquisitions that failed with `NoCapacity`
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Number of write slots dropped without being published
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// Fixed pool of frame slots
pub struct FrameArena {
    name: String,
    format: FrameFormat,
    buffers: Vec<Arc<RwLock<SlotBuffer>>>,
    state: Mutex<Vec<SlotState>>,
    freed: Condvar,
    stats: ArenaStats,
}

impl FrameArena {
    /// Allocate `capacity` slots of `format.byte_size()` bytes each.
    pub fn new(name: impl Into<String>, format: FrameFormat, capacity: usize) -> Result<Arc<Self>> {
        let name = name.into();
        if capacity == 0 {
            return Err(LiveCoreError::Config(format!(
                "arena '{}' needs at least one slot",
                name
            )));
        }
        if !format.is_valid() {
            return Err(LiveCoreError::Config(format!(
                "arena '{}' has an empty frame format {}",
                name, format
            )));
        }

        let buffers = (0..capacity)
            .map(|_| Arc::new(RwLock::new(SlotBuffer::new(format.byte_size()))))
            .collect();
        let state = vec![
            SlotState {
                phase: SlotPhase::Free,
                readers: 0,
                generation: 0,
            };
            capacity
        ];

        tracing::debug!(
            "Arena '{}' allocated {} slots of {} bytes ({})",
            name,
            capacity,
            format.byte_size(),
            format
        );

        Ok(Arc::new(Self {
            name,
            format,
            buffers,
            state: Mutex::new(state),
            freed: Condvar::new(),
            stats: ArenaStats::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> &ArenaStats {
        &self.stats
    }

    /// Number of slots currently reusable
    pub fn free_slots(&self) -> usize {
        self.state
            .lock()
            .iter()
            .filter(|s| s.phase == SlotPhase::Free)
            .count()
    }

    /// Phase of slot `index`, for diagnostics and tests
    pub fn phase(&self, index: usize) -> Option<SlotPhase> {
        self.state.lock().get(index).map(|s| s.phase)
    }

    /// Check out a free slot without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Result<WriteSlot> {
        let mut state = self.state.lock();
        self.acquire_locked(&mut state)
    }

    /// Check out a free slot, waiting up to `timeout` for one to be released.
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Result<WriteSlot> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.iter().any(|s| s.phase == SlotPhase::Free) {
                return self.acquire_locked(&mut state);
            }
            if self.freed.wait_until(&mut state, deadline).timed_out() {
                return self.acquire_locked(&mut state);
            }
        }
    }

    fn acquire_locked(self: &Arc<Self>, state: &mut [SlotState]) -> Result<WriteSlot> {
        let Some(index) = state.iter().position(|s| s.phase == SlotPhase::Free) else {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(LiveCoreError::NoCapacity {
                arena: self.name.clone(),
                capacity: self.buffers.len(),
            });
        };
        state[index].phase = SlotPhase::Writing;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);

        // Free implies no reader and no other writer, so this never waits.
        let guard = self.buffers[index].write_arc();
        Ok(WriteSlot {
            arena: Arc::clone(self),
            index,
            guard: Some(guard),
            published: false,
        })
    }

    /// Mark `index` as the channel's current frame at `generation`.
    pub(crate) fn mark_current(&self, index: usize, generation: u64) {
        let mut state = self.state.lock();
        let slot = &mut state[index];
        debug_assert_eq!(slot.phase, SlotPhase::Writing);
        slot.phase = SlotPhase::Current;
        slot.generation = generation;
        slot.readers = 0;
    }

    /// The channel moved past `index`; reclaim it once readers are done.
    pub(crate) fn retire(&self, index: usize) {
        let mut state = self.state.lock();
        let slot = &mut state[index];
        slot.phase = if slot.readers == 0 {
            SlotPhase::Free
        } else {
            SlotPhase::Retired
        };
        if slot.phase == SlotPhase::Free {
            self.freed.notify_one();
        }
    }

    /// Register a reader on the current slot `index`.
    pub(crate) fn retain_reader(&self, index: usize) -> u64 {
        let mut state = self.state.lock();
        let slot = &mut state[index];
        debug_assert_eq!(slot.phase, SlotPhase::Current);
        slot.readers += 1;
        slot.generation
    }

    fn release_reader(&self, index: usize) {
        let mut state = self.state.lock();
        let slot = &mut state[index];
        slot.readers = slot.readers.saturating_sub(1);
        if slot.readers == 0 && slot.phase == SlotPhase::Retired {
            slot.phase = SlotPhase::Free;
            self.freed.notify_one();
        }
    }

    pub(crate) fn abandon_write(&self, index: usize) {
        let mut state = self.state.lock();
        state[index].phase = SlotPhase::Free;
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        self.freed.notify_one();
    }

    pub(crate) fn read_guard(&self, index: usize) -> ArcRwLockReadGuard<RawRwLock, SlotBuffer> {
        self.buffers[index].read_arc()
    }
}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("capacity", &self.buffers.len())
            .finish()
    }
}

/// Exclusive handle to a slot checked out for writing.
///
/// Dropping it without publishing returns the slot to the pool.
pub struct WriteSlot {
    arena: Arc<FrameArena>,
    index: usize,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, SlotBuffer>>,
    published: bool,
}

impl WriteSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.arena
    }

    pub fn format(&self) -> FrameFormat {
        self.arena.format
    }

    pub fn buffer(&self) -> &SlotBuffer {
        self.guard.as_ref().expect("write guard present until publish")
    }

    pub fn buffer_mut(&mut self) -> &mut SlotBuffer {
        self.guard.as_mut().expect("write guard present until publish")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buffer_mut().data_mut()
    }

    pub fn meta_mut(&mut self) -> &mut FrameMeta {
        &mut self.buffer_mut().meta
    }

    /// Release the write lock and hand the slot index to the channel.
    pub(crate) fn into_published(mut self) -> (Arc<FrameArena>, usize) {
        self.guard.take();
        self.published = true;
        (Arc::clone(&self.arena), self.index)
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        self.guard.take();
        if !self.published {
            self.arena.abandon_write(self.index);
        }
    }
}

/// Shared handle to a published slot.
///
/// Holding it pins the slot: the writer cannot reuse it until every read
/// handle for its generation has been dropped.
pub struct ReadSlot {
    arena: Arc<FrameArena>,
    index: usize,
    generation: u64,
    current: Arc<AtomicU64>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, SlotBuffer>>,
}

impl ReadSlot {
    pub(crate) fn new(
        arena: Arc<FrameArena>,
        index: usize,
        generation: u64,
        current: Arc<AtomicU64>,
    ) -> Self {
        let guard = arena.read_guard(index);
        Self {
            arena,
            index,
            generation,
            current,
            guard: Some(guard),
        }
    }

    /// Generation this handle was read at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn format(&self) -> FrameFormat {
        self.arena.format
    }

    fn buffer(&self) -> &SlotBuffer {
        self.guard.as_ref().expect("read guard present until drop")
    }

    pub fn data(&self) -> &[u8] {
        self.buffer().data()
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.buffer().meta
    }

    /// Whether the channel still has this generation as its latest frame
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    /// Fail with `StaleRead` if the channel has moved on.
    pub fn ensure_current(&self) -> Result<()> {
        let current = self.current.load(Ordering::Acquire);
        if current == self.generation {
            Ok(())
        } else {
            Err(LiveCoreError::StaleRead {
                held: self.generation,
                current,
            })
        }
    }

    /// Run `f` on the frame if it is still the channel's current generation.
    pub fn consume<T>(&self, f: impl FnOnce(&[u8], &FrameMeta) -> T) -> Result<T> {
        self.ensure_current()?;
        let buffer = self.buffer();
        Ok(f(buffer.data(), &buffer.meta))
    }
}

impl Drop for ReadSlot {
    fn drop(&mut self) {
        // Unlock before the count drops so a reclaimed slot is never locked.
        self.guard.take();
        self.arena.release_reader(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelLayout;

    fn arena(capacity: usize) -> Arc<FrameArena> {
        FrameArena::new("test", FrameFormat::new(4, 4, PixelLayout::Gray8), capacity).unwrap()
    }

    #[test]
    fn test_slots_are_preallocated() {
        let arena = arena(3);
        assert_eq!(arena.capacity(), 3);
        assert_eq!(arena.free_slots(), 3);
        let slot = arena.try_acquire().unwrap();
        assert_eq!(slot.buffer().data().len(), 16);
    }

    #[test]
    fn test_exhaustion_reports_no_capacity() {
        let arena = arena(2);
        let _a = arena.try_acquire().unwrap();
        let _b = arena.try_acquire().unwrap();
        let err = arena.try_acquire().err().unwrap();
        assert!(matches!(err, LiveCoreError::NoCapacity { capacity: 2, .. }));
        assert_eq!(arena.stats().exhausted(), 1);
    }

    #[test]
    fn test_dropped_write_returns_slot() {
        let arena = arena(1);
        {
            let _slot = arena.try_acquire().unwrap();
            assert_eq!(arena.free_slots(), 0);
        }
        assert_eq!(arena.free_slots(), 1);
        assert_eq!(arena.stats().abandoned(), 1);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let arena = arena(1);
        let _held = arena.try_acquire().unwrap();
        let started = Instant::now();
        let result = arena.acquire_timeout(Duration::from_millis(20));
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = FrameArena::new("empty", FrameFormat::default(), 0);
        assert!(matches!(result, Err(LiveCoreError::Config(_))));
    }
}
