//! Single-writer, multi-reader handoff between adjacent stages.
//!
//! A channel exposes only its latest published frame. Readers never block:
//! `read_latest` either returns the current generation or nothing at all.
//! Writers that outpace their readers simply supersede older frames, which
//! is the pipeline's backpressure mechanism.
//!
//! Exactly one writer holds the channel's lease at a time. Claiming a new
//! lease (or revoking the current one) bumps the writer epoch, and any
//! publish carrying an older epoch is rejected with its slot returned to
//! the pool. This is how an abandoned stage context is fenced off.

use crate::arena::slot::{FrameArena, ReadSlot, WriteSlot};
use crate::error::{LiveCoreError, Result};
use crate::types::FrameFormat;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ChannelState {
    current: Option<usize>,
    generation: u64,
    last_publish: Option<Instant>,
}

struct ChannelInner {
    name: String,
    arena: Arc<FrameArena>,
    state: Mutex<ChannelState>,
    advanced: Condvar,
    /// Mirrors `state.generation` for lock-free staleness checks
    generation: Arc<AtomicU64>,
    writer_epoch: AtomicU64,
    published: AtomicU64,
    rejected: AtomicU64,
}

/// Handle to a stage channel. Cloning is cheap and shares the channel.
#[derive(Clone)]
pub struct StageChannel {
    inner: Arc<ChannelInner>,
}

impl StageChannel {
    /// Create a channel backed by a fresh arena of `slots` slots.
    pub fn new(name: impl Into<String>, format: FrameFormat, slots: usize) -> Result<Self> {
        let name = name.into();
        let arena = FrameArena::new(name.clone(), format, slots)?;
        Ok(Self::with_arena(name, arena))
    }

    /// Create a channel over an existing arena.
    pub fn with_arena(name: impl Into<String>, arena: Arc<FrameArena>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                arena,
                state: Mutex::new(ChannelState {
                    current: None,
                    generation: 0,
                    last_publish: None,
                }),
                advanced: Condvar::new(),
                generation: Arc::new(AtomicU64::new(0)),
                writer_epoch: AtomicU64::new(0),
                published: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn format(&self) -> FrameFormat {
        self.inner.arena.format()
    }

    pub fn arena(&self) -> &Arc<FrameArena> {
        &self.inner.arena
    }

    /// Generation of the latest published frame; 0 means nothing published yet.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// When the latest frame was published
    pub fn last_published_at(&self) -> Option<Instant> {
        self.inner.state.lock().last_publish
    }

    /// Total frames accepted by this channel
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total publishes rejected because the writer's lease was revoked
    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    /// Take over the writer lease, fencing off any previous writer.
    pub fn claim_writer(&self) -> ChannelWriter {
        let epoch = self.inner.writer_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!("Channel '{}' writer lease {} claimed", self.inner.name, epoch);
        ChannelWriter {
            channel: self.clone(),
            epoch,
        }
    }

    /// Revoke the current writer lease without handing out a new one.
    pub fn revoke_writer(&self) {
        let epoch = self.inner.writer_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            "Channel '{}' writer lease revoked (epoch now {})",
            self.inner.name,
            epoch
        );
    }

    /// Latest published frame, or `None` if nothing has been published.
    ///
    /// Never blocks on writers.
    pub fn read_latest(&self) -> Option<ReadSlot> {
        let (index, generation) = {
            let state = self.inner.state.lock();
            let index = state.current?;
            let generation = self.inner.arena.retain_reader(index);
            (index, generation)
        };
        Some(ReadSlot::new(
            Arc::clone(&self.inner.arena),
            index,
            generation,
            Arc::clone(&self.inner.generation),
        ))
    }

    /// Wait until the generation moves past `seen`, up to `timeout`.
    ///
    /// This only parks the caller on a notification; it never touches slots.
    pub fn wait_for_newer(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.generation <= seen {
            if self
                .inner
                .advanced
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.generation > seen;
            }
        }
        true
    }

    fn publish(&self, slot: WriteSlot, epoch: u64) -> Result<u64> {
        if !Arc::ptr_eq(slot.arena(), &self.inner.arena) {
            return Err(LiveCoreError::Channel(format!(
                "slot from arena '{}' published to channel '{}'",
                slot.arena().name(),
                self.inner.name
            )));
        }

        let (arena, index) = slot.into_published();
        let mut state = self.inner.state.lock();

        if self.inner.writer_epoch.load(Ordering::Acquire) != epoch {
            drop(state);
            arena.abandon_write(index);
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(LiveCoreError::Channel(format!(
                "writer lease {} on '{}' was revoked",
                epoch, self.inner.name
            )));
        }

        state.generation += 1;
        let generation = state.generation;
        arena.mark_current(index, generation);
        if let Some(previous) = state.current.replace(index) {
            arena.retire(previous);
        }
        state.last_publish = Some(Instant::now());
        self.inner.generation.store(generation, Ordering::Release);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        drop(state);

        self.inner.advanced.notify_all();
        Ok(generation)
    }
}

impl std::fmt::Debug for StageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChannel")
            .field("name", &self.inner.name)
            .field("generation", &self.generation())
            .field("arena", &self.inner.arena)
            .finish()
    }
}

/// The single writer's lease on a channel
pub struct ChannelWriter {
    channel: StageChannel,
    epoch: u64,
}

impl ChannelWriter {
    pub fn channel(&self) -> &StageChannel {
        &self.channel
    }

    /// Whether a newer lease has superseded this one
    pub fn is_revoked(&self) -> bool {
        self.channel.inner.writer_epoch.load(Ordering::Acquire) != self.epoch
    }

    fn ensure_lease(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(LiveCoreError::Channel(format!(
                "writer lease {} on '{}' was revoked",
                self.epoch,
                self.channel.name()
            )));
        }
        Ok(())
    }

    /// Exclusive slot to fill, or `NoCapacity` if every slot is in flight.
    pub fn acquire_write_slot(&self) -> Result<WriteSlot> {
        self.ensure_lease()?;
        self.channel.inner.arena.try_acquire()
    }

    /// Like [`acquire_write_slot`](Self::acquire_write_slot) but waits up to `timeout`.
    pub fn acquire_write_slot_timeout(&self, timeout: Duration) -> Result<WriteSlot> {
        self.ensure_lease()?;
        self.channel.inner.arena.acquire_timeout(timeout)
    }

    /// Make `slot` the channel's current frame and return its generation.
    pub fn publish(&self, slot: WriteSlot) -> Result<u64> {
        self.channel.publish(slot, self.epoch)
    }
}
