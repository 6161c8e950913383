//! The per-stage run loop.
//!
//! Each stage runs on its own OS thread:
//!
//! ```text
//! loop {
//!     drain control messages (stop, enable/disable)
//!     load QualityState
//!     source: poll input ─► frame skip?     relay: newer upstream generation?
//!     acquire output slot (NoCapacity => drop)
//!     process ─► publish ─► PerformanceSample
//! }
//! ```
//!
//! A stage never blocks on a slot: arena exhaustion is reported as a dropped
//! sample and the loop moves on.

use crate::arena::{ChannelWriter, ReadSlot, StageChannel, WriteSlot};
use crate::error::{LiveCoreError, Result};
use crate::monitor::{PerformanceSample, SampleKind};
use crate::quality::{QualityState, SharedQuality};
use crate::stage::operation::{AnyStage, FrameView, StageContext};
use crate::stage::{StageHealth, StageId};
use crate::types::FrameMeta;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long one idle wait may last before control messages are checked again
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pause after a dropped frame so the consumer can release a slot
pub const NO_CAPACITY_BACKOFF: Duration = Duration::from_millis(2);

/// Messages from the supervisor to a running stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageControl {
    /// Finish the current unit of work and exit
    Stop,
    SetEnabled(bool),
}

/// Why a stage thread returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    Stopped,
    /// The writer lease was taken away; the thread was abandoned
    Revoked,
}

enum Step {
    Continue,
    Exit(StageExit),
}

/// Everything one execution context of a stage owns
pub struct StageRuntime {
    pub id: StageId,
    pub name: String,
    pub operation: AnyStage,
    pub upstream: Option<StageChannel>,
    pub writer: ChannelWriter,
    pub quality: Arc<SharedQuality>,
    pub enabled: bool,
    pub work: Duration,
    pub control: Receiver<StageControl>,
    pub samples: Sender<PerformanceSample>,
    pub health: Arc<StageHealth>,
}

impl StageRuntime {
    /// Spawn the run loop on a dedicated thread named `stage-<name>`.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<StageExit>>> {
        std::thread::Builder::new()
            .name(format!("stage-{}", self.name))
            .spawn(move || self.run())
    }

    /// Run until stopped, revoked, or the operation fails.
    pub fn run(mut self) -> Result<StageExit> {
        tracing::debug!("Stage '{}' ({}) starting", self.name, self.id);
        self.operation.on_start().map_err(|e| LiveCoreError::StageCrashed {
            stage: self.id,
            reason: format!("start failed: {}", e),
        })?;

        let mut last_seen = 0u64;
        let mut sequence = 0u64;

        loop {
            if let Some(exit) = self.drain_control() {
                self.operation.on_stop();
                tracing::debug!("Stage '{}' exiting: {:?}", self.name, exit);
                return Ok(exit);
            }

            let quality = self.quality.load();
            let step = match self.upstream.clone() {
                None => self.source_step(quality, &mut sequence)?,
                Some(upstream) => self.relay_step(&upstream, quality, &mut last_seen)?,
            };
            if let Step::Exit(exit) = step {
                tracing::debug!("Stage '{}' exiting: {:?}", self.name, exit);
                return Ok(exit);
            }
        }
    }

    fn drain_control(&mut self) -> Option<StageExit> {
        while let Ok(message) = self.control.try_recv() {
            match message {
                StageControl::Stop => return Some(StageExit::Stopped),
                StageControl::SetEnabled(enabled) => {
                    if enabled != self.enabled {
                        tracing::info!(
                            "Stage '{}' {}",
                            self.name,
                            if enabled { "enabled" } else { "disabled" }
                        );
                    }
                    self.enabled = enabled;
                }
            }
        }
        if self.writer.is_revoked() {
            return Some(StageExit::Revoked);
        }
        None
    }

    fn source_step(&mut self, quality: QualityState, sequence: &mut u64) -> Result<Step> {
        // A disabled source produces nothing; the fallback path covers the gap
        if !self.enabled {
            std::thread::sleep(POLL_INTERVAL);
            self.emit(SampleKind::Idle, Duration::ZERO, 0);
            return Ok(Step::Continue);
        }
        if !self.operation.poll_input(POLL_INTERVAL)? {
            self.emit(SampleKind::Idle, Duration::ZERO, 0);
            return Ok(Step::Continue);
        }

        let seq = *sequence;
        *sequence += 1;
        if !quality.admits(seq) {
            self.operation.skip_input();
            self.emit(SampleKind::Skipped, Duration::ZERO, 0);
            return Ok(Step::Continue);
        }

        let Some(mut slot) = self.acquire(0)? else {
            self.operation.skip_input();
            return Ok(Step::Continue);
        };

        let started = Instant::now();
        self.health.begin_work();
        let result = self.fill_source(&mut slot, quality, seq, started);
        self.health.end_work();
        result?;

        self.publish(slot, started, 0)
    }

    fn fill_source(
        &mut self,
        slot: &mut WriteSlot,
        quality: QualityState,
        seq: u64,
        started: Instant,
    ) -> Result<()> {
        let format = slot.format();
        let (data, meta) = slot.buffer_mut().parts_mut();
        *meta = FrameMeta::new(seq, started);
        meta.scale = quality.scale;
        let mut ctx = StageContext {
            stage: self.id,
            format,
            quality,
            input: None,
            output: data,
            meta,
        };
        self.operation.process(&mut ctx)?;
        self.simulate_work(quality);
        Ok(())
    }

    fn relay_step(
        &mut self,
        upstream: &StageChannel,
        quality: QualityState,
        last_seen: &mut u64,
    ) -> Result<Step> {
        if !upstream.wait_for_newer(*last_seen, POLL_INTERVAL) {
            self.emit(SampleKind::Idle, Duration::ZERO, 0);
            return Ok(Step::Continue);
        }
        let Some(read) = upstream.read_latest() else {
            return Ok(Step::Continue);
        };

        let generation = read.generation();
        let depth = if *last_seen == 0 {
            0
        } else {
            generation.saturating_sub(*last_seen + 1) as u32
        };
        *last_seen = generation;

        let Some(mut slot) = self.acquire(depth)? else {
            return Ok(Step::Continue);
        };

        let started = Instant::now();
        self.health.begin_work();
        let result = self.fill_relay(&mut slot, &read, quality);
        self.health.end_work();
        drop(read);

        match result {
            Ok(()) => self.publish(slot, started, depth),
            Err(LiveCoreError::StaleRead { held, current }) => {
                tracing::trace!(
                    "Stage '{}' read generation {} went stale ({}), re-reading",
                    self.name,
                    held,
                    current
                );
                *last_seen = held;
                Ok(Step::Continue)
            }
            Err(e) => Err(e),
        }
    }

    fn fill_relay(
        &mut self,
        slot: &mut WriteSlot,
        read: &ReadSlot,
        quality: QualityState,
    ) -> Result<()> {
        let format = slot.format();
        let stage = self.id;
        let enabled = self.enabled;
        let operation = &mut self.operation;
        let (data, meta) = slot.buffer_mut().parts_mut();

        read.consume(|input, input_meta| {
            *meta = *input_meta;
            meta.scale = quality.scale;
            let mut ctx = StageContext {
                stage,
                format,
                quality,
                input: Some(FrameView {
                    data: input,
                    meta: input_meta,
                }),
                output: data,
                meta,
            };
            if enabled {
                operation.process(&mut ctx)
            } else {
                ctx.copy_input()
            }
        })??;

        if enabled {
            self.simulate_work(quality);
        }
        Ok(())
    }

    /// Output slot, or `None` after recording a drop
    fn acquire(&mut self, depth: u32) -> Result<Option<WriteSlot>> {
        match self.writer.acquire_write_slot() {
            Ok(slot) => Ok(Some(slot)),
            Err(LiveCoreError::NoCapacity { .. }) => {
                tracing::trace!("Stage '{}' has no free output slot, dropping", self.name);
                self.emit(SampleKind::Dropped, Duration::ZERO, depth);
                std::thread::sleep(NO_CAPACITY_BACKOFF);
                Ok(None)
            }
            Err(_) if self.writer.is_revoked() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn publish(&mut self, slot: WriteSlot, started: Instant, depth: u32) -> Result<Step> {
        match self.writer.publish(slot) {
            Ok(_) => {
                self.health.record_publish();
                self.emit(SampleKind::Processed, started.elapsed(), depth);
                Ok(Step::Continue)
            }
            Err(_) if self.writer.is_revoked() => Ok(Step::Exit(StageExit::Revoked)),
            Err(e) => Err(e),
        }
    }

    /// Stand-in for an opaque model call whose cost grows with pixel count
    fn simulate_work(&self, quality: QualityState) {
        if !self.work.is_zero() {
            let factor = quality.scale * quality.scale;
            std::thread::sleep(self.work.mul_f32(factor.max(0.0)));
        }
    }

    fn emit(&self, kind: SampleKind, duration: Duration, depth: u32) {
        let sample =
            PerformanceSample::new(self.id, Instant::now(), duration, kind).with_queue_depth(depth);
        // Never block the frame path on telemetry
        let _ = self.samples.try_send(sample);
    }
}
