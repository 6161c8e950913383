//! # livecore: real-time frame pipeline core
//!
//! A chain of processing stages runs on a live frame stream. Each stage sits
//! on its own thread and hands frames to the next through a latest-wins
//! channel backed by a fixed pool of reusable slots. Around that chain:
//!
//! - a **supervisor** contains stage crashes and hangs, restarting with backoff
//! - a **performance monitor** folds per-stage timing into a composite score
//! - an **adaptive quality controller** trades resolution and frame rate for
//!   throughput, one step per cooldown window
//! - a **fallback manager** watches the final channel's heartbeat and serves
//!   a loopback source while the live chain is stalled
//!
//! ## Architecture
//!
//! - [`arena`]: frame slots, generation-counted stage channels
//! - [`stage`]: stage kinds, the run loop, the supervisor
//! - [`monitor`] and [`quality`]: the performance feedback loop
//! - [`fallback`]: heartbeat state machine and loopback sources
//! - [`pipeline`]: assembly, the supervision thread and the control surface
//!
//! ## Configuration
//!
//! Pipelines are described by a TOML [`CoreConfig`]. The quality factor and
//! per-stage enabled flags survive restarts in a JSON [`PersistedState`]
//! stored in the platform data directory under `dev.livecore.pipeline`
//! (override with `LIVECORE_DATA_DIR`):
//!
//! - **Linux**: `~/.local/share/dev.livecore.pipeline/`
//! - **macOS**: `~/Library/Application Support/dev.livecore.pipeline/`
//! - **Windows**: `%APPDATA%\dev.livecore.pipeline\`
//!
//! ## Example
//!
//! ```no_run
//! use livecore::{CoreConfig, PersistedState, PipelineBuilder};
//!
//! fn main() -> livecore::Result<()> {
//!     let handle = PipelineBuilder::new(CoreConfig::default())
//!         .with_persisted_state(PersistedState::load_or_default())
//!         .build()?
//!         .spawn()?;
//!
//!     let frame = handle.get_current_output_frame()?;
//!     println!("{} bytes from {}", frame.size(), frame.origin);
//!     println!("{}", handle.get_pipeline_status());
//!
//!     let mut state = handle.shutdown()?;
//!     state.save()?;
//!     Ok(())
//! }
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod fallback;
pub mod monitor;
pub mod pattern;
pub mod pipeline;
pub mod quality;
pub mod stage;
pub mod types;

// Re-export commonly used types
pub use arena::{FrameArena, StageChannel};
pub use config::{CoreConfig, LoopbackKind, LoopbackSourceConfig, PersistedState, StageConfig};
pub use error::{LiveCoreError, Result, ResultExt};
pub use fallback::{FallbackManager, FallbackState, LoopbackSource};
pub use monitor::{PerformanceMonitor, PerformanceSample};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, PipelineStatus};
pub use quality::{AdaptiveQualityController, QualityState};
pub use stage::{StageId, StageKind, StageOperation, StageState, StageSupervisor};
pub use types::{Frame, FrameFormat, FrameMeta, FrameOrigin, PixelLayout};
