//! Frame Buffer Arena and Stage Channel.
//!
//! Frames move between stages without per-frame allocation or copying:
//! every channel owns a fixed pool of slots sized at pipeline construction,
//! the writing stage fills a free slot and publishes it, and readers borrow
//! whatever slot is current.
//!
//! # Protocol
//!
//! ```text
//! writer: acquire_write_slot() ─► fill ─► publish()  (generation += 1)
//! reader: read_latest() ─► check generation ─► consume ─► drop handle
//! ```
//!
//! - Reading never blocks. An empty channel reads as `None`.
//! - Acquiring fails fast with `NoCapacity` when every slot is in flight.
//! - A slot is reused only after every reader of its generation has
//!   released it, so no reader ever observes a half-written slot.

pub mod channel;
pub mod slot;

pub use channel::{ChannelWriter, StageChannel};
pub use slot::{ArenaStats, FrameArena, ReadSlot, SlotBuffer, SlotPhase, WriteSlot};
