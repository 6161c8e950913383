//! Error handling for livecore
//!
//! This module defines the error taxonomy shared by every component of the
//! pipeline and a Result alias for use throughout the crate.
//!
//! Most variants describe conditions that are recovered locally: arena
//! exhaustion is resolved by backpressure, stale reads by re-reading,
//! budget overruns and crashes by the supervisor, unavailable sources by
//! the fallback manager. Only [`LiveCoreError::AllSourcesExhausted`] is
//! fatal.

use crate::stage::StageId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for livecore operations
#[derive(Error, Debug)]
pub enum LiveCoreError {
    /// Every slot of a channel's arena is checked out
    #[error("No free slot in arena '{arena}' ({capacity} slots)")]
    NoCapacity { arena: String, capacity: usize },

    /// The generation a reader holds is no longer the channel's current one
    #[error("Stale read: held generation {held}, current generation {current}")]
    StaleRead { held: u64, current: u64 },

    /// A stage exceeded its declared processing budget
    #[error("Stage {stage} exceeded its budget: took {elapsed:?}, budget {budget:?}")]
    StageBudgetExceeded {
        stage: StageId,
        elapsed: Duration,
        budget: Duration,
    },

    /// A stage's execution context terminated unexpectedly
    #[error("Stage {stage} crashed: {reason}")]
    StageCrashed { stage: StageId, reason: String },

    /// A loopback source cannot produce frames
    #[error("Loopback source '{source_id}' unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    /// Not even the synthetic last-resort source could be initialised
    #[error("All fallback sources exhausted: {0}")]
    AllSourcesExhausted(String),

    /// A buffer did not match the negotiated frame format
    #[error("Frame format mismatch: expected {expected} bytes, got {actual}")]
    FormatMismatch { expected: usize, actual: usize },

    /// A stage name or id was not found in the pipeline
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LiveCoreError>,
    },
}

impl LiveCoreError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LiveCoreError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrappers
    pub fn root(&self) -> &LiveCoreError {
        match self {
            LiveCoreError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error is expected to resolve without operator action
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.root(), LiveCoreError::AllSourcesExhausted(_))
    }
}

impl From<serde_json::Error> for LiveCoreError {
    fn from(err: serde_json::Error) -> Self {
        LiveCoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LiveCoreError {
    fn from(err: toml::de::Error) -> Self {
        LiveCoreError::Config(err.to_string())
    }
}

/// Result type alias for livecore operations
pub type Result<T> = std::result::Result<T, LiveCoreError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| LiveCoreError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| LiveCoreError::from(e).with_context(f()))
    }
}
