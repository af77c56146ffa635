//! Error types for ring, pipeline and harness operations.

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Errors raised by ring buffer construction and sequence claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Capacity is zero or not a power of two.
    #[error("capacity {capacity} is not a power of two")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },

    /// A non-blocking claim would overrun the slowest gating sequence.
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// A claim asked for zero slots, or more slots than the ring holds.
    #[error("cannot claim {requested} slots from a ring of {capacity}")]
    InvalidClaimSize {
        /// Number of slots requested.
        requested: usize,
        /// Ring capacity.
        capacity: usize,
    },

    /// Too many producers registered (single-producer rings allow one).
    #[error("too many producers registered (max: {max})")]
    TooManyProducers {
        /// Maximum number of concurrently registered producers.
        max: usize,
    },
}

impl RingError {
    /// Returns `true` if retrying later may succeed (e.g., `InsufficientCapacity`).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InsufficientCapacity)
    }
}

/// A sequence barrier was alerted while waiting. Used to stop consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence barrier alerted")]
pub struct Alerted;

/// Error raised by an event handler while processing an event.
#[derive(Debug)]
pub struct HandlerError {
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl HandlerError {
    /// Wraps any error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            source: Box::new(error),
        }
    }

    /// Creates a handler error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            source: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.source()
    }
}

/// Errors from building, running or stopping a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A handler failed and its stage halted.
    #[error("stage `{stage}` handler {ordinal} failed at sequence {sequence}: {source}")]
    HandlerFailed {
        /// Name of the failing stage.
        stage: String,
        /// Ordinal of the failing handler within its stage.
        ordinal: usize,
        /// Sequence of the event whose handler failed.
        sequence: i64,
        /// The handler's error.
        #[source]
        source: HandlerError,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// A worker thread panicked.
    #[error("pipeline worker `{0}` panicked")]
    WorkerPanicked(String),

    /// `start()` was called without any stage.
    #[error("pipeline has no stages")]
    NoStages,

    /// A stage was declared without handlers.
    #[error("stage `{0}` has no handlers")]
    EmptyStage(String),
}

/// Errors surfaced to the external benchmark harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Ring construction or claim failure.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// Pipeline failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A producer thread could not be spawned.
    #[error("failed to spawn producer thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A producer thread panicked.
    #[error("producer thread {0} panicked")]
    ProducerPanicked(usize),

    /// Harness parameters out of range.
    #[error("invalid harness configuration: {0}")]
    InvalidConfig(&'static str),

    /// Operation requires `setup()` first.
    #[error("harness is not running")]
    NotRunning,
}
