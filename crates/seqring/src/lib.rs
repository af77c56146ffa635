//! SeqRing - Sequenced Ring Buffer for Inter-Thread Messaging
//!
//! A fixed-capacity ring of pre-allocated event slots shared by producer and
//! consumer threads. Coordination happens through atomic sequence counters,
//! never through locks on the data path.
//!
//! # Key Features
//!
//! - Single- and multi-producer claim/publish protocols with backpressure
//! - Pluggable consumer wait strategies (busy-spin, yielding, blocking, lite-blocking)
//! - Non-blocking [`EventPoller`] reporting `Processing` / `Gating` / `Idle`
//! - Fan-out/join [`Pipeline`]s with lifecycle hooks and cooperative shutdown
//! - Cache-padded counters (false sharing elimination)
//!
//! # Example
//!
//! ```
//! use seqring_rs::{Config, PollState, RingBuffer};
//! use std::sync::Arc;
//!
//! let ring = Arc::new(RingBuffer::<u64>::with_default(Config::default()).unwrap());
//! let mut poller = ring.new_poller();
//! let mut producer = ring.producer().unwrap();
//!
//! // Claim, write and publish in one call
//! producer.publish_event(|slot, _seq| *slot = 42).unwrap();
//!
//! // Or hold a claim over several slots
//! let mut claim = producer.next_n(2).unwrap();
//! claim.for_each_mut(|seq, slot| *slot = seq as u64);
//! claim.publish();
//!
//! let mut sum = 0;
//! let state = poller.poll(|event, _seq, _end_of_batch| {
//!     sum += *event;
//!     true
//! });
//! assert_eq!(state, PollState::Processing);
//! assert_eq!(sum, 42 + 1 + 2);
//! ```
//!
//! # Pipelines
//!
//! ```
//! use seqring_rs::{from_fn, Config, PipelineBuilder, RingBuffer, Stage};
//!
//! let ring = RingBuffer::<i64>::with_default(Config::default()).unwrap();
//! let pipeline = PipelineBuilder::new(ring)
//!     .then(Stage::parallel(
//!         (0..2)
//!             .map(|_| from_fn(|e: &mut i64, _, _| { *e *= 2; Ok(()) }))
//!             .collect(),
//!     ))
//!     .then(Stage::single(from_fn(|e: &mut i64, seq, _| {
//!         assert_eq!(*e, seq * 2);
//!         Ok(())
//!     })))
//!     .start()
//!     .unwrap();
//!
//! let mut producer = pipeline.producer().unwrap();
//! for _ in 0..100 {
//!     producer.publish_event(|slot, seq| *slot = seq).unwrap();
//! }
//! drop(producer);
//!
//! let report = pipeline.shutdown().unwrap();
//! assert_eq!(report.processed("stage-1"), 100);
//! ```

mod backoff;
mod barrier;
mod config;
mod error;
pub mod harness;
mod invariants;
mod metrics;
mod pipeline;
mod poller;
mod ring_buffer;
mod sequence;
mod sequencer;
mod wait_strategy;

pub use backoff::Backoff;
pub use barrier::SequenceBarrier;
pub use config::{
    Config, ProducerMode, UnknownWaitStrategy, WaitStrategyKind, HIGH_THROUGHPUT_CONFIG,
    LOW_LATENCY_CONFIG,
};
pub use error::{Alerted, HandlerError, HarnessError, PipelineError, RingError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{
    from_fn, EventHandler, FaultPolicy, FnHandler, Pipeline, PipelineBuilder, PipelineReport,
    Stage, StageState, WorkerReport,
};
pub use poller::{EventPoller, PollState};
pub use ring_buffer::{Claim, Producer, RingBuffer};
pub use sequence::{minimum_sequence, Sequence, INITIAL_CURSOR_VALUE};
pub use sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
pub use wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, LiteBlockingWaitStrategy, WaitStrategy,
    YieldingWaitStrategy,
};
