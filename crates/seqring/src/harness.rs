//! Entry points for an external measurement harness.
//!
//! Two workloads are provided:
//!
//! - [`PollingHarness`]: background producer threads publish bursts with
//!   non-blocking claims while the caller drives a poller one
//!   [`consumer_step`](PollingHarness::consumer_step) at a time.
//! - [`PipelineHarness`]: the caller publishes one event per
//!   [`producer_step`](PipelineHarness::producer_step) into a fan-out stage
//!   followed by a join stage.
//!
//! Timing, parameter sweeps and reporting belong to the caller; the harness
//! only exposes `setup` / `teardown` / `producer_step` / `consumer_step` and
//! counters.

use crate::error::{HandlerError, HarnessError, RingError};
use crate::pipeline::{EventHandler, Pipeline, PipelineBuilder, PipelineReport, Stage};
use crate::poller::{EventPoller, PollState};
use crate::ring_buffer::{Producer, RingBuffer};
use crate::{Config, ProducerMode, WaitStrategyKind, HIGH_THROUGHPUT_CONFIG};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Value written by every harness producer.
pub const WRITE_VALUE: i64 = 3;

// =============================================================================
// POLLING WORKLOAD
// =============================================================================

/// Event carried by the polling workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueEvent {
    pub value: i64,
}

/// Parameters of the polling workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    pub ring: Config,
    /// Background producer threads started by `setup()`.
    pub producer_count: usize,
    /// Publish attempts per producer loop iteration before re-checking the
    /// running flag.
    pub burst_size: usize,
    /// Events handled per `consumer_step()` at most.
    pub max_batch_size: usize,
}

impl HarnessConfig {
    pub const fn new(ring: Config, producer_count: usize, burst_size: usize) -> Self {
        Self {
            ring,
            producer_count,
            burst_size,
            max_batch_size: 64,
        }
    }

    pub const fn with_producer_count(mut self, producer_count: usize) -> Self {
        self.producer_count = producer_count;
        self
    }

    pub const fn with_burst_size(mut self, burst_size: usize) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub const fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub const fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.ring = self.ring.with_wait_strategy(wait_strategy);
        self
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.producer_count == 0 {
            return Err(HarnessError::InvalidConfig("producer_count must be at least 1"));
        }
        if self.burst_size == 0 {
            return Err(HarnessError::InvalidConfig("burst_size must be at least 1"));
        }
        if self.max_batch_size == 0 {
            return Err(HarnessError::InvalidConfig("max_batch_size must be at least 1"));
        }
        if self.ring.producer_mode == ProducerMode::Single && self.producer_count > 1 {
            return Err(HarnessError::InvalidConfig(
                "a single-producer ring supports one producer thread",
            ));
        }
        Ok(())
    }
}

impl Default for HarnessConfig {
    /// 64K-slot multi-producer ring with a yielding consumer, one producer
    /// publishing bursts of 1000.
    fn default() -> Self {
        Self::new(HIGH_THROUGHPUT_CONFIG, 1, 1000)
    }
}

/// Result of one [`PollingHarness::consumer_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStep {
    pub events: u64,
    pub state: PollState,
}

/// Cumulative consumer-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCounters {
    pub events: u64,
    pub processing_polls: u64,
    pub gating_polls: u64,
    pub idle_polls: u64,
}

impl PollCounters {
    fn record(&mut self, step: ConsumerStep) {
        self.events += step.events;
        match step.state {
            PollState::Processing => self.processing_polls += 1,
            PollState::Gating => self.gating_polls += 1,
            PollState::Idle => self.idle_polls += 1,
        }
    }
}

/// Multi-producer polling workload.
///
/// The harness owns one poller; `setup()` starts the producer threads and
/// `teardown()` stops them.
pub struct PollingHarness {
    config: HarnessConfig,
    ring: Arc<RingBuffer<ValueEvent>>,
    poller: EventPoller<ValueEvent>,
    running: Arc<AtomicBool>,
    producer_threads: Vec<JoinHandle<u64>>,
    step_producer: Option<Producer<ValueEvent>>,
    counters: PollCounters,
}

impl PollingHarness {
    /// Builds the ring and registers the poller. No threads are started.
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let ring = Arc::new(RingBuffer::with_default(config.ring)?);
        let poller = ring.new_poller().with_max_batch_size(config.max_batch_size);
        Ok(Self {
            config,
            ring,
            poller,
            running: Arc::new(AtomicBool::new(false)),
            producer_threads: Vec::new(),
            step_producer: None,
            counters: PollCounters::default(),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn ring(&self) -> &Arc<RingBuffer<ValueEvent>> {
        &self.ring
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts `producer_count` producer threads. Does nothing if they are
    /// already running.
    pub fn setup(&mut self) -> Result<(), HarnessError> {
        if self.is_running() {
            return Ok(());
        }

        // Register every producer before spawning so registration errors
        // surface here rather than inside a thread.
        let producers = (0..self.config.producer_count)
            .map(|_| self.ring.producer())
            .collect::<Result<Vec<_>, RingError>>()?;

        self.running.store(true, Ordering::Release);
        for (id, producer) in producers.into_iter().enumerate() {
            let running = Arc::clone(&self.running);
            let burst_size = self.config.burst_size;
            let spawned = thread::Builder::new()
                .name(format!("publisher-{id}"))
                .spawn(move || run_producer(producer, &running, burst_size));
            match spawned {
                Ok(handle) => self.producer_threads.push(handle),
                Err(err) => {
                    let _ = self.teardown();
                    return Err(HarnessError::Spawn(err));
                }
            }
        }

        info!(
            "polling harness started: {} producers, burst {}, capacity {}, {} wait",
            self.config.producer_count,
            self.config.burst_size,
            self.ring.capacity(),
            self.config.ring.wait_strategy
        );
        Ok(())
    }

    /// Stops and joins the producer threads. Returns how many events each
    /// producer published.
    pub fn teardown(&mut self) -> Result<Vec<u64>, HarnessError> {
        if !self.is_running() {
            return Err(HarnessError::NotRunning);
        }
        self.running.store(false, Ordering::Release);

        let mut published = Vec::with_capacity(self.producer_threads.len());
        let mut panicked = None;
        for (id, handle) in self.producer_threads.drain(..).enumerate() {
            match handle.join() {
                Ok(count) => published.push(count),
                Err(_) => {
                    panicked.get_or_insert(id);
                }
            }
        }
        if let Some(id) = panicked {
            return Err(HarnessError::ProducerPanicked(id));
        }

        info!(
            "polling harness stopped: {} events published, {} consumed",
            published.iter().sum::<u64>(),
            self.counters.events
        );
        Ok(published)
    }

    /// A producer handle for callers that publish from their own threads.
    pub fn producer(&self) -> Result<Producer<ValueEvent>, HarnessError> {
        Ok(self.ring.producer()?)
    }

    /// One blocking claim, write and publish from the calling thread.
    ///
    /// Stalls while the ring is full, so somebody must be calling
    /// [`consumer_step`](Self::consumer_step).
    pub fn producer_step(&mut self) -> Result<i64, HarnessError> {
        let producer = match &mut self.step_producer {
            Some(producer) => producer,
            slot @ None => slot.insert(self.ring.producer()?),
        };
        Ok(producer.publish_event(|event, _| event.value = WRITE_VALUE)?)
    }

    /// One poll, handling at most `max_batch_size` events.
    pub fn consumer_step(&mut self) -> ConsumerStep {
        let mut events = 0u64;
        let state = self.poller.poll(|_, _, _| {
            events += 1;
            true
        });
        let step = ConsumerStep { events, state };
        self.counters.record(step);
        step
    }

    pub fn counters(&self) -> PollCounters {
        self.counters
    }

    /// Returns the counters and starts a new measurement window.
    pub fn reset_counters(&mut self) -> PollCounters {
        std::mem::take(&mut self.counters)
    }
}

impl Drop for PollingHarness {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.teardown();
        }
    }
}

impl std::fmt::Debug for PollingHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingHarness")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("counters", &self.counters)
            .finish()
    }
}

fn run_producer(mut producer: Producer<ValueEvent>, running: &AtomicBool, burst_size: usize) -> u64 {
    let mut published = 0u64;
    while running.load(Ordering::Acquire) {
        for _ in 0..burst_size {
            match producer.try_publish_event(|event, _| event.value = WRITE_VALUE) {
                Ok(_) => published += 1,
                Err(_) => {
                    if !running.load(Ordering::Acquire) {
                        return published;
                    }
                    break;
                }
            }
        }
    }
    debug!("producer stopped after {published} events");
    published
}

// =============================================================================
// PIPELINE WORKLOAD
// =============================================================================

/// Event carried by the pipeline workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineEvent {
    pub input: i64,
    /// Written by the parallel stage, cleared by the join stage.
    pub result: Option<String>,
}

/// Parameters of the pipeline workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHarnessConfig {
    pub ring: Config,
    /// Handlers in the parallel stage.
    pub fan_out: usize,
}

impl PipelineHarnessConfig {
    pub const fn new(ring: Config, fan_out: usize) -> Self {
        Self { ring, fan_out }
    }

    pub const fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.ring = self.ring.with_wait_strategy(wait_strategy);
        self
    }

    pub const fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }
}

impl Default for PipelineHarnessConfig {
    /// 1K-slot single-producer ring, busy-spinning workers, 3-way fan-out.
    fn default() -> Self {
        Self::new(
            Config::new(1024, ProducerMode::Single, WaitStrategyKind::BusySpin, false),
            3,
        )
    }
}

/// Fan-out stage handler: renders the input as the event's result.
#[derive(Debug, Default)]
pub struct ParallelHandler;

impl EventHandler<PipelineEvent> for ParallelHandler {
    fn on_event(&mut self, event: &mut PipelineEvent, _: i64, _: bool) -> Result<(), HandlerError> {
        event.result = Some(event.input.to_string());
        Ok(())
    }
}

/// Join stage handler: counts events and clears their result.
#[derive(Debug)]
pub struct JoiningHandler {
    count: u64,
    pending: u64,
    joined: Arc<AtomicU64>,
}

impl JoiningHandler {
    pub fn new(joined: Arc<AtomicU64>) -> Self {
        Self {
            count: 0,
            pending: 0,
            joined,
        }
    }

    /// Events joined by this handler.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl EventHandler<PipelineEvent> for JoiningHandler {
    fn on_event(&mut self, event: &mut PipelineEvent, sequence: i64, end_of_batch: bool) -> Result<(), HandlerError> {
        if event.result.take().is_none() {
            return Err(HandlerError::msg(format!(
                "event {sequence} reached the join stage without a result"
            )));
        }
        self.count += 1;
        self.pending += 1;
        if end_of_batch {
            self.joined.fetch_add(self.pending, Ordering::Release);
            self.pending = 0;
        }
        Ok(())
    }
}

/// Single-producer fan-out/join workload.
pub struct PipelineHarness {
    config: PipelineHarnessConfig,
    producer: Option<Producer<PipelineEvent>>,
    pipeline: Option<Pipeline<PipelineEvent>>,
    joined: Arc<AtomicU64>,
    last_joined: u64,
}

impl PipelineHarness {
    pub fn new(config: PipelineHarnessConfig) -> Result<Self, HarnessError> {
        if config.fan_out == 0 {
            return Err(HarnessError::InvalidConfig("fan_out must be at least 1"));
        }
        if !config.ring.has_valid_capacity() {
            return Err(RingError::InvalidCapacity {
                capacity: config.ring.capacity,
            }
            .into());
        }
        Ok(Self {
            config,
            producer: None,
            pipeline: None,
            joined: Arc::new(AtomicU64::new(0)),
            last_joined: 0,
        })
    }

    pub fn config(&self) -> &PipelineHarnessConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Builds the ring and starts the fan-out and join workers.
    pub fn setup(&mut self) -> Result<(), HarnessError> {
        if self.is_running() {
            return Ok(());
        }

        let ring = RingBuffer::with_default(self.config.ring)?;
        let parallel = (0..self.config.fan_out).map(|_| ParallelHandler).collect();
        let pipeline = PipelineBuilder::new(ring)
            .then(Stage::parallel(parallel).named("parallel"))
            .then(
                Stage::single(JoiningHandler::new(Arc::clone(&self.joined)))
                    .named("join")
                    .on_shutdown(|handler: &mut JoiningHandler| {
                        info!("join stage processed {} events", handler.count());
                    }),
            )
            .start()?;

        self.producer = Some(pipeline.producer()?);
        self.pipeline = Some(pipeline);
        self.last_joined = self.joined.load(Ordering::Acquire);
        info!(
            "pipeline harness started: fan-out {}, capacity {}, {} wait",
            self.config.fan_out, self.config.ring.capacity, self.config.ring.wait_strategy
        );
        Ok(())
    }

    /// One blocking claim, write and publish.
    pub fn producer_step(&mut self) -> Result<i64, HarnessError> {
        let producer = self.producer.as_mut().ok_or(HarnessError::NotRunning)?;
        let mut claim = producer.next()?;
        let sequence = claim.sequence();
        claim.event_mut().input = 2;
        claim.publish();
        Ok(sequence)
    }

    /// Events the join stage completed since the previous call.
    pub fn consumer_step(&mut self) -> u64 {
        let joined = self.joined.load(Ordering::Acquire);
        let delta = joined - self.last_joined;
        self.last_joined = joined;
        delta
    }

    /// Events joined since the harness was created.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Acquire)
    }

    /// Drains and stops the pipeline.
    pub fn teardown(&mut self) -> Result<PipelineReport, HarnessError> {
        self.producer = None;
        let pipeline = self.pipeline.take().ok_or(HarnessError::NotRunning)?;
        let report = pipeline.shutdown()?;
        info!(
            "pipeline harness stopped: {} events joined",
            report.processed("join")
        );
        Ok(report)
    }
}

impl std::fmt::Debug for PipelineHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHarness")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("joined", &self.joined())
            .finish()
    }
}
