//! Multi-stage event pipelines.
//!
//! A pipeline owns a ring and runs one thread per handler. Stages form a
//! chain: every stage reads behind all handlers of the previous stage, and
//! only the final stage gates producers.
//!
//! ```text
//!                      ┌── handler 0 (seq % 3 == 0) ──┐
//! producers ─▶ ring ───┼── handler 1 (seq % 3 == 1) ──┼──▶ join ─▶ (gates producers)
//!                      └── handler 2 (seq % 3 == 2) ──┘
//! ```
//!
//! Handlers of a parallel stage split the stream by `sequence % fan_out` and
//! get exclusive `&mut T` access to their own sequences. A join stage sees
//! every event once, in order, after all upstream handlers passed it.
//!
//! # Shutdown
//!
//! [`Pipeline::shutdown`] is cooperative: it records the producer cursor as the
//! drain target, alerts every barrier, and each worker finishes all sequences
//! up to the target before running its `on_shutdown` hook and exiting. Stop
//! producers first; events published after the target was recorded may be
//! left unprocessed.

use crate::backoff::Backoff;
use crate::barrier::SequenceBarrier;
use crate::error::{HandlerError, PipelineError, RingError};
use crate::invariants::{debug_assert_monotonic, debug_assert_partition};
use crate::ring_buffer::{Producer, RingBuffer};
use crate::sequence::{minimum_sequence, Sequence, INITIAL_CURSOR_VALUE};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// =============================================================================
// HANDLERS
// =============================================================================

/// Processes events for one pipeline worker.
pub trait EventHandler<T>: Send {
    /// Handles the event at `sequence`. `end_of_batch` is true for the last
    /// event this handler gets from the current batch.
    fn on_event(&mut self, event: &mut T, sequence: i64, end_of_batch: bool)
        -> Result<(), HandlerError>;
}

/// [`EventHandler`] backed by a closure. See [`from_fn`].
pub struct FnHandler<F>(F);

/// Wraps a closure as an [`EventHandler`].
pub fn from_fn<T, F>(f: F) -> FnHandler<F>
where
    F: FnMut(&mut T, i64, bool) -> Result<(), HandlerError> + Send,
{
    FnHandler(f)
}

impl<T, F> EventHandler<T> for FnHandler<F>
where
    F: FnMut(&mut T, i64, bool) -> Result<(), HandlerError> + Send,
{
    #[inline]
    fn on_event(&mut self, event: &mut T, sequence: i64, end_of_batch: bool) -> Result<(), HandlerError> {
        (self.0)(event, sequence, end_of_batch)
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

/// What a worker does when its handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Stop the worker. Its sequence stays just before the failed event and
    /// the error is reported by [`Pipeline::shutdown`].
    #[default]
    Halt,
    /// Log the failure, count the event as skipped and continue.
    Skip,
}

/// Lifecycle of a single pipeline worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

impl StageState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(StageState::Idle as u8))
    }

    fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> StageState {
        StageState::from_u8(self.0.load(Ordering::Acquire))
    }
}

type Hook<H> = Arc<dyn Fn(&mut H) + Send + Sync>;

// =============================================================================
// STAGES
// =============================================================================

/// A group of handlers that run side by side, one thread each.
pub struct Stage<H> {
    name: Option<String>,
    handlers: Vec<H>,
    on_start: Option<Hook<H>>,
    on_shutdown: Option<Hook<H>>,
    fault_policy: FaultPolicy,
}

impl<H> Stage<H> {
    /// A stage whose handlers split the stream by `sequence % handlers.len()`.
    pub fn parallel(handlers: Vec<H>) -> Self {
        Self {
            name: None,
            handlers,
            on_start: None,
            on_shutdown: None,
            fault_policy: FaultPolicy::default(),
        }
    }

    /// A stage with one handler that sees every event.
    pub fn single(handler: H) -> Self {
        Self::parallel(vec![handler])
    }

    /// Names the stage. Used for worker thread names, logs and reports.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runs `hook` on each handler before its first event.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut H) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Runs `hook` on each handler once the pipeline is stopped and the
    /// handler finished draining. A halted handler runs it at stop time too.
    #[must_use]
    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut H) + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Number of handlers in this stage.
    pub fn fan_out(&self) -> usize {
        self.handlers.len()
    }
}

impl<H> fmt::Debug for Stage<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("fan_out", &self.handlers.len())
            .field("fault_policy", &self.fault_policy)
            .finish()
    }
}

/// Everything a stage needs from the pipeline to start its workers.
struct StageContext<T> {
    index: usize,
    name: Arc<str>,
    ring: Arc<RingBuffer<T>>,
    barrier: Arc<SequenceBarrier>,
    sequences: Vec<Arc<Sequence>>,
    control: Arc<Control>,
}

/// Type-erased [`Stage`], so one pipeline can mix handler types.
trait StageLauncher<T>: Send {
    fn name(&self) -> Option<&str>;
    fn fan_out(&self) -> usize;
    fn launch(self: Box<Self>, ctx: StageContext<T>, workers: &mut Vec<WorkerHandle>)
        -> Result<(), PipelineError>;
}

impl<T, H> StageLauncher<T> for Stage<H>
where
    T: Send + Sync + 'static,
    H: EventHandler<T> + 'static,
{
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn fan_out(&self) -> usize {
        self.handlers.len()
    }

    fn launch(self: Box<Self>, ctx: StageContext<T>, workers: &mut Vec<WorkerHandle>) -> Result<(), PipelineError> {
        let Stage {
            handlers,
            on_start,
            on_shutdown,
            fault_policy,
            ..
        } = *self;
        let fan_out = handlers.len();

        for ((ordinal, handler), sequence) in handlers.into_iter().enumerate().zip(&ctx.sequences) {
            let state = Arc::new(StateCell::new());
            let worker = Worker {
                stage_index: ctx.index,
                stage: Arc::clone(&ctx.name),
                ordinal,
                fan_out,
                ring: Arc::clone(&ctx.ring),
                barrier: Arc::clone(&ctx.barrier),
                sequence: Arc::clone(sequence),
                handler,
                on_start: on_start.clone(),
                on_shutdown: on_shutdown.clone(),
                fault_policy,
                control: Arc::clone(&ctx.control),
                state: Arc::clone(&state),
                processed: 0,
                skipped: 0,
            };
            let join = thread::Builder::new()
                .name(format!("{}-{ordinal}", ctx.name))
                .spawn(move || worker.run())?;
            workers.push(WorkerHandle {
                stage: Arc::clone(&ctx.name),
                ordinal,
                state,
                join,
            });
        }
        Ok(())
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// Shutdown coordination shared by every worker of a pipeline.
#[derive(Debug)]
struct Control {
    /// Last sequence every worker must handle before stopping.
    drain_target: AtomicI64,
    /// Lowest index of a stage with a halted worker (`usize::MAX` if none).
    halted_stage: AtomicUsize,
}

impl Control {
    fn new() -> Self {
        Self {
            drain_target: AtomicI64::new(INITIAL_CURSOR_VALUE),
            halted_stage: AtomicUsize::new(usize::MAX),
        }
    }

    fn halt(&self, stage_index: usize) {
        self.halted_stage.fetch_min(stage_index, Ordering::SeqCst);
    }

    /// True if some stage before `stage_index` halted, so its sequences
    /// will never move again.
    fn upstream_halted(&self, stage_index: usize) -> bool {
        self.halted_stage.load(Ordering::SeqCst) < stage_index
    }
}

/// Marks the stage halted if the worker thread unwinds.
struct HaltOnPanic<'a> {
    control: &'a Control,
    stage_index: usize,
}

impl Drop for HaltOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.control.halt(self.stage_index);
        }
    }
}

struct WorkerHandle {
    stage: Arc<str>,
    ordinal: usize,
    state: Arc<StateCell>,
    join: JoinHandle<Result<WorkerReport, PipelineError>>,
}

struct Worker<T, H> {
    stage_index: usize,
    stage: Arc<str>,
    ordinal: usize,
    fan_out: usize,
    ring: Arc<RingBuffer<T>>,
    barrier: Arc<SequenceBarrier>,
    sequence: Arc<Sequence>,
    handler: H,
    on_start: Option<Hook<H>>,
    on_shutdown: Option<Hook<H>>,
    fault_policy: FaultPolicy,
    control: Arc<Control>,
    state: Arc<StateCell>,
    processed: u64,
    skipped: u64,
}

impl<T, H> Worker<T, H>
where
    H: EventHandler<T>,
{
    fn run(mut self) -> Result<WorkerReport, PipelineError> {
        let control = Arc::clone(&self.control);
        let _guard = HaltOnPanic {
            control: &control,
            stage_index: self.stage_index,
        };

        self.state.set(StageState::Starting);
        if let Some(hook) = &self.on_start {
            hook(&mut self.handler);
        }
        self.state.set(StageState::Running);
        debug!("worker {}-{} started", self.stage, self.ordinal);

        let result = self.process_until_stopped();
        if result.is_err() {
            self.control.halt(self.stage_index);
            self.await_stop();
        }

        if let Some(hook) = &self.on_shutdown {
            hook(&mut self.handler);
        }
        self.state.set(StageState::Stopped);
        debug!(
            "worker {}-{} stopped at sequence {} ({} processed, {} skipped)",
            self.stage,
            self.ordinal,
            self.sequence.get(),
            self.processed,
            self.skipped
        );

        result.map(|()| WorkerReport {
            stage: self.stage.to_string(),
            ordinal: self.ordinal,
            processed: self.processed,
            skipped: self.skipped,
            last_sequence: self.sequence.get(),
        })
    }

    /// Parks a halted worker until the pipeline is told to stop, so the
    /// shutdown hook never runs ahead of [`Pipeline::shutdown`].
    fn await_stop(&self) {
        while !self.barrier.is_alerted() {
            thread::park();
        }
    }

    fn process_until_stopped(&mut self) -> Result<(), PipelineError> {
        let mut next = self.sequence.get() + 1;

        // Alerted only by shutdown.
        while let Ok(available) = self.barrier.wait_for(next) {
            if available >= next {
                self.process_batch(next, available)?;
                next = available + 1;
            }
        }

        self.state.set(StageState::Draining);
        let target = self.control.drain_target.load(Ordering::SeqCst);
        let mut backoff = Backoff::new();
        while next <= target {
            let available = self.barrier.available_sequence(next).min(target);
            if available >= next {
                self.process_batch(next, available)?;
                next = available + 1;
                backoff.reset();
            } else if self.control.upstream_halted(self.stage_index) {
                warn!(
                    "worker {}-{} stopping at {} of {}: upstream stage halted",
                    self.stage,
                    self.ordinal,
                    next - 1,
                    target
                );
                break;
            } else {
                backoff.snooze();
            }
        }
        Ok(())
    }

    /// Hands this worker's sequences in `next..=available` to the handler and
    /// then moves the worker's sequence to `available`.
    fn process_batch(&mut self, next: i64, available: i64) -> Result<(), PipelineError> {
        let fan_out = self.fan_out as i64;
        let ordinal = self.ordinal as i64;
        let first_owned = next + (ordinal - next).rem_euclid(fan_out);
        let last_owned = available - (available - ordinal).rem_euclid(fan_out);

        if first_owned <= available {
            for sequence in (first_owned..=available).step_by(self.fan_out) {
                debug_assert_partition!(sequence, self.ordinal, self.fan_out);
                // SAFETY: `sequence` belongs to this worker's partition, every
                // upstream handler has passed it, and neither downstream
                // stages nor producers can reach it before our sequence does.
                let event = unsafe { self.ring.slot_mut(sequence) };
                match self.handler.on_event(event, sequence, sequence == last_owned) {
                    Ok(()) => self.processed += 1,
                    Err(source) => self.on_handler_error(sequence, source)?,
                }
            }
        }

        debug_assert_monotonic!("worker sequence", next - 1, available);
        self.sequence.set(available);
        Ok(())
    }

    fn on_handler_error(&mut self, sequence: i64, source: HandlerError) -> Result<(), PipelineError> {
        match self.fault_policy {
            FaultPolicy::Skip => {
                self.skipped += 1;
                warn!(
                    "worker {}-{} skipped sequence {}: {}",
                    self.stage, self.ordinal, sequence, source
                );
                Ok(())
            }
            FaultPolicy::Halt => {
                self.sequence.set(sequence - 1);
                error!(
                    "worker {}-{} halted at sequence {}: {}",
                    self.stage, self.ordinal, sequence, source
                );
                Err(PipelineError::HandlerFailed {
                    stage: self.stage.to_string(),
                    ordinal: self.ordinal,
                    sequence,
                    source,
                })
            }
        }
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Final counters of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub stage: String,
    pub ordinal: usize,
    /// Events the handler accepted.
    pub processed: u64,
    /// Events whose handler failed under [`FaultPolicy::Skip`].
    pub skipped: u64,
    /// The worker's sequence when it stopped.
    pub last_sequence: i64,
}

/// Outcome of [`Pipeline::shutdown`], one entry per worker in stage order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub workers: Vec<WorkerReport>,
}

impl PipelineReport {
    /// Reports of every worker in `stage`.
    pub fn stage<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a WorkerReport> + 'a {
        self.workers.iter().filter(move |w| w.stage == stage)
    }

    /// Events processed by all workers of `stage`.
    pub fn processed(&self, stage: &str) -> u64 {
        self.stage(stage).map(|w| w.processed).sum()
    }
}

// =============================================================================
// BUILDER & RUNNING PIPELINE
// =============================================================================

/// Assembles stages over a ring. See the [module docs](self).
pub struct PipelineBuilder<T> {
    ring: RingBuffer<T>,
    stages: Vec<Box<dyn StageLauncher<T>>>,
}

impl<T> PipelineBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// Takes ownership of `ring`; slots are only reachable through the
    /// pipeline's producers and workers from here on.
    pub fn new(ring: RingBuffer<T>) -> Self {
        Self {
            ring,
            stages: Vec::new(),
        }
    }

    /// Appends a stage that reads behind every handler of the previous one.
    #[must_use]
    pub fn then<H>(mut self, stage: Stage<H>) -> Self
    where
        H: EventHandler<T> + 'static,
    {
        self.stages.push(Box::new(stage));
        self
    }

    /// Spawns one thread per handler and returns the running pipeline.
    pub fn start(self) -> Result<Pipeline<T>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        let names: Vec<Arc<str>> = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| match stage.name() {
                Some(name) => Arc::from(name),
                None => Arc::from(format!("stage-{index}")),
            })
            .collect();
        for (stage, name) in self.stages.iter().zip(&names) {
            if stage.fan_out() == 0 {
                return Err(PipelineError::EmptyStage(name.to_string()));
            }
        }

        let ring = Arc::new(self.ring);
        let start_at = ring.cursor();
        let last = self.stages.len() - 1;
        let mut pipeline = Pipeline {
            ring: Arc::clone(&ring),
            control: Arc::new(Control::new()),
            barriers: Vec::with_capacity(self.stages.len()),
            workers: Vec::new(),
            final_sequences: Vec::new(),
        };
        info!(
            "starting pipeline: {} stages, fan-out {:?}, ring capacity {}",
            self.stages.len(),
            self.stages.iter().map(|s| s.fan_out()).collect::<Vec<_>>(),
            ring.capacity()
        );

        let mut upstream: Vec<Arc<Sequence>> = Vec::new();
        for ((index, stage), name) in self.stages.into_iter().enumerate().zip(names) {
            let sequences: Vec<Arc<Sequence>> = (0..stage.fan_out())
                .map(|_| Arc::new(Sequence::new(start_at)))
                .collect();
            if index == last {
                ring.add_gating_sequences(&sequences);
                pipeline.final_sequences.clone_from(&sequences);
            }
            let barrier = Arc::new(ring.new_barrier(&upstream));
            pipeline.barriers.push(Arc::clone(&barrier));

            let ctx = StageContext {
                index,
                name,
                ring: Arc::clone(&ring),
                barrier,
                sequences: sequences.clone(),
                control: Arc::clone(&pipeline.control),
            };
            // On error `pipeline` is dropped, which stops the workers
            // spawned so far.
            stage.launch(ctx, &mut pipeline.workers)?;
            upstream = sequences;
        }

        Ok(pipeline)
    }
}

impl<T> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("ring", &self.ring)
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// A running pipeline. Dropping it without [`shutdown`](Self::shutdown)
/// still stops and joins every worker, discarding the report.
pub struct Pipeline<T> {
    ring: Arc<RingBuffer<T>>,
    control: Arc<Control>,
    barriers: Vec<Arc<SequenceBarrier>>,
    workers: Vec<WorkerHandle>,
    final_sequences: Vec<Arc<Sequence>>,
}

impl<T> Pipeline<T> {
    /// Registers a producer on the pipeline's ring.
    pub fn producer(&self) -> Result<Producer<T>, RingError> {
        self.ring.producer()
    }

    /// Producer cursor of the pipeline's ring.
    pub fn cursor(&self) -> i64 {
        self.ring.cursor()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Highest sequence every final-stage handler has passed.
    pub fn completed_sequence(&self) -> i64 {
        minimum_sequence(&self.final_sequences, i64::MAX)
    }

    /// State of every worker, in stage order.
    pub fn worker_states(&self) -> Vec<StageState> {
        self.workers.iter().map(|w| w.state.get()).collect()
    }

    /// True if a worker halted on a handler error or panic.
    pub fn is_halted(&self) -> bool {
        self.control.halted_stage.load(Ordering::SeqCst) != usize::MAX
    }

    /// Drains every worker up to the current cursor and joins them.
    ///
    /// Returns the first handler failure or worker panic, if any.
    pub fn shutdown(mut self) -> Result<PipelineReport, PipelineError> {
        info!("shutting down pipeline at sequence {}", self.ring.cursor());
        self.signal_stop();
        self.join_workers()
    }

    fn signal_stop(&self) {
        self.control
            .drain_target
            .store(self.ring.cursor(), Ordering::SeqCst);
        for barrier in &self.barriers {
            barrier.alert();
        }
        for worker in &self.workers {
            worker.join.thread().unpark();
        }
    }

    fn join_workers(&mut self) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();
        let mut first_error = None;

        for worker in self.workers.drain(..) {
            let outcome = match worker.join.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(PipelineError::WorkerPanicked(format!(
                    "{}-{}",
                    worker.stage, worker.ordinal
                ))),
            };
            match outcome {
                Ok(worker_report) => report.workers.push(worker_report),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!("additional pipeline failure: {err}"),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl<T> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.signal_stop();
            if let Err(err) = self.join_workers() {
                warn!("pipeline dropped with failure: {err}");
            }
        }
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("ring", &self.ring)
            .field("workers", &self.workers.len())
            .field("completed", &self.completed_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ProducerMode, WaitStrategyKind};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn ring(mode: ProducerMode, wait: WaitStrategyKind) -> RingBuffer<i64> {
        let config = Config::default()
            .with_capacity(16)
            .with_producer_mode(mode)
            .with_wait_strategy(wait);
        RingBuffer::with_default(config).unwrap()
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::Yielding))
            .start()
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoStages));

        let empty: Stage<FnHandler<fn(&mut i64, i64, bool) -> Result<(), HandlerError>>> =
            Stage::parallel(Vec::new()).named("nothing");
        let err = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::Yielding))
            .then(empty)
            .start()
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyStage(name) if name == "nothing"));
    }

    #[test]
    fn test_single_stage_sees_everything_in_order() {
        for wait in [WaitStrategyKind::Blocking, WaitStrategyKind::LiteBlocking] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let pipeline = PipelineBuilder::new(ring(ProducerMode::Single, wait))
                .then(Stage::single(from_fn(move |event: &mut i64, seq, _| {
                    sink.lock().unwrap().push((seq, *event));
                    Ok(())
                })))
                .start()
                .unwrap();

            let mut producer = pipeline.producer().unwrap();
            for i in 0..100 {
                producer.publish_event(|slot, _| *slot = i * 3).unwrap();
            }
            drop(producer);

            let report = pipeline.shutdown().unwrap();
            let seen = seen.lock().unwrap();
            let expected: Vec<_> = (0..100).map(|i| (i, i * 3)).collect();
            assert_eq!(*seen, expected, "{wait}");
            assert_eq!(report.processed("stage-0"), 100);
            assert_eq!(report.workers[0].last_sequence, 99);
        }
    }

    #[test]
    fn test_lifecycle_hooks_and_states() {
        struct Counting {
            started: bool,
            count: u64,
            total: Arc<AtomicI64>,
        }
        impl EventHandler<i64> for Counting {
            fn on_event(&mut self, _: &mut i64, _: i64, _: bool) -> Result<(), HandlerError> {
                assert!(self.started);
                self.count += 1;
                Ok(())
            }
        }

        let total = Arc::new(AtomicI64::new(0));
        let handlers = (0..2)
            .map(|_| Counting {
                started: false,
                count: 0,
                total: Arc::clone(&total),
            })
            .collect();
        let pipeline = PipelineBuilder::new(ring(ProducerMode::Multi, WaitStrategyKind::Yielding))
            .then(
                Stage::parallel(handlers)
                    .named("count")
                    .on_start(|h: &mut Counting| h.started = true)
                    .on_shutdown(|h: &mut Counting| {
                        h.total.fetch_add(h.count as i64, Ordering::SeqCst);
                    }),
            )
            .start()
            .unwrap();

        wait_until(|| pipeline.worker_states().iter().all(|s| *s == StageState::Running));

        let mut producer = pipeline.producer().unwrap();
        for _ in 0..40 {
            producer.publish_event(|slot, seq| *slot = seq).unwrap();
        }
        drop(producer);

        let report = pipeline.shutdown().unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 40);
        assert_eq!(report.processed("count"), 40);
        assert!(report.stage("count").all(|w| w.processed == 20));
    }

    #[test]
    fn test_skip_policy_continues() {
        let pipeline = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::Yielding))
            .then(
                Stage::single(from_fn(|event: &mut i64, _, _| {
                    if *event % 5 == 0 {
                        Err(HandlerError::msg("multiple of five"))
                    } else {
                        Ok(())
                    }
                }))
                .named("picky")
                .fault_policy(FaultPolicy::Skip),
            )
            .start()
            .unwrap();

        let mut producer = pipeline.producer().unwrap();
        for i in 0..20 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }
        drop(producer);

        let report = pipeline.shutdown().unwrap();
        assert_eq!(report.workers[0].processed, 16);
        assert_eq!(report.workers[0].skipped, 4);
        assert_eq!(report.workers[0].last_sequence, 19);
    }

    #[test]
    fn test_halt_policy_reports_failure() {
        let pipeline = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::Yielding))
            .then(
                Stage::single(from_fn(|event: &mut i64, _, _| {
                    if *event == 7 {
                        Err(HandlerError::msg("poison"))
                    } else {
                        Ok(())
                    }
                }))
                .named("first"),
            )
            .then(Stage::single(from_fn(|_: &mut i64, _, _| Ok(()))).named("second"))
            .start()
            .unwrap();

        let mut producer = pipeline.producer().unwrap();
        for i in 0..10 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }
        drop(producer);

        wait_until(|| pipeline.is_halted());
        assert!(pipeline.completed_sequence() <= 6);

        match pipeline.shutdown() {
            Err(PipelineError::HandlerFailed {
                stage,
                ordinal,
                sequence,
                ..
            }) => {
                assert_eq!(stage, "first");
                assert_eq!(ordinal, 0);
                assert_eq!(sequence, 7);
            }
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_halted_worker_defers_shutdown_hook() {
        let hooked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hooked);
        let pipeline = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::BusySpin))
            .then(
                Stage::single(from_fn(|event: &mut i64, _, _| {
                    if *event == 3 {
                        Err(HandlerError::msg("poison"))
                    } else {
                        Ok(())
                    }
                }))
                .on_shutdown(move |_| flag.store(true, Ordering::SeqCst)),
            )
            .start()
            .unwrap();

        let mut producer = pipeline.producer().unwrap();
        for i in 0..5 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }
        drop(producer);

        wait_until(|| pipeline.is_halted());
        thread::sleep(Duration::from_millis(20));
        assert!(!hooked.load(Ordering::SeqCst));

        assert!(matches!(
            pipeline.shutdown(),
            Err(PipelineError::HandlerFailed { sequence: 3, .. })
        ));
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_stops_workers() {
        let pipeline = PipelineBuilder::new(ring(ProducerMode::Single, WaitStrategyKind::Blocking))
            .then(Stage::single(from_fn(|_: &mut i64, _, _| Ok(()))))
            .start()
            .unwrap();
        drop(pipeline);
    }
}
