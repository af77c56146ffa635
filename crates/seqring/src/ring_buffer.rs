use crate::barrier::SequenceBarrier;
use crate::error::RingError;
use crate::invariants::debug_assert_claimed;
use crate::poller::EventPoller;
use crate::sequence::Sequence;
use crate::sequencer::Sequencer;
use crate::{Config, Metrics, MetricsSnapshot, ProducerMode};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// SLOT ACCESS DISCIPLINE
// =============================================================================
//
// Slots are pre-allocated once and overwritten in place; there is no locking
// around slot contents. Every access is justified by the sequencing protocol:
//
// - A producer may write slot `s & mask` only while holding a `Claim` that
//   covers `s`. The claim was granted only after every gating sequence passed
//   `s - capacity`, so no consumer is still reading the previous lap, and no
//   consumer can read `s` before the claim is published.
// - A poller may read (`&T`) sequences in `(its sequence, available]`, where
//   `available` comes from its barrier. Several pollers may read the same slot
//   concurrently, which is why `RingBuffer<T>: Sync` requires `T: Sync`.
// - Pipeline workers mutate (`&mut T`) only sequences in their own partition,
//   after every upstream stage passed them; a pipeline takes the ring by value
//   so no poller can alias those slots.
//
// =============================================================================

/// Fixed-capacity circular buffer of reusable event slots.
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    sequencer: Arc<Sequencer>,
    /// Number of live `Producer` handles.
    producers: AtomicUsize,
    config: Config,
    metrics: Metrics,
}

// Safety: producers move values into slots from their own thread (T: Send);
// consumers on several threads may hold `&T` to the same slot (T: Sync).
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring whose slots are filled by `factory`.
    ///
    /// Fails with [`RingError::InvalidCapacity`] unless `config.capacity` is a
    /// power of two.
    pub fn new<F>(config: Config, mut factory: F) -> Result<Self, RingError>
    where
        F: FnMut() -> T,
    {
        if !config.has_valid_capacity() {
            return Err(RingError::InvalidCapacity {
                capacity: config.capacity,
            });
        }

        let slots = (0..config.capacity)
            .map(|_| UnsafeCell::new(factory()))
            .collect();
        let sequencer = Arc::new(Sequencer::new(
            config.producer_mode,
            config.capacity,
            config.wait_strategy.build(),
        ));

        Ok(Self {
            slots,
            mask: config.mask(),
            sequencer,
            producers: AtomicUsize::new(0),
            config,
            metrics: Metrics::new(),
        })
    }

    /// Creates a ring whose slots start as `T::default()`.
    pub fn with_default(config: Config) -> Result<Self, RingError>
    where
        T: Default,
    {
        Self::new(config, T::default)
    }

    // ---------------------------------------------------------------------
    // CONSTANTS & STATUS
    // ---------------------------------------------------------------------

    /// Returns the ring buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Slot index for `sequence`. `index_of(s) == index_of(s + capacity)`.
    #[inline]
    pub fn index_of(&self, sequence: i64) -> usize {
        (sequence as usize) & self.mask
    }

    /// Producer cursor: highest published sequence on a single-producer
    /// ring, highest claimed sequence on a multi-producer ring.
    #[inline]
    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor().get()
    }

    /// Slots that could be claimed right now.
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// True if `n` more slots could be claimed right now.
    pub fn has_available_capacity(&self, n: usize) -> bool {
        self.sequencer.has_available_capacity(n)
    }

    /// True if `sequence` is published and not yet lapped.
    pub fn is_published(&self, sequence: i64) -> bool {
        self.sequencer.is_available(sequence)
    }

    /// Minimum over all gating sequences (the slowest consumer).
    pub fn minimum_gating_sequence(&self) -> i64 {
        self.sequencer.minimum_gating_sequence()
    }

    /// Number of registered producers.
    pub fn producer_count(&self) -> usize {
        self.producers.load(Ordering::Acquire)
    }

    /// Producer-side metrics snapshot (zeros unless `enable_metrics`).
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ---------------------------------------------------------------------
    // CONSUMER REGISTRATION
    // ---------------------------------------------------------------------

    /// Registers consumer sequences that producers must not lap.
    ///
    /// Each sequence is moved to the current cursor.
    pub fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.sequencer.add_gating_sequences(sequences);
    }

    pub(crate) fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.sequencer.remove_gating_sequence(sequence)
    }

    /// Creates a barrier over the cursor and `dependents`.
    pub fn new_barrier(&self, dependents: &[Arc<Sequence>]) -> SequenceBarrier {
        SequenceBarrier::new(Arc::clone(&self.sequencer), dependents.to_vec())
    }

    /// Creates a non-blocking poller reading directly behind the producers.
    ///
    /// The poller's sequence is registered as a gating sequence and removed
    /// again when the poller is dropped.
    pub fn new_poller(self: &Arc<Self>) -> EventPoller<T> {
        self.new_poller_after(&[])
    }

    /// Creates a poller that only reads sequences every `upstream` sequence
    /// has passed.
    pub fn new_poller_after(self: &Arc<Self>, upstream: &[Arc<Sequence>]) -> EventPoller<T> {
        EventPoller::new(Arc::clone(self), upstream.to_vec())
    }

    // ---------------------------------------------------------------------
    // PRODUCER REGISTRATION
    // ---------------------------------------------------------------------

    /// Registers a producer.
    ///
    /// A single-producer ring accepts one live producer at a time and fails
    /// with [`RingError::TooManyProducers`] otherwise; dropping the handle
    /// frees the slot.
    pub fn producer(self: &Arc<Self>) -> Result<Producer<T>, RingError> {
        match self.config.producer_mode {
            ProducerMode::Single => {
                if self
                    .producers
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(RingError::TooManyProducers { max: 1 });
                }
            }
            ProducerMode::Multi => {
                self.producers.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(Producer {
            ring: Arc::clone(self),
        })
    }

    // ---------------------------------------------------------------------
    // SLOT ACCESS
    // ---------------------------------------------------------------------

    /// Shared access to the slot for `sequence`.
    ///
    /// # Safety
    ///
    /// The caller must have been granted read access to `sequence` by a
    /// barrier, and must hold a gating sequence below it.
    #[inline]
    pub(crate) unsafe fn slot(&self, sequence: i64) -> &T {
        &*self.slots[self.index_of(sequence)].get()
    }

    /// Exclusive access to the slot for `sequence`.
    ///
    /// # Safety
    ///
    /// The caller must be the only party granted access to `sequence` (a
    /// producer holding the claim, or the partition owner in a pipeline stage).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, sequence: i64) -> &mut T {
        &mut *self.slots[self.index_of(sequence)].get()
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("producer_mode", &self.config.producer_mode)
            .field("wait_strategy", &self.config.wait_strategy)
            .field("cursor", &self.sequencer.cursor().get_relaxed())
            .finish()
    }
}

/// Producer handle for claiming and publishing slots.
///
/// Not `Clone`: on a single-producer ring the handle is the proof that only
/// one thread claims sequences.
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Producer<T> {
    /// Claims the next slot, stalling while the ring is full.
    #[inline]
    pub fn next(&mut self) -> Result<Claim<'_, T>, RingError> {
        self.next_n(1)
    }

    /// Claims `n` consecutive slots, stalling while the ring is full.
    ///
    /// Fails only with [`RingError::InvalidClaimSize`].
    pub fn next_n(&mut self, n: usize) -> Result<Claim<'_, T>, RingError> {
        let high = self.ring.sequencer.next(n)?;
        Ok(self.claim(high, n))
    }

    /// Claims the next slot or fails with [`RingError::InsufficientCapacity`].
    #[inline]
    pub fn try_next(&mut self) -> Result<Claim<'_, T>, RingError> {
        self.try_next_n(1)
    }

    /// Claims `n` consecutive slots without blocking.
    pub fn try_next_n(&mut self, n: usize) -> Result<Claim<'_, T>, RingError> {
        match self.ring.sequencer.try_next(n) {
            Ok(high) => Ok(self.claim(high, n)),
            Err(err) => {
                if self.ring.config.enable_metrics && err.is_recoverable() {
                    self.ring.metrics.add_claim_failure();
                }
                Err(err)
            }
        }
    }

    /// Claims one slot, writes it with `write` and publishes it. Returns the
    /// published sequence.
    pub fn publish_event<F>(&mut self, write: F) -> Result<i64, RingError>
    where
        F: FnOnce(&mut T, i64),
    {
        let mut claim = self.next()?;
        let sequence = claim.sequence();
        write(claim.event_mut(), sequence);
        claim.publish();
        Ok(sequence)
    }

    /// Non-blocking [`publish_event`](Self::publish_event).
    pub fn try_publish_event<F>(&mut self, write: F) -> Result<i64, RingError>
    where
        F: FnOnce(&mut T, i64),
    {
        let mut claim = self.try_next()?;
        let sequence = claim.sequence();
        write(claim.event_mut(), sequence);
        claim.publish();
        Ok(sequence)
    }

    /// Capacity of the underlying ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Current producer cursor.
    #[inline]
    pub fn cursor(&self) -> i64 {
        self.ring.cursor()
    }

    fn claim(&self, high: i64, n: usize) -> Claim<'_, T> {
        if self.ring.config.enable_metrics {
            self.ring.metrics.add_claim();
        }
        Claim {
            ring: &self.ring,
            low: high - n as i64 + 1,
            high,
            published: false,
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.ring.producers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("ring", &self.ring)
            .finish()
    }
}

/// Exclusive write access to a claimed range of slots.
///
/// The range `low..=high` is published exactly once: by
/// [`publish`](Self::publish), or by `Drop` if the claim goes out of scope
/// unpublished. A claim is never abandoned, since an unpublished sequence
/// would stall every consumer behind it.
pub struct Claim<'a, T> {
    ring: &'a RingBuffer<T>,
    low: i64,
    high: i64,
    published: bool,
}

impl<T> Claim<'_, T> {
    /// Highest claimed sequence.
    #[inline]
    pub fn sequence(&self) -> i64 {
        self.high
    }

    /// Lowest claimed sequence.
    #[inline]
    pub fn low(&self) -> i64 {
        self.low
    }

    #[inline]
    pub fn high(&self) -> i64 {
        self.high
    }

    /// Number of claimed slots.
    #[inline]
    pub fn len(&self) -> usize {
        (self.high - self.low + 1) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The slot for the highest claimed sequence.
    #[inline]
    pub fn event_mut(&mut self) -> &mut T {
        // SAFETY: `high` is inside this claim and nobody else can access it
        // until publish.
        unsafe { self.ring.slot_mut(self.high) }
    }

    /// The slot for `sequence`, or `None` if it is not part of this claim.
    pub fn get_mut(&mut self, sequence: i64) -> Option<&mut T> {
        if sequence < self.low || sequence > self.high {
            return None;
        }
        // SAFETY: in range, see event_mut.
        Some(unsafe { self.ring.slot_mut(sequence) })
    }

    /// Visits every claimed slot in sequence order.
    pub fn for_each_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(i64, &mut T),
    {
        for sequence in self.low..=self.high {
            debug_assert_claimed!(sequence, self.low, self.high);
            // SAFETY: in range; claims never exceed capacity, so each sequence
            // maps to a distinct slot and only one `&mut` exists at a time.
            f(sequence, unsafe { self.ring.slot_mut(sequence) });
        }
    }

    /// Makes the claimed range visible to consumers.
    pub fn publish(mut self) {
        self.publish_once();
    }

    fn publish_once(&mut self) {
        if self.published {
            return;
        }
        self.published = true;
        self.ring.sequencer.publish_range(self.low, self.high);
        if self.ring.config.enable_metrics {
            self.ring.metrics.add_events_published(self.len() as u64);
        }
    }
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        self.publish_once();
    }
}
