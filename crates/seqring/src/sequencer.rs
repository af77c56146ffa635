use crate::backoff::Backoff;
use crate::error::RingError;
use crate::invariants::{
    debug_assert_claim_within_capacity, debug_assert_contiguous_scan, debug_assert_monotonic,
};
use crate::sequence::{minimum_sequence, Sequence, INITIAL_CURSOR_VALUE};
use crate::wait_strategy::WaitStrategy;
use crate::ProducerMode;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

// =============================================================================
// CLAIM / PUBLISH PROTOCOL
// =============================================================================
//
// Sequences are unbounded i64 values; a slot index is `sequence & mask`.
//
// ## Backpressure
//
// A claim ending at sequence `s` is granted only when
//
//     s - capacity <= min(gating sequences)
//
// i.e. the slot being reused was fully processed by every registered consumer.
// Both variants cache the last observed minimum and only rescan the gating set
// when the cache says the claim might not fit.
//
// ## Single producer
//
// `next_value` / `cached_gating` are written by the one registered producer
// only. The cursor *is* the published position: publish is a Release store of
// the cursor, so slot writes happen-before any consumer that Acquire-loads it.
//
// ## Multi producer
//
// The cursor is the highest *claimed* sequence, advanced by CAS. Producers may
// finish writing out of claim order, so publication is tracked per slot in
// `available`: publish Release-stores the wrap cycle (`sequence >> shift`)
// into `available[sequence & mask]`. A consumer Acquire-loads the flag, and
// only a flag matching the expected cycle proves the payload for that exact
// sequence is visible. `highest_published_sequence` scans forward and stops
// at the first gap.
//
// =============================================================================

/// State shared by both sequencer variants.
#[derive(Debug)]
struct SequencerCore {
    buffer_size: usize,
    cursor: Arc<Sequence>,
    /// Gating set. Read only when the cached minimum is insufficient; written
    /// only while consumers register.
    gating: RwLock<Vec<Arc<Sequence>>>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl SequencerCore {
    fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        Self {
            buffer_size,
            cursor: Arc::new(Sequence::default()),
            gating: RwLock::new(Vec::new()),
            wait_strategy,
        }
    }

    #[inline]
    fn capacity(&self) -> i64 {
        self.buffer_size as i64
    }

    fn gating_minimum(&self, minimum: i64) -> i64 {
        let gating = self.gating.read().unwrap_or_else(PoisonError::into_inner);
        minimum_sequence(&gating, minimum)
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>], start_at: i64) {
        let mut gating = self.gating.write().unwrap_or_else(PoisonError::into_inner);
        for sequence in sequences {
            sequence.set(start_at);
            gating.push(Arc::clone(sequence));
        }
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut gating = self.gating.write().unwrap_or_else(PoisonError::into_inner);
        let before = gating.len();
        gating.retain(|s| !Arc::ptr_eq(s, sequence));
        gating.len() != before
    }

    fn validate_claim(&self, n: usize) -> Result<i64, RingError> {
        if n == 0 || n > self.buffer_size {
            return Err(RingError::InvalidClaimSize {
                requested: n,
                capacity: self.buffer_size,
            });
        }
        Ok(n as i64)
    }
}

/// Sequencer for a ring with exactly one producer.
#[derive(Debug)]
pub struct SingleProducerSequencer {
    core: SequencerCore,
    /// Highest sequence claimed so far (producer-owned).
    next_value: CachePadded<AtomicI64>,
    /// Last observed minimum gating sequence (producer-owned).
    cached_gating: CachePadded<AtomicI64>,
}

impl SingleProducerSequencer {
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        Self {
            core: SequencerCore::new(buffer_size, wait_strategy),
            next_value: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
            cached_gating: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
        }
    }

    // Relaxed is enough for next_value/cached_gating: the single registered
    // producer is their only writer, and every cross-thread hand-off goes
    // through the cursor or the gating sequences.

    fn next(&self, n: usize) -> Result<i64, RingError> {
        let n = self.core.validate_claim(n)?;
        let next_value = self.next_value.load(Ordering::Relaxed);
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.core.capacity();
        let cached = self.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            // StoreLoad: consumers must see our position before we read theirs.
            self.core.cursor.set_volatile(next_value);

            let mut backoff = Backoff::new();
            let mut min_sequence = self.core.gating_minimum(next_value);
            while wrap_point > min_sequence {
                backoff.snooze();
                min_sequence = self.core.gating_minimum(next_value);
            }
            debug_assert_claim_within_capacity!(next_sequence, min_sequence, self.core.capacity());
            self.cached_gating.store(min_sequence, Ordering::Relaxed);
        }

        self.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    fn try_next(&self, n: usize) -> Result<i64, RingError> {
        if n > self.core.buffer_size {
            return Err(RingError::InsufficientCapacity);
        }
        let n = self.core.validate_claim(n)?;
        let next_value = self.next_value.load(Ordering::Relaxed);
        if !self.has_available_capacity_from(next_value, n, true) {
            return Err(RingError::InsufficientCapacity);
        }
        let next_sequence = next_value + n;
        self.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    fn has_available_capacity_from(&self, next_value: i64, n: i64, store_cursor: bool) -> bool {
        let wrap_point = next_value + n - self.core.capacity();
        let cached = self.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            if store_cursor {
                self.core.cursor.set_volatile(next_value);
            }
            let min_sequence = self.core.gating_minimum(next_value);
            self.cached_gating.store(min_sequence, Ordering::Relaxed);
            if wrap_point > min_sequence {
                return false;
            }
        }
        true
    }

    fn publish(&self, sequence: i64) {
        debug_assert_monotonic!("cursor", self.core.cursor.get_relaxed(), sequence);
        self.core.cursor.set(sequence);
        self.core.wait_strategy.signal_all_when_blocking();
    }

    fn remaining_capacity(&self) -> i64 {
        let next_value = self.next_value.load(Ordering::Relaxed);
        let consumed = self.core.gating_minimum(next_value);
        self.core.capacity() - (next_value - consumed)
    }

    fn is_available(&self, sequence: i64) -> bool {
        let current = self.core.cursor.get();
        sequence <= current && sequence > current - self.core.capacity()
    }
}

/// Sequencer for a ring shared by any number of producers.
#[derive(Debug)]
pub struct MultiProducerSequencer {
    core: SequencerCore,
    gating_cache: Sequence,
    /// Wrap cycle that last published each slot, `-1` before the first lap.
    available: Box<[AtomicI32]>,
    index_mask: usize,
    index_shift: u32,
}

impl MultiProducerSequencer {
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        let available = (0..buffer_size).map(|_| AtomicI32::new(-1)).collect();
        Self {
            core: SequencerCore::new(buffer_size, wait_strategy),
            gating_cache: Sequence::default(),
            available,
            index_mask: buffer_size - 1,
            index_shift: buffer_size.trailing_zeros(),
        }
    }

    fn next(&self, n: usize) -> Result<i64, RingError> {
        let n = self.core.validate_claim(n)?;
        let mut backoff = Backoff::new();
        loop {
            let current = self.core.cursor.get();
            let next = current + n;
            let wrap_point = next - self.core.capacity();
            let cached = self.gating_cache.get();

            if wrap_point > cached || cached > current {
                let min_sequence = self.core.gating_minimum(current);
                if wrap_point > min_sequence {
                    backoff.snooze();
                    continue;
                }
                self.gating_cache.set(min_sequence);
            } else if self.core.cursor.compare_and_set(current, next) {
                debug_assert_claim_within_capacity!(next, cached, self.core.capacity());
                return Ok(next);
            }
        }
    }

    fn try_next(&self, n: usize) -> Result<i64, RingError> {
        if n > self.core.buffer_size {
            return Err(RingError::InsufficientCapacity);
        }
        let n = self.core.validate_claim(n)?;
        loop {
            let current = self.core.cursor.get();
            let next = current + n;
            if !self.has_available_capacity_from(current, n) {
                return Err(RingError::InsufficientCapacity);
            }
            if self.core.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn has_available_capacity_from(&self, cursor_value: i64, n: i64) -> bool {
        let wrap_point = cursor_value + n - self.core.capacity();
        let cached = self.gating_cache.get();

        if wrap_point > cached || cached > cursor_value {
            let min_sequence = self.core.gating_minimum(cursor_value);
            self.gating_cache.set(min_sequence);
            if wrap_point > min_sequence {
                return false;
            }
        }
        true
    }

    #[inline]
    fn index_of(&self, sequence: i64) -> usize {
        (sequence as usize) & self.index_mask
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    #[inline]
    fn set_available(&self, sequence: i64) {
        self.available[self.index_of(sequence)]
            .store(self.availability_flag(sequence), Ordering::Release);
    }

    fn publish_range(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.core.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.available[self.index_of(sequence)].load(Ordering::Acquire)
            == self.availability_flag(sequence)
    }

    fn highest_published_sequence(&self, lower_bound: i64, available: i64) -> i64 {
        let mut highest = available;
        for sequence in lower_bound..=available {
            if !self.is_available(sequence) {
                highest = sequence - 1;
                break;
            }
        }
        debug_assert_contiguous_scan!(lower_bound, highest, available);
        highest
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.core.cursor.get();
        let consumed = self.core.gating_minimum(produced);
        self.core.capacity() - (produced - consumed)
    }
}

/// Claim/publish protocol for a ring, chosen by [`ProducerMode`].
#[derive(Debug)]
pub enum Sequencer {
    Single(SingleProducerSequencer),
    Multi(MultiProducerSequencer),
}

impl Sequencer {
    /// Creates the sequencer for `mode`. `buffer_size` must be a power of two.
    pub fn new(mode: ProducerMode, buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        debug_assert!(buffer_size.is_power_of_two());
        match mode {
            ProducerMode::Single => Self::Single(SingleProducerSequencer::new(buffer_size, wait_strategy)),
            ProducerMode::Multi => Self::Multi(MultiProducerSequencer::new(buffer_size, wait_strategy)),
        }
    }

    #[inline]
    fn core(&self) -> &SequencerCore {
        match self {
            Self::Single(s) => &s.core,
            Self::Multi(m) => &m.core,
        }
    }

    /// Producer mode this sequencer implements.
    pub fn mode(&self) -> ProducerMode {
        match self {
            Self::Single(_) => ProducerMode::Single,
            Self::Multi(_) => ProducerMode::Multi,
        }
    }

    /// Ring capacity.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.core().buffer_size
    }

    /// The producer cursor. Published position for single-producer rings,
    /// claimed position for multi-producer rings.
    #[inline]
    pub fn cursor(&self) -> &Arc<Sequence> {
        &self.core().cursor
    }

    #[inline]
    pub fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.core().wait_strategy
    }

    /// Claims `n` sequences, stalling while the ring is full. Returns the
    /// highest claimed sequence; the lowest is `hi - n + 1`.
    pub fn next(&self, n: usize) -> Result<i64, RingError> {
        match self {
            Self::Single(s) => s.next(n),
            Self::Multi(m) => m.next(n),
        }
    }

    /// Claims `n` sequences or fails with [`RingError::InsufficientCapacity`]
    /// without blocking.
    pub fn try_next(&self, n: usize) -> Result<i64, RingError> {
        match self {
            Self::Single(s) => s.try_next(n),
            Self::Multi(m) => m.try_next(n),
        }
    }

    /// Makes `sequence` visible to consumers.
    pub fn publish(&self, sequence: i64) {
        self.publish_range(sequence, sequence);
    }

    /// Makes `low..=high` visible to consumers.
    pub fn publish_range(&self, low: i64, high: i64) {
        match self {
            Self::Single(s) => s.publish(high),
            Self::Multi(m) => m.publish_range(low, high),
        }
    }

    /// True if `sequence` has been published and not yet lapped.
    pub fn is_available(&self, sequence: i64) -> bool {
        match self {
            Self::Single(s) => s.is_available(sequence),
            Self::Multi(m) => m.is_available(sequence),
        }
    }

    /// Highest sequence in `lower_bound..=available` such that every sequence
    /// from `lower_bound` up to it is published.
    pub fn highest_published_sequence(&self, lower_bound: i64, available: i64) -> i64 {
        match self {
            Self::Single(_) => available,
            Self::Multi(m) => m.highest_published_sequence(lower_bound, available),
        }
    }

    /// True if `n` more slots could be claimed right now.
    pub fn has_available_capacity(&self, n: usize) -> bool {
        let n = n as i64;
        match self {
            Self::Single(s) => {
                s.has_available_capacity_from(s.next_value.load(Ordering::Relaxed), n, false)
            }
            Self::Multi(m) => m.has_available_capacity_from(m.core.cursor.get(), n),
        }
    }

    /// Slots that could be claimed right now.
    pub fn remaining_capacity(&self) -> i64 {
        match self {
            Self::Single(s) => s.remaining_capacity(),
            Self::Multi(m) => m.remaining_capacity(),
        }
    }

    /// Minimum over the gating set, or the cursor if nothing gates.
    pub fn minimum_gating_sequence(&self) -> i64 {
        let core = self.core();
        core.gating_minimum(core.cursor.get())
    }

    /// Adds consumer sequences to the gating set. Each is moved to the current
    /// cursor so it does not hold back claims for slots it never saw.
    pub fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        let core = self.core();
        core.add_gating_sequences(sequences, core.cursor.get());
    }

    /// Removes a sequence from the gating set. Returns `true` if it was present.
    pub(crate) fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.core().remove_gating_sequence(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait_strategy::BusySpinWaitStrategy;

    fn sequencer(mode: ProducerMode, size: usize) -> Sequencer {
        Sequencer::new(mode, size, Arc::new(BusySpinWaitStrategy))
    }

    #[test]
    fn test_single_claims_are_contiguous() {
        let s = sequencer(ProducerMode::Single, 16);
        assert_eq!(s.next(1), Ok(0));
        assert_eq!(s.next(4), Ok(4));
        assert_eq!(s.try_next(2), Ok(6));
        // Not yet published.
        assert_eq!(s.cursor().get(), INITIAL_CURSOR_VALUE);
        s.publish(6);
        assert_eq!(s.cursor().get(), 6);
        assert!(s.is_available(3));
        assert!(!s.is_available(7));
    }

    #[test]
    fn test_try_next_rejects_more_than_capacity() {
        for mode in [ProducerMode::Single, ProducerMode::Multi] {
            let s = sequencer(mode, 8);
            assert_eq!(s.try_next(9), Err(RingError::InsufficientCapacity));
            assert_eq!(
                s.try_next(0),
                Err(RingError::InvalidClaimSize {
                    requested: 0,
                    capacity: 8
                })
            );
            assert_eq!(
                s.next(9),
                Err(RingError::InvalidClaimSize {
                    requested: 9,
                    capacity: 8
                })
            );
        }
    }

    #[test]
    fn test_try_next_respects_gating() {
        for mode in [ProducerMode::Single, ProducerMode::Multi] {
            let s = sequencer(mode, 8);
            let consumer = Arc::new(Sequence::default());
            s.add_gating_sequences(&[Arc::clone(&consumer)]);

            let hi = s.try_next(8).unwrap();
            assert_eq!(hi, 7);
            s.publish_range(0, hi);
            assert_eq!(s.remaining_capacity(), 0);
            assert!(!s.has_available_capacity(1));
            assert_eq!(s.try_next(1), Err(RingError::InsufficientCapacity));

            consumer.set(2);
            assert!(s.has_available_capacity(3));
            assert_eq!(s.try_next(3), Ok(10));
            assert_eq!(s.try_next(1), Err(RingError::InsufficientCapacity), "{mode:?}");
        }
    }

    #[test]
    fn test_multi_highest_published_stops_at_gap() {
        let s = sequencer(ProducerMode::Multi, 8);
        let hi = s.next(5).unwrap();
        assert_eq!(hi, 4);
        s.publish(0);
        s.publish(1);
        s.publish(3);
        s.publish(4);
        assert_eq!(s.highest_published_sequence(0, 4), 1);
        s.publish(2);
        assert_eq!(s.highest_published_sequence(0, 4), 4);
        assert_eq!(s.highest_published_sequence(3, 4), 4);
    }

    #[test]
    fn test_multi_availability_tracks_wrap_cycle() {
        let s = sequencer(ProducerMode::Multi, 4);
        let hi = s.next(4).unwrap();
        s.publish_range(0, hi);
        assert!(s.is_available(1));
        // Same slot, next lap: not published yet.
        assert!(!s.is_available(5));
    }

    #[test]
    fn test_gating_sequence_starts_at_cursor() {
        let s = sequencer(ProducerMode::Single, 8);
        let hi = s.next(3).unwrap();
        s.publish(hi);
        let late = Arc::new(Sequence::default());
        s.add_gating_sequences(&[Arc::clone(&late)]);
        assert_eq!(late.get(), 2);
        assert!(s.remove_gating_sequence(&late));
        assert!(!s.remove_gating_sequence(&late));
    }

    #[test]
    fn test_multi_concurrent_claims_never_overlap() {
        let s = Arc::new(sequencer(ProducerMode::Multi, 1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || (0..200).map(|_| s.next(1).unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..800).collect::<Vec<_>>());
    }
}
