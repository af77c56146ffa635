use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Value every cursor and gating sequence starts from: nothing published,
/// nothing processed.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Cache-padded atomic sequence counter.
///
/// The same type plays three roles: the producer cursor, a consumer's gating
/// sequence ("processed up to"), and the sequencer's internal gating cache.
/// Values only move forward over the lifetime of a ring.
///
/// ## Memory ordering
///
/// - [`get`](Self::get) is an Acquire load and [`set`](Self::set) a Release
///   store. A consumer that observes a published cursor value therefore also
///   observes every slot write that preceded the publish.
/// - [`set_volatile`](Self::set_volatile) is a SeqCst store, used by the
///   single-producer sequencer where a cursor store must not be reordered
///   with the following loads of the gating sequences.
#[derive(Debug)]
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    /// Creates a sequence with the given initial value.
    pub const fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    /// Current value (Acquire).
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Current value without synchronisation, for statistics and debug output.
    #[inline]
    pub fn get_relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Stores a new value (Release).
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Stores a new value with a full fence (SeqCst).
    #[inline]
    pub fn set_volatile(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Atomically replaces `expected` with `new`. Returns `true` on success.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Adds `delta` and returns the previous value.
    #[inline]
    pub fn get_and_add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel)
    }

    /// Adds `delta` and returns the new value.
    #[inline]
    pub fn add_and_get(&self, delta: i64) -> i64 {
        self.get_and_add(delta) + delta
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_CURSOR_VALUE)
    }
}

/// Minimum over `sequences`, or `minimum` if it is smaller (or the slice is
/// empty).
#[inline]
pub fn minimum_sequence(sequences: &[Arc<Sequence>], minimum: i64) -> i64 {
    sequences
        .iter()
        .map(|s| s.get())
        .fold(minimum, i64::min)
}
