//! Sequence barriers.
//!
//! A barrier tells a consumer how far it may safely read: the minimum of its
//! dependencies (the producer cursor for a first-stage consumer, or the
//! sequences of every upstream handler for a join), clipped to the highest
//! contiguously published sequence.

use crate::error::Alerted;
use crate::sequence::{minimum_sequence, Sequence};
use crate::sequencer::Sequencer;
use crate::wait_strategy::WaitStrategy;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-only view over the producer cursor and upstream sequences.
pub struct SequenceBarrier {
    sequencer: Arc<Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    dependents: Vec<Arc<Sequence>>,
    alerted: AtomicBool,
}

impl SequenceBarrier {
    /// Creates a barrier over `sequencer`'s cursor and the given upstream
    /// sequences. With no dependents the barrier follows the cursor directly.
    pub fn new(sequencer: Arc<Sequencer>, dependents: Vec<Arc<Sequence>>) -> Self {
        let wait_strategy = Arc::clone(sequencer.wait_strategy());
        let cursor = Arc::clone(sequencer.cursor());
        Self {
            sequencer,
            wait_strategy,
            cursor,
            dependents,
            alerted: AtomicBool::new(false),
        }
    }

    /// Waits until `sequence` can be read and returns the highest readable
    /// sequence.
    ///
    /// The result can be lower than `sequence` on a multi-producer ring when a
    /// producer has claimed but not yet published an earlier slot; callers
    /// should simply retry.
    pub fn wait_for(&self, sequence: i64) -> Result<i64, Alerted> {
        self.check_alert()?;

        let available = self.wait_strategy.wait_for(sequence, self)?;
        if available < sequence {
            return Ok(available);
        }
        Ok(self
            .sequencer
            .highest_published_sequence(sequence, available))
    }

    /// Non-blocking form of [`wait_for`](Self::wait_for): highest readable
    /// sequence right now, given that `next` is the first unread one.
    #[inline]
    pub fn available_sequence(&self, next: i64) -> i64 {
        self.sequencer
            .highest_published_sequence(next, self.dependent_sequence())
    }

    /// Producer cursor value.
    #[inline]
    pub fn cursor_sequence(&self) -> i64 {
        self.cursor.get()
    }

    /// Minimum over the dependencies, or the cursor if there are none.
    ///
    /// Never exceeds the cursor, so a dependency set ahead of the producer
    /// cannot expose unclaimed slots.
    #[inline]
    pub fn dependent_sequence(&self) -> i64 {
        let cursor = self.cursor.get();
        if self.dependents.is_empty() {
            cursor
        } else {
            minimum_sequence(&self.dependents, cursor)
        }
    }

    /// Upstream sequences this barrier waits on.
    pub fn dependents(&self) -> &[Arc<Sequence>] {
        &self.dependents
    }

    /// Interrupts current and future waits until [`clear_alert`](Self::clear_alert).
    pub fn alert(&self) {
        self.alerted.store(true, Ordering::SeqCst);
        self.wait_strategy.signal_all_when_blocking();
    }

    pub fn clear_alert(&self) {
        self.alerted.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::SeqCst)
    }

    /// Fails with [`Alerted`] if the barrier was alerted.
    #[inline]
    pub fn check_alert(&self) -> Result<(), Alerted> {
        if self.is_alerted() {
            Err(Alerted)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for SequenceBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceBarrier")
            .field("cursor", &self.cursor.get_relaxed())
            .field("dependents", &self.dependents.len())
            .field("alerted", &self.is_alerted())
            .finish()
    }
}
