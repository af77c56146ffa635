//! Non-blocking, single-shot consumption.
//!
//! An [`EventPoller`] never waits: each call to [`EventPoller::poll`] handles
//! whatever is available right now and reports why it stopped, leaving the
//! scheduling of the next poll to the caller.

use crate::barrier::SequenceBarrier;
use crate::invariants::debug_assert_monotonic;
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::{Metrics, MetricsSnapshot};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollState {
    /// At least one event was handed to the handler.
    Processing,
    /// Producers have moved past us, but the next sequence is not readable
    /// yet (unpublished claim or a slower upstream consumer).
    Gating,
    /// Nothing new has been claimed.
    Idle,
}

/// Poll-based consumer over a [`RingBuffer`].
///
/// Created by [`RingBuffer::new_poller`] or [`RingBuffer::new_poller_after`].
/// The poller's sequence gates producers for as long as the poller lives.
pub struct EventPoller<T> {
    ring: Arc<RingBuffer<T>>,
    sequence: Arc<Sequence>,
    barrier: SequenceBarrier,
    max_batch_size: Option<usize>,
    metrics: Metrics,
}

impl<T> EventPoller<T> {
    pub(crate) fn new(ring: Arc<RingBuffer<T>>, upstream: Vec<Arc<Sequence>>) -> Self {
        let sequence = Arc::new(Sequence::default());
        ring.add_gating_sequences(&[Arc::clone(&sequence)]);
        let barrier = ring.new_barrier(&upstream);
        Self {
            ring,
            sequence,
            barrier,
            max_batch_size: None,
            metrics: Metrics::new(),
        }
    }

    /// Caps the number of events handled per poll (at least one).
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size.max(1));
        self
    }

    /// This poller's sequence, for use as an upstream of another consumer.
    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    /// Last sequence handled.
    #[inline]
    pub fn current(&self) -> i64 {
        self.sequence.get()
    }

    pub fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size
    }

    /// Poll counters (zeros unless the ring has `enable_metrics`).
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Hands every readable event to `handler` in sequence order.
    ///
    /// The handler receives `(event, sequence, end_of_batch)` and returns
    /// `false` to stop after the current event.
    pub fn poll<F>(&mut self, mut handler: F) -> PollState
    where
        F: FnMut(&T, i64, bool) -> bool,
    {
        match self.try_poll(|event, sequence, end_of_batch| {
            Ok::<_, Infallible>(handler(event, sequence, end_of_batch))
        }) {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`poll`](Self::poll).
    ///
    /// On error the poller's sequence stays at the last event the handler
    /// accepted, so the failed event is offered again on the next poll.
    pub fn try_poll<F, E>(&mut self, mut handler: F) -> Result<PollState, E>
    where
        F: FnMut(&T, i64, bool) -> Result<bool, E>,
    {
        let current = self.sequence.get();
        let next = current + 1;
        let available = self.barrier.available_sequence(next);

        if available < next {
            return Ok(self.stalled_state(next));
        }

        let batch_end = match self.max_batch_size {
            Some(max) => available.min(current.saturating_add(i64::try_from(max).unwrap_or(i64::MAX))),
            None => available,
        };

        let mut processed = current;
        let mut outcome = Ok(PollState::Processing);
        for sequence in next..=batch_end {
            // SAFETY: `sequence` is published and at or below every upstream
            // sequence, and producers cannot reclaim it while our gating
            // sequence is below it.
            let event = unsafe { self.ring.slot(sequence) };
            match handler(event, sequence, sequence == batch_end) {
                Ok(keep_going) => {
                    processed = sequence;
                    if !keep_going {
                        break;
                    }
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if processed > current {
            debug_assert_monotonic!("poller sequence", current, processed);
            self.sequence.set(processed);
        }
        if self.ring.config().enable_metrics {
            self.metrics.add_processing_poll();
            self.metrics.add_batch((processed - current) as u64);
        }
        outcome
    }

    fn stalled_state(&self, next: i64) -> PollState {
        let gating = self.barrier.cursor_sequence() >= next;
        if self.ring.config().enable_metrics {
            if gating {
                self.metrics.add_gating_poll();
            } else {
                self.metrics.add_idle_poll();
            }
        }
        if gating {
            PollState::Gating
        } else {
            PollState::Idle
        }
    }
}

impl<T> Drop for EventPoller<T> {
    fn drop(&mut self) {
        self.ring.remove_gating_sequence(&self.sequence);
    }
}

impl<T> fmt::Debug for EventPoller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPoller")
            .field("sequence", &self.sequence.get_relaxed())
            .field("max_batch_size", &self.max_batch_size)
            .field("barrier", &self.barrier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ProducerMode, WaitStrategyKind};

    fn ring(mode: ProducerMode) -> Arc<RingBuffer<u64>> {
        let config = Config::default()
            .with_capacity(16)
            .with_producer_mode(mode)
            .with_wait_strategy(WaitStrategyKind::BusySpin)
            .with_metrics(true);
        Arc::new(RingBuffer::with_default(config).unwrap())
    }

    #[test]
    fn test_processing_then_idle() {
        let ring = ring(ProducerMode::Single);
        let mut poller = ring.new_poller();
        let mut producer = ring.producer().unwrap();
        assert_eq!(poller.poll(|_, _, _| true), PollState::Idle);

        for i in 0..5 {
            producer.publish_event(|slot, _| *slot = i * 2).unwrap();
        }

        let mut seen = Vec::new();
        let state = poller.poll(|event, seq, end| {
            seen.push((*event, seq, end));
            true
        });
        assert_eq!(state, PollState::Processing);
        assert_eq!(
            seen,
            vec![(0, 0, false), (2, 1, false), (4, 2, false), (6, 3, false), (8, 4, true)]
        );
        assert_eq!(poller.current(), 4);
        assert_eq!(poller.poll(|_, _, _| true), PollState::Idle);

        let m = poller.metrics();
        assert_eq!(m.processing_polls, 1);
        assert_eq!(m.idle_polls, 2);
        assert_eq!(m.events_processed, 5);
    }

    #[test]
    fn test_gating_on_unpublished_claim() {
        let ring = ring(ProducerMode::Multi);
        let mut poller = ring.new_poller();
        let mut first = ring.producer().unwrap();
        let mut second = ring.producer().unwrap();

        let claim = first.next().unwrap();
        second.publish_event(|slot, _| *slot = 1).unwrap();
        // Sequence 1 is published, sequence 0 is still claimed.
        assert_eq!(poller.poll(|_, _, _| true), PollState::Gating);
        assert_eq!(poller.current(), -1);

        claim.publish();
        let mut seqs = Vec::new();
        assert_eq!(
            poller.poll(|_, seq, _| {
                seqs.push(seq);
                true
            }),
            PollState::Processing
        );
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(poller.metrics().gating_polls, 1);
    }

    #[test]
    fn test_handler_stop_and_batch_cap() {
        let ring = ring(ProducerMode::Single);
        let mut poller = ring.new_poller().with_max_batch_size(3);
        let mut producer = ring.producer().unwrap();
        for i in 0..10 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }

        let mut ends = Vec::new();
        poller.poll(|_, seq, end| {
            ends.push((seq, end));
            true
        });
        assert_eq!(ends, vec![(0, false), (1, false), (2, true)]);
        assert_eq!(poller.current(), 2);

        let mut count = 0;
        poller.poll(|_, _, _| {
            count += 1;
            count < 2
        });
        assert_eq!(count, 2);
        assert_eq!(poller.current(), 4);
    }

    #[test]
    fn test_huge_batch_cap_drains_everything() {
        let ring = ring(ProducerMode::Single);
        let mut poller = ring.new_poller().with_max_batch_size(usize::MAX);
        let mut producer = ring.producer().unwrap();
        for i in 0..3 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }

        let mut handled = 0;
        assert_eq!(
            poller.poll(|_, _, _| {
                handled += 1;
                true
            }),
            PollState::Processing
        );
        assert_eq!(handled, 3);
        assert_eq!(poller.current(), 2);
        assert_eq!(poller.poll(|_, _, _| true), PollState::Idle);
    }

    #[test]
    fn test_upstream_ahead_of_cursor_only_sees_published() {
        let config = Config::default()
            .with_capacity(8)
            .with_wait_strategy(WaitStrategyKind::BusySpin);
        let ring = Arc::new(RingBuffer::<u64>::with_default(config).unwrap());
        let upstream = Arc::new(Sequence::new(20));
        let mut poller = ring.new_poller_after(&[upstream]);
        let mut producer = ring.producer().unwrap();
        producer.publish_event(|slot, _| *slot = 7).unwrap();
        producer.publish_event(|slot, _| *slot = 7).unwrap();

        let mut seqs = Vec::new();
        let state = poller.poll(|event, seq, _| {
            assert_eq!(*event, 7);
            seqs.push(seq);
            true
        });
        assert_eq!(state, PollState::Processing);
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(poller.poll(|_, _, _| true), PollState::Idle);
    }

    #[test]
    fn test_try_poll_error_keeps_sequence() {
        let ring = ring(ProducerMode::Single);
        let mut poller = ring.new_poller();
        let mut producer = ring.producer().unwrap();
        for i in 0..4 {
            producer.publish_event(|slot, _| *slot = i).unwrap();
        }

        let result = poller.try_poll(|event, _, _| if *event == 2 { Err("bad event") } else { Ok(true) });
        assert_eq!(result, Err("bad event"));
        assert_eq!(poller.current(), 1);

        let mut retried = Vec::new();
        let result: Result<_, &str> = poller.try_poll(|event, _, _| {
            retried.push(*event);
            Ok(true)
        });
        assert_eq!(result, Ok(PollState::Processing));
        assert_eq!(retried, vec![2, 3]);
    }

    #[test]
    fn test_chained_poller_waits_for_upstream() {
        let ring = ring(ProducerMode::Single);
        let mut first = ring.new_poller();
        let mut second = ring.new_poller_after(&[Arc::clone(first.sequence())]);
        let mut producer = ring.producer().unwrap();
        producer.publish_event(|slot, _| *slot = 42).unwrap();

        assert_eq!(second.poll(|_, _, _| true), PollState::Gating);
        assert_eq!(first.poll(|_, _, _| true), PollState::Processing);
        assert_eq!(second.poll(|event, _, _| *event == 42), PollState::Processing);
        assert_eq!(second.current(), 0);
    }

    #[test]
    fn test_drop_releases_gating() {
        let ring = ring(ProducerMode::Single);
        let poller = ring.new_poller();
        let mut producer = ring.producer().unwrap();
        for i in 0..16 {
            producer.try_publish_event(|slot, _| *slot = i).unwrap();
        }
        assert!(!ring.has_available_capacity(1));
        drop(poller);
        assert!(ring.has_available_capacity(1));
    }
}
