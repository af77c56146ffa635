//! Loom-based concurrency tests for seqring-rs.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings. The models below mirror
//! the claim / publish / availability protocol of the sequencers at a tiny
//! capacity so the state space stays manageable.

#![cfg(feature = "loom")]

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use loom::sync::Arc;
use loom::thread;

const CAPACITY: i64 = 2;
const SHIFT: u32 = 1;

/// Multi-producer ring reduced to its synchronisation skeleton.
struct LoomMultiRing {
    /// Highest claimed sequence.
    cursor: AtomicI64,
    /// Wrap cycle that last published each slot.
    available: [AtomicI32; CAPACITY as usize],
    /// Consumer gating sequence.
    consumer: AtomicI64,
    slots: [UnsafeCell<i64>; CAPACITY as usize],
}

unsafe impl Send for LoomMultiRing {}
unsafe impl Sync for LoomMultiRing {}

impl LoomMultiRing {
    fn new() -> Self {
        Self {
            cursor: AtomicI64::new(-1),
            available: [AtomicI32::new(-1), AtomicI32::new(-1)],
            consumer: AtomicI64::new(-1),
            slots: [UnsafeCell::new(0), UnsafeCell::new(0)],
        }
    }

    fn index(sequence: i64) -> usize {
        (sequence & (CAPACITY - 1)) as usize
    }

    /// CAS claim of one sequence, failing when it would lap the consumer.
    fn try_claim(&self) -> Option<i64> {
        loop {
            let current = self.cursor.load(Ordering::Acquire);
            let next = current + 1;
            if next - CAPACITY > self.consumer.load(Ordering::Acquire) {
                return None;
            }
            if self
                .cursor
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(next);
            }
        }
    }

    fn write_and_publish(&self, sequence: i64, value: i64) {
        self.slots[Self::index(sequence)].with_mut(|slot| unsafe { *slot = value });
        self.available[Self::index(sequence)]
            .store((sequence >> SHIFT) as i32, Ordering::Release);
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.available[Self::index(sequence)].load(Ordering::Acquire) == (sequence >> SHIFT) as i32
    }

    /// Forward scan stopping at the first unpublished sequence.
    fn highest_published(&self, lower: i64, upper: i64) -> i64 {
        for sequence in lower..=upper {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
        }
        upper
    }

    /// Reads everything contiguously published after `consumer`.
    fn poll(&self, out: &mut Vec<i64>) {
        let current = self.consumer.load(Ordering::Relaxed);
        let next = current + 1;
        let upper = self.cursor.load(Ordering::Acquire);
        let available = self.highest_published(next, upper);
        for sequence in next..=available {
            let value = self.slots[Self::index(sequence)].with(|slot| unsafe { *slot });
            out.push(value);
        }
        if available >= next {
            self.consumer.store(available, Ordering::Release);
        }
    }
}

/// Two producers publish out of claim order; the consumer never reads an
/// unpublished slot and never skips a gap.
#[test]
fn loom_multi_producer_no_gap() {
    loom::model(|| {
        let ring = Arc::new(LoomMultiRing::new());

        let producers: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    if let Some(sequence) = ring.try_claim() {
                        ring.write_and_publish(sequence, 100 + sequence);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        ring.poll(&mut seen);
        for (i, value) in seen.iter().enumerate() {
            assert_eq!(*value, 100 + i as i64, "read out of order or unpublished");
        }

        for producer in producers {
            producer.join().unwrap();
        }
        ring.poll(&mut seen);
        assert_eq!(seen, vec![100, 101]);
    });
}

/// A slot is rewritten only after the consumer released the previous lap.
#[test]
fn loom_wraparound_respects_consumer() {
    loom::model(|| {
        let ring = Arc::new(LoomMultiRing::new());
        for _ in 0..2 {
            let sequence = ring.try_claim().unwrap();
            ring.write_and_publish(sequence, sequence);
        }
        assert!(ring.try_claim().is_none());

        let consumer_ring = Arc::clone(&ring);
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            consumer_ring.poll(&mut seen);
            seen
        });

        // Races with the consumer: either it is still behind (no claim) or the
        // claim reuses slot 0 after the consumer read it.
        if let Some(sequence) = ring.try_claim() {
            assert_eq!(sequence, 2);
            ring.write_and_publish(sequence, 2);
        }

        let seen = consumer.join().unwrap();
        assert_eq!(&seen[..2], &[0, 1]);
    });
}

struct Slot(UnsafeCell<i64>);

unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// Single-producer publish: the cursor store releases the payload.
#[test]
fn loom_single_producer_cursor_publish() {
    loom::model(|| {
        let cursor = Arc::new(AtomicI64::new(-1));
        let slot = Arc::new(Slot(UnsafeCell::new(0)));

        let producer = {
            let cursor = Arc::clone(&cursor);
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                slot.0.with_mut(|s| unsafe { *s = 42 });
                cursor.store(0, Ordering::Release);
            })
        };

        if cursor.load(Ordering::Acquire) >= 0 {
            assert_eq!(slot.0.with(|s| unsafe { *s }), 42);
        }
        producer.join().unwrap();
    });
}
