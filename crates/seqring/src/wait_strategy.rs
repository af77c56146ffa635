//! Consumer wait strategies.
//!
//! A wait strategy decides how a consumer idles until a target sequence is
//! available. All strategies return the same values; they differ only in
//! latency and CPU usage:
//!
//! | strategy       | latency  | cpu      | producer signal cost            |
//! |----------------|----------|----------|---------------------------------|
//! | `BusySpin`     | lowest   | highest  | none                            |
//! | `Yielding`     | low      | moderate | none                            |
//! | `Blocking`     | highest  | lowest   | lock + notify on every publish  |
//! | `LiteBlocking` | high     | lowest   | lock + notify only when parked  |
//!
//! Every strategy first waits for the producer cursor and then for the
//! barrier's dependent sequences (upstream stages), and checks the barrier's
//! alert flag on every iteration so a shutdown can interrupt the wait.

use crate::barrier::SequenceBarrier;
use crate::error::Alerted;
use std::fmt;
use std::hint;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

/// Strategy used by consumers to wait for a sequence to become available.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Waits until `barrier`'s dependent sequence reaches `sequence` and returns
    /// it (it may be larger than `sequence`).
    ///
    /// Returns [`Alerted`] as soon as the barrier is alerted.
    fn wait_for(&self, sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted>;

    /// Wakes consumers parked inside [`wait_for`](Self::wait_for). Called by
    /// producers after every publish and by [`SequenceBarrier::alert`].
    fn signal_all_when_blocking(&self);
}

/// Spins on the dependent sequence once the cursor has been reached.
#[inline]
fn spin_for_dependents(sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted> {
    loop {
        let available = barrier.dependent_sequence();
        if available >= sequence {
            return Ok(available);
        }
        barrier.check_alert()?;
        hint::spin_loop();
    }
}

/// Tight poll loop. Appropriate when consumers are pinned to dedicated cores.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    #[inline]
    fn wait_for(&self, sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted> {
        spin_for_dependents(sequence, barrier)
    }

    #[inline]
    fn signal_all_when_blocking(&self) {}
}

/// Spins for `spin_tries` iterations, then yields the thread each cycle.
#[derive(Debug, Clone, Copy)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub const fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new(100)
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(&self, sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted> {
        let mut counter = self.spin_tries;
        loop {
            let available = barrier.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            barrier.check_alert()?;
            if counter == 0 {
                thread::yield_now();
            } else {
                counter -= 1;
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn signal_all_when_blocking(&self) {}
}

/// Parks consumers on a condition variable until the cursor moves.
///
/// Producers pay a lock acquisition on every publish.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(&self, sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted> {
        if barrier.cursor_sequence() < sequence {
            let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
            while barrier.cursor_sequence() < sequence {
                barrier.check_alert()?;
                guard = self
                    .condvar
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        spin_for_dependents(sequence, barrier)
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.condvar.notify_all();
    }
}

/// Blocking strategy that avoids the lock whenever it can.
///
/// Consumers only take the lock when the cursor is behind the target, and
/// producers only take it when a consumer announced that it is about to park
/// (`signal_needed`).
#[derive(Debug, Default)]
pub struct LiteBlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
    signal_needed: AtomicBool,
}

impl LiteBlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for LiteBlockingWaitStrategy {
    fn wait_for(&self, sequence: i64, barrier: &SequenceBarrier) -> Result<i64, Alerted> {
        if barrier.cursor_sequence() < sequence {
            let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                // Announce before re-checking: pairs with the fence in
                // signal_all_when_blocking so either we see the new cursor or
                // the producer sees the flag.
                self.signal_needed.store(true, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                if barrier.cursor_sequence() >= sequence {
                    break;
                }
                barrier.check_alert()?;
                guard = self
                    .condvar
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        spin_for_dependents(sequence, barrier)
    }

    fn signal_all_when_blocking(&self) {
        fence(Ordering::SeqCst);
        if self.signal_needed.swap(false, Ordering::SeqCst) {
            let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use crate::sequencer::Sequencer;
    use crate::{ProducerMode, WaitStrategyKind};
    use std::sync::Arc;
    use std::time::Duration;

    fn fixture(kind: WaitStrategyKind) -> (Arc<Sequencer>, Arc<dyn WaitStrategy>) {
        let strategy = kind.build();
        let sequencer = Arc::new(Sequencer::new(
            ProducerMode::Single,
            16,
            Arc::clone(&strategy),
        ));
        (sequencer, strategy)
    }

    const ALL: [WaitStrategyKind; 4] = [
        WaitStrategyKind::BusySpin,
        WaitStrategyKind::Yielding,
        WaitStrategyKind::Blocking,
        WaitStrategyKind::LiteBlocking,
    ];

    #[test]
    fn test_returns_immediately_when_available() {
        for kind in ALL {
            let (sequencer, _) = fixture(kind);
            let hi = sequencer.next(4).unwrap();
            sequencer.publish_range(0, hi);
            let barrier = SequenceBarrier::new(Arc::clone(&sequencer), Vec::new());
            assert_eq!(barrier.wait_for(2), Ok(3), "{kind}");
        }
    }

    #[test]
    fn test_wakes_on_publish() {
        for kind in ALL {
            let (sequencer, _) = fixture(kind);
            let barrier = SequenceBarrier::new(Arc::clone(&sequencer), Vec::new());

            let publisher = {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    let seq = sequencer.next(1).unwrap();
                    sequencer.publish(seq);
                })
            };

            assert_eq!(barrier.wait_for(0), Ok(0), "{kind}");
            publisher.join().unwrap();
        }
    }

    #[test]
    fn test_waits_for_dependents() {
        for kind in ALL {
            let (sequencer, _) = fixture(kind);
            let hi = sequencer.next(8).unwrap();
            sequencer.publish_range(0, hi);

            let upstream = Arc::new(Sequence::new(2));
            let barrier =
                SequenceBarrier::new(Arc::clone(&sequencer), vec![Arc::clone(&upstream)]);

            let advancer = {
                let upstream = Arc::clone(&upstream);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    upstream.set(6);
                })
            };

            assert_eq!(barrier.wait_for(5), Ok(6), "{kind}");
            advancer.join().unwrap();
        }
    }

    #[test]
    fn test_alert_interrupts_wait() {
        for kind in ALL {
            let (sequencer, _) = fixture(kind);
            let barrier = Arc::new(SequenceBarrier::new(Arc::clone(&sequencer), Vec::new()));

            let waiter = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait_for(0))
            };

            thread::sleep(Duration::from_millis(10));
            barrier.alert();
            assert_eq!(waiter.join().unwrap(), Err(Alerted), "{kind}");
        }
    }
}
