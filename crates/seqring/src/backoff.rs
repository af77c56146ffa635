use std::hint;
use std::thread;

/// Producer-side stall policy.
///
/// A producer blocked in `next()` on a full ring does not use the consumer
/// wait strategy; it backs off progressively instead: spin with PAUSE hints,
/// doubling each step, then yield to the OS on every further step. There is no
/// give-up point, a blocking claim stalls until consumers make room.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    spin_limit: u32,
}

impl Backoff {
    /// Default exponent limit: up to 2^6 = 64 spins per step before yielding.
    const DEFAULT_SPIN_LIMIT: u32 = 6;

    /// Creates a new backoff instance.
    #[inline]
    pub fn new() -> Self {
        Self::with_spin_limit(Self::DEFAULT_SPIN_LIMIT)
    }

    /// Creates a backoff that spins for `spin_limit` doubling steps before
    /// it starts yielding.
    #[inline]
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            step: 0,
            spin_limit,
        }
    }

    /// Waits a little longer than last time.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= self.spin_limit {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }

    /// True once spinning is exhausted and every snooze yields.
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.step > self.spin_limit
    }

    /// Reset for next wait cycle.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
