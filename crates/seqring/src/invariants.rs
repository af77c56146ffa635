//! Debug assertion macros for the sequencing protocol.
//!
//! Only active in debug builds (`debug_assert!`), so there is zero overhead in
//! release builds.
//!
//! Used by the sequencers, `Claim`, `EventPoller` and pipeline workers.

// =============================================================================
// Backpressure: a claim never laps the slowest consumer
// =============================================================================

/// Assert that a granted claim stays within one ring length of the slowest
/// gating sequence.
///
/// **Invariant**: `claim_end - capacity <= min(gating)`
///
/// Used in: `next()` / `try_next()` after the capacity check succeeded
macro_rules! debug_assert_claim_within_capacity {
    ($claim_end:expr, $min_gating:expr, $capacity:expr) => {
        debug_assert!(
            $claim_end - $capacity <= $min_gating,
            "claim ending at {} laps slowest gating sequence {} (capacity {})",
            $claim_end,
            $min_gating,
            $capacity
        )
    };
}

// =============================================================================
// Monotonic progress
// =============================================================================

/// Assert that a sequence only moves forward.
///
/// **Invariant**: `new_value >= old_value`
///
/// Used in: cursor publish, poller and worker sequence updates
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// Contiguous publication
// =============================================================================

/// Assert that the availability scan returned a sequence inside the scanned
/// window.
///
/// **Invariant**: `lower - 1 <= highest <= available`
///
/// Used in: `MultiProducerSequencer::highest_published_sequence()`
macro_rules! debug_assert_contiguous_scan {
    ($lower:expr, $highest:expr, $available:expr) => {
        debug_assert!(
            $highest >= $lower - 1 && $highest <= $available,
            "availability scan from {} returned {} outside window ending at {}",
            $lower,
            $highest,
            $available
        )
    };
}

// =============================================================================
// Slot ownership
// =============================================================================

/// Assert that a claim only touches slots inside its claimed range.
///
/// **Invariant**: `low <= sequence <= high`
///
/// Used in: `Claim::get_mut()`
macro_rules! debug_assert_claimed {
    ($sequence:expr, $low:expr, $high:expr) => {
        debug_assert!(
            $sequence >= $low && $sequence <= $high,
            "sequence {} outside claimed range [{}, {}]",
            $sequence,
            $low,
            $high
        )
    };
}

/// Assert that a parallel handler only mutates its own partition.
///
/// **Invariant**: `sequence mod fan_out == ordinal`
///
/// Used in: pipeline workers before handing out `&mut T`
macro_rules! debug_assert_partition {
    ($sequence:expr, $ordinal:expr, $fan_out:expr) => {
        debug_assert!(
            $sequence.rem_euclid($fan_out as i64) == $ordinal as i64,
            "handler {} of {} touched sequence {} outside its partition",
            $ordinal,
            $fan_out,
            $sequence
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_claim_within_capacity;
pub(crate) use debug_assert_claimed;
pub(crate) use debug_assert_contiguous_scan;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_partition;
