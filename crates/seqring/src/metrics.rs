use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for a ring, poller or pipeline worker.
///
/// All updates are Relaxed: counters are statistics, never used for
/// synchronisation.
#[derive(Debug, Default)]
pub struct Metrics {
    claims: AtomicU64,
    claim_failures: AtomicU64,
    events_published: AtomicU64,
    events_processed: AtomicU64,
    batches_processed: AtomicU64,
    processing_polls: AtomicU64,
    gating_polls: AtomicU64,
    idle_polls: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub claims: u64,
    pub claim_failures: u64,
    pub events_published: u64,
    pub events_processed: u64,
    pub batches_processed: u64,
    pub processing_polls: u64,
    pub gating_polls: u64,
    pub idle_polls: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_claim_failure(&self) {
        self.claim_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_events_published(&self, n: u64) {
        self.events_published.fetch_add(n, Ordering::Relaxed);
    }

    /// Records one processed batch of `n` events.
    #[inline]
    pub(crate) fn add_batch(&self, n: u64) {
        self.events_processed.fetch_add(n, Ordering::Relaxed);
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_processing_poll(&self) {
        self.processing_polls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_gating_poll(&self) {
        self.gating_polls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_idle_poll(&self) {
        self.idle_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Events processed so far.
    #[inline]
    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claims: self.claims.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            processing_polls: self.processing_polls.load(Ordering::Relaxed),
            gating_polls: self.gating_polls.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
        }
    }
}
