use crate::wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, LiteBlockingWaitStrategy, WaitStrategy,
    YieldingWaitStrategy,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// How many threads may claim sequences concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerMode {
    /// Exactly one producer; claims need no CAS.
    #[default]
    Single,
    /// Any number of producers; claims go through a CAS on the shared cursor
    /// and publication is tracked per slot.
    Multi,
}

/// Consumer-side waiting policy, chosen at construction.
///
/// Changes latency and CPU usage, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategyKind {
    /// Tight poll loop. Lowest latency, one core burnt per waiting consumer.
    BusySpin,
    /// Spin for a bounded number of tries, then yield each cycle.
    Yielding,
    /// Lock + condition variable. Producers signal after publish.
    #[default]
    Blocking,
    /// Like `Blocking`, but skips the lock when data is already available and
    /// only signals when a consumer is actually parked.
    LiteBlocking,
}

impl WaitStrategyKind {
    /// Instantiates the strategy.
    pub fn build(self) -> Arc<dyn WaitStrategy> {
        match self {
            Self::BusySpin => Arc::new(BusySpinWaitStrategy),
            Self::Yielding => Arc::new(YieldingWaitStrategy::default()),
            Self::Blocking => Arc::new(BlockingWaitStrategy::new()),
            Self::LiteBlocking => Arc::new(LiteBlockingWaitStrategy::new()),
        }
    }

    /// Parameter name used by benchmark sweeps.
    pub const fn name(self) -> &'static str {
        match self {
            Self::BusySpin => "BusySpin",
            Self::Yielding => "Yielding",
            Self::Blocking => "Blocking",
            Self::LiteBlocking => "LiteBlocking",
        }
    }
}

impl fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown wait strategy name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown wait strategy `{0}` (expected BusySpin, Yielding, Blocking or LiteBlocking)")]
pub struct UnknownWaitStrategy(pub String);

impl FromStr for WaitStrategyKind {
    type Err = UnknownWaitStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BusySpin" => Ok(Self::BusySpin),
            "Yielding" => Ok(Self::Yielding),
            "Blocking" => Ok(Self::Blocking),
            "LiteBlocking" => Ok(Self::LiteBlocking),
            other => Err(UnknownWaitStrategy(other.to_owned())),
        }
    }
}

/// Configuration for a [`RingBuffer`](crate::RingBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of slots; must be a power of two.
    pub capacity: usize,
    /// Single or multi producer sequencing.
    pub producer_mode: ProducerMode,
    /// Consumer wait strategy.
    pub wait_strategy: WaitStrategyKind,
    /// Enable metrics collection (slight overhead)
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a new configuration with custom settings.
    pub const fn new(
        capacity: usize,
        producer_mode: ProducerMode,
        wait_strategy: WaitStrategyKind,
        enable_metrics: bool,
    ) -> Self {
        Self {
            capacity,
            producer_mode,
            wait_strategy,
            enable_metrics,
        }
    }

    /// Returns the mask for index wrapping.
    #[inline]
    pub const fn mask(&self) -> usize {
        self.capacity.wrapping_sub(1)
    }

    /// True when `capacity` is a usable power of two.
    #[inline]
    pub const fn has_valid_capacity(&self) -> bool {
        self.capacity.is_power_of_two() && self.capacity <= i32::MAX as usize
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub const fn with_producer_mode(mut self, producer_mode: ProducerMode) -> Self {
        self.producer_mode = producer_mode;
        self
    }

    pub const fn with_wait_strategy(mut self, wait_strategy: WaitStrategyKind) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub const fn with_metrics(mut self, enable_metrics: bool) -> Self {
        self.enable_metrics = enable_metrics;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 1024,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategyKind::Blocking,
            enable_metrics: false,
        }
    }
}

/// Low latency configuration (1K slots, single producer, busy-spinning consumers)
pub const LOW_LATENCY_CONFIG: Config = Config::new(
    1024,
    ProducerMode::Single,
    WaitStrategyKind::BusySpin,
    false,
);

/// High throughput configuration (64K slots, multiple producers, yielding consumers)
pub const HIGH_THROUGHPUT_CONFIG: Config = Config::new(
    64 * 1024,
    ProducerMode::Multi,
    WaitStrategyKind::Yielding,
    false,
);
