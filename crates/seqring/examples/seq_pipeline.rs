//! Runs the fan-out/join pipeline and the polling workload for a few seconds.
//!
//! ```text
//! RUST_LOG=info cargo run --release --example seq_pipeline -- LiteBlocking
//! ```

use seqring_rs::harness::{HarnessConfig, PipelineHarness, PipelineHarnessConfig, PollingHarness};
use seqring_rs::{HarnessError, WaitStrategyKind};
use std::time::{Duration, Instant};

const RUN_FOR: Duration = Duration::from_secs(2);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let wait: WaitStrategyKind = match std::env::args().nth(1) {
        Some(name) => name.parse()?,
        None => WaitStrategyKind::BusySpin,
    };

    println!("SeqRing Pipeline Example");
    println!("========================\n");

    run_pipeline(wait)?;
    run_polling(wait)?;
    Ok(())
}

fn run_pipeline(wait: WaitStrategyKind) -> Result<(), HarnessError> {
    let config = PipelineHarnessConfig::default().with_wait_strategy(wait);
    println!("Pipeline: {}-way fan-out + join, {} slots, {wait}", config.fan_out, config.ring.capacity);

    let mut harness = PipelineHarness::new(config)?;
    harness.setup()?;

    let start = Instant::now();
    let mut published = 0u64;
    while start.elapsed() < RUN_FOR {
        for _ in 0..10_000 {
            harness.producer_step()?;
        }
        published += 10_000;
    }
    let report = harness.teardown()?;
    let elapsed = start.elapsed();

    println!("  Published: {published}");
    for worker in &report.workers {
        println!(
            "  {}-{}: {} processed, last sequence {}",
            worker.stage, worker.ordinal, worker.processed, worker.last_sequence
        );
    }
    println!(
        "  Throughput: {:.2} M events/s\n",
        published as f64 / elapsed.as_secs_f64() / 1e6
    );
    Ok(())
}

fn run_polling(wait: WaitStrategyKind) -> Result<(), HarnessError> {
    let config = HarnessConfig::default()
        .with_producer_count(3)
        .with_wait_strategy(wait);
    println!(
        "Polling: {} producers, burst {}, {} slots",
        config.producer_count, config.burst_size, config.ring.capacity
    );

    let mut harness = PollingHarness::new(config)?;
    harness.setup()?;

    let start = Instant::now();
    while start.elapsed() < RUN_FOR {
        harness.consumer_step();
    }
    let published = harness.teardown()?;
    let counters = harness.counters();
    let elapsed = start.elapsed();

    println!("  Published per producer: {published:?}");
    println!("  Consumed: {}", counters.events);
    println!(
        "  Polls: {} processing, {} gating, {} idle",
        counters.processing_polls, counters.gating_polls, counters.idle_polls
    );
    println!(
        "  Throughput: {:.2} M events/s",
        counters.events as f64 / elapsed.as_secs_f64() / 1e6
    );
    Ok(())
}
