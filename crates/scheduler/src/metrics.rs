//! Prometheus metrics for request scheduling.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub static REQUESTS_REGISTERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_requests_registered_total",
            "Sendable requests registered, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static BATCHES_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("cask_batches_started_total", "Request batches started")
        .expect("metric creation failed")
});

pub static BATCHES_FINISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("cask_batches_finished_total", "Request batches finalized")
        .expect("metric creation failed")
});

pub static STORE_CHECKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_store_checks_total",
            "Keys checked against the local store, by result",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static CHECKER_BACKOFFS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_checker_backoffs_total",
        "Times the store checker paused for an overloaded trip queue",
    )
    .expect("metric creation failed")
});

pub static PENDING_TRIPS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "cask_pending_trips",
        "Found-key deliveries waiting to be processed",
    )
    .expect("metric creation failed")
});

/// Register scheduler metrics with `registry`.
pub fn register(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(REQUESTS_REGISTERED.clone()))?;
    registry.register(Box::new(BATCHES_STARTED.clone()))?;
    registry.register(Box::new(BATCHES_FINISHED.clone()))?;
    registry.register(Box::new(STORE_CHECKS.clone()))?;
    registry.register(Box::new(CHECKER_BACKOFFS.clone()))?;
    registry.register(Box::new(PENDING_TRIPS.clone()))?;
    Ok(())
}
