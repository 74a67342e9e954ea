//! Prometheus metrics for temporary buckets.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub static BUCKETS_ALLOCATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_buckets_allocated_total",
            "Temporary buckets allocated, by initial backing",
        ),
        &["backing"],
    )
    .expect("metric creation failed")
});

pub static BUCKET_MIGRATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_bucket_migrations_total",
            "Memory buckets moved to disk, by trigger",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static BUCKET_RAM_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "cask_bucket_ram_bytes",
        "Bytes currently held by memory-backed buckets",
    )
    .expect("metric creation failed")
});

/// Register bucket metrics with `registry`.
pub fn register(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(BUCKETS_ALLOCATED.clone()))?;
    registry.register(Box::new(BUCKET_MIGRATIONS.clone()))?;
    registry.register(Box::new(BUCKET_RAM_BYTES.clone()))?;
    Ok(())
}
