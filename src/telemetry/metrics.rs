//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: tasks inserted by `enqueue`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: tasks leased to workers.
/// Labels: `worker`.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.claimed")
        .with_description("Number of tasks claimed by workers")
        .build()
}

/// Counter: results recorded.
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.completed")
        .with_description("Number of tasks completed")
        .build()
}

/// Counter: tasks a worker gave up on.
/// Labels: `stage` ("materialize" | "run" | "complete").
pub fn runner_failures() -> Counter<u64> {
    meter()
        .u64_counter("batchq.runner.failures")
        .with_description("Number of tasks left claimed after a failure")
        .build()
}

/// Counter: rows touched by administrative maintenance.
/// Labels: `operation` ("sweep_stuck" | "reset_all").
pub fn store_maintenance() -> Counter<u64> {
    meter()
        .u64_counter("batchq.store.maintenance")
        .with_description("Rows modified by sweep and reset")
        .build()
}

/// Histogram: wall time of one runner invocation in milliseconds.
/// Labels: `outcome` ("ok" | "error").
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.task.duration_ms")
        .with_description("Runner execution time per task")
        .with_unit("ms")
        .build()
}
