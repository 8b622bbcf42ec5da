//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"persevere"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("persevere")
}

/// Counter: jobs deferred.
/// Labels: `queue`, `result` ("ok" | "duplicate").
pub fn jobs_deferred() -> Counter<u64> {
    meter()
        .u64_counter("persevere.jobs.deferred")
        .with_description("Number of jobs deferred")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("persevere.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Histogram: handler execution duration in milliseconds.
/// Labels: `task`, `outcome` ("succeeded" | "retried" | "failed").
pub fn job_execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("persevere.jobs.execution.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: stalled jobs returned to the ready state.
pub fn jobs_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("persevere.jobs.reclaimed")
        .with_description("Number of stalled jobs reclaimed")
        .build()
}

/// Counter: jobs whose task name has no registered handler.
/// Labels: `task`.
pub fn jobs_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("persevere.jobs.unroutable")
        .with_description("Jobs with no registered handler")
        .build()
}

/// Counter: periodic scheduling ticks.
/// Labels: `task`, `result` ("deferred" | "skipped" | "error").
pub fn scheduler_ticks() -> Counter<u64> {
    meter()
        .u64_counter("persevere.scheduler.ticks")
        .with_description("Periodic scheduling ticks")
        .build()
}
