//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Start a span wrapping one job attempt, lease to retirement.
///
/// The `job.state` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_job_span(task_name: &str, id: JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.task" = task_name,
        "job.id" = %id,
        "job.attempt" = attempt,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
