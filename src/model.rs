//! Core data model.
//!
//! A job is a deferred unit of work. It has identity (task name + optional
//! queueing lock), routing (queue, priority), scheduling (earliest run
//! time), and lifecycle state. The engine does not interpret `args`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of durable work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned monotonically by the store.
    pub id: JobId,

    /// Which registered handler executes this job.
    pub task_name: String,

    /// Named arguments for the handler, as a JSON object. Opaque to the
    /// engine.
    pub args: serde_json::Value,

    /// Logical lane. Queues route work and account concurrency
    /// independently.
    pub queue: String,

    /// Lower value is served first among ready jobs in the same queue.
    pub priority: i32,

    /// Current lifecycle state.
    pub status: Status,

    /// Number of lease cycles consumed so far. Incremented by the lease,
    /// never decremented.
    pub attempts: u32,

    /// Earliest time the job becomes eligible for dispatch.
    pub scheduled_at: DateTime<Utc>,

    /// When the current lease began. Non-null iff `status == Doing`.
    pub started_at: Option<DateTime<Utc>>,

    /// Opaque identifier of the worker holding the current lease.
    /// Non-null iff `status == Doing`.
    pub lease_owner: Option<String>,

    /// Uniqueness key: at most one job with a given non-null lock may be
    /// live (`todo` or `doing`) at a time.
    pub queueing_lock: Option<String>,

    /// Handler return value, recorded on success.
    pub result: Option<serde_json::Value>,

    /// Most recent failure, recorded on retry and terminal failure.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Ready (or scheduled) and waiting for a lease.
    Todo,
    /// Leased by a worker, execution in progress.
    Doing,
    /// Done successfully. Terminal.
    Succeeded,
    /// Retry budget exhausted or failure kind not retryable. Terminal.
    Failed,
    /// Withdrawn before any worker picked it up. Terminal.
    Cancelled,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Todo, Doing)           // lease
                | (Todo, Cancelled) // withdrawn by producer
                | (Doing, Succeeded)
                | (Doing, Todo)     // retry granted, or stalled lease reclaimed
                | (Doing, Failed) // retry denied
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Status::Todo),
            "doing" => Ok(Status::Doing),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

/// Serializable answer to the status query interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub status: Status,
    pub attempts: u32,
    pub queue: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempts: job.attempts,
            queue: job.queue.clone(),
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            last_error: job.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for deferring new jobs. The enqueue interface for producers.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) task_name: String,
    pub(crate) args: serde_json::Value,
    pub(crate) queue: Option<String>,
    pub(crate) priority: i32,
    pub(crate) schedule_at: Option<DateTime<Utc>>,
    pub(crate) queueing_lock: Option<String>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: serde_json::Value::Null,
            queue: None,
            priority: 0,
            schedule_at: None,
            queueing_lock: None,
        }
    }

    /// Named arguments for the handler. Expected to be a JSON object.
    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Route to a specific queue. Defaults to the task's declared queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Lower priority value is served first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Earliest time the job may run. Defaults to now.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_at = Some(at);
        self
    }

    /// Refuse to create a second live job carrying the same lock.
    pub fn queueing_lock(mut self, lock: impl Into<String>) -> Self {
        self.queueing_lock = Some(lock.into());
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_retirement_transitions_are_legal() {
        assert!(Status::Todo.can_transition_to(Status::Doing));
        assert!(Status::Doing.can_transition_to(Status::Succeeded));
        assert!(Status::Doing.can_transition_to(Status::Todo));
        assert!(Status::Doing.can_transition_to(Status::Failed));
        assert!(Status::Todo.can_transition_to(Status::Cancelled));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Status::Succeeded, Status::Failed, Status::Cancelled] {
            assert!(terminal.is_terminal());
            for to in [
                Status::Todo,
                Status::Doing,
                Status::Succeeded,
                Status::Failed,
                Status::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn cancel_only_from_todo() {
        assert!(!Status::Doing.can_transition_to(Status::Cancelled));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            Status::Todo,
            Status::Doing,
            Status::Succeeded,
            Status::Failed,
            Status::Cancelled,
        ] {
            let parsed: Status = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<Status>().is_err());
    }
}
