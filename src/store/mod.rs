//! Job record store: the ground truth for what work exists and what has
//! happened to it.
//!
//! Every correctness-bearing transition (lease, complete, retry, fail,
//! reclaim) is a single atomic conditional write against the store —
//! never a read-then-write pair. Multiple worker processes coordinate
//! exclusively through these conditional updates.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Job, JobId, NewJob, Status};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub queue: Option<String>,
    pub limit: Option<i64>,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `todo`. Fails with `DuplicateJob` when the queueing
    /// lock collides with a live job; the existing row is left untouched.
    async fn defer(&self, new: NewJob) -> Result<JobId>;

    /// Atomically claim the next eligible job in the given queues for
    /// `owner`: `todo -> doing`, `attempts + 1`, lease recorded. Two
    /// concurrent calls never return the same job.
    async fn lease(&self, queues: &[String], owner: &str) -> Result<Option<Job>>;

    /// `doing -> succeeded`, result recorded, lease released.
    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<()>;

    /// `doing -> todo`, rescheduled for `at`, lease released, last error
    /// recorded. Attempts were already counted by the lease.
    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> Result<()>;

    /// `doing -> failed`, last error recorded, lease released.
    async fn fail(&self, id: JobId, error: &str) -> Result<()>;

    /// `todo -> cancelled`. Any other state reports `InvalidTransition`.
    async fn cancel(&self, id: JobId) -> Result<()>;

    /// Return every job leased longer ago than `stall_threshold` to
    /// `todo`, clearing the lease. Conditional on `status == doing`, so a
    /// job completing concurrently is not reclaimed and overlapping sweeps
    /// cannot double-process a row.
    async fn reclaim_stalled(&self, stall_threshold: Duration) -> Result<Vec<JobId>>;

    /// Fetch a job by id. `NotFound` if the id is unknown.
    async fn get(&self, id: JobId) -> Result<Job>;

    /// List jobs, newest first.
    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>>;

    /// Insert-or-update a handler artifact keyed by a stable identifier.
    /// Repeating the same write leaves the store unchanged.
    async fn upsert_artifact(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    async fn get_artifact(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Block until a job may have become ready, or `max_wait` elapses.
    /// Bounds dispatch latency; spurious wake-ups are fine. Store trouble
    /// is absorbed here (the caller just polls again).
    async fn wait_ready(&self, max_wait: Duration);
}
