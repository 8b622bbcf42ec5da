//! In-memory job store for tests and local development.
//!
//! Same transition semantics as the Postgres store, behind one mutex.
//! Holds no durability guarantees; a process restart loses everything.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status};
use crate::store::{JobStore, ListFilter};

struct MemoryState {
    /// All jobs, keyed by id. BTreeMap keeps insertion-order iteration for
    /// the FIFO tie-break.
    jobs: BTreeMap<i64, Job>,

    /// Handler artifacts, keyed by caller-chosen stable identifiers.
    artifacts: HashMap<String, serde_json::Value>,

    next_id: i64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            artifacts: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        id
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::new()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Transition a leased job, enforcing `status == doing` at update time.
    async fn retire(
        &self,
        id: JobId,
        to: Status,
        apply: impl FnOnce(&mut Job) + Send,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id.0).ok_or(Error::NotFound(id))?;
        if job.status != Status::Doing {
            return Err(Error::InvalidTransition {
                from: job.status,
                to,
            });
        }
        job.status = to;
        job.started_at = None;
        job.lease_owner = None;
        job.updated_at = now;
        apply(job);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn defer(&self, new: NewJob) -> Result<JobId> {
        let now = self.clock.now();
        let id = {
            let mut state = self.state.lock().await;

            if let Some(ref lock) = new.queueing_lock
                && state
                    .jobs
                    .values()
                    .any(|job| !job.status.is_terminal() && job.queueing_lock.as_ref() == Some(lock))
            {
                return Err(Error::DuplicateJob(lock.clone()));
            }

            let id = state.allocate_id();
            let job = Job {
                id,
                task_name: new.task_name,
                args: new.args,
                queue: new.queue.unwrap_or_else(|| "default".to_string()),
                priority: new.priority,
                status: Status::Todo,
                attempts: 0,
                scheduled_at: new.schedule_at.unwrap_or(now),
                started_at: None,
                lease_owner: None,
                queueing_lock: new.queueing_lock,
                result: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            state.jobs.insert(id.0, job);
            id
        };

        // Wake a waiting dispatcher outside the lock.
        self.notify.notify_one();
        Ok(id)
    }

    async fn lease(&self, queues: &[String], owner: &str) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let next = state
            .jobs
            .values()
            .filter(|job| {
                job.status == Status::Todo
                    && job.scheduled_at <= now
                    && queues.contains(&job.queue)
            })
            .min_by_key(|job| (job.priority, job.scheduled_at, job.id))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id.0)
            .ok_or(Error::NotFound(id))?;
        job.status = Status::Doing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.lease_owner = Some(owner.to_string());
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<()> {
        self.retire(id, Status::Succeeded, |job| {
            job.result = Some(result);
        })
        .await
    }

    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> Result<()> {
        self.retire(id, Status::Todo, |job| {
            job.scheduled_at = at;
            job.last_error = Some(error.to_string());
        })
        .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        self.retire(id, Status::Failed, |job| {
            job.last_error = Some(error.to_string());
        })
        .await
    }

    async fn cancel(&self, id: JobId) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id.0).ok_or(Error::NotFound(id))?;
        if job.status != Status::Todo {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: Status::Cancelled,
            });
        }
        job.status = Status::Cancelled;
        job.updated_at = now;
        Ok(())
    }

    async fn reclaim_stalled(&self, stall_threshold: Duration) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(stall_threshold).unwrap_or(chrono::Duration::zero());

        let reclaimed = {
            let mut state = self.state.lock().await;
            let mut reclaimed = Vec::new();
            for job in state.jobs.values_mut() {
                if job.status == Status::Doing
                    && let Some(started_at) = job.started_at
                    && started_at < cutoff
                {
                    // The lease already counted this attempt.
                    job.status = Status::Todo;
                    job.started_at = None;
                    job.lease_owner = None;
                    job.updated_at = now;
                    reclaimed.push(job.id);
                }
            }
            reclaimed
        };

        if !reclaimed.is_empty() {
            self.notify.notify_one();
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let state = self.state.lock().await;
        state.jobs.get(&id.0).cloned().ok_or(Error::NotFound(id))
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .filter(|job| {
                filter
                    .queue
                    .as_ref()
                    .is_none_or(|queue| &job.queue == queue)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_artifact(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.artifacts.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get_artifact(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let state = self.state.lock().await;
        Ok(state.artifacts.get(key).cloned())
    }

    async fn wait_ready(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
