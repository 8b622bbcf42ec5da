//! Engine facade. The public API for producers and monitoring, plus
//! constructors for the long-running components.
//!
//! Owns no state of its own: the store is the ground truth, the registry
//! is the dispatch table, and the engine wires them together.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus, NewJob};
use crate::reclaimer::{Reclaimer, ReclaimerConfig};
use crate::scheduler::Scheduler;
use crate::store::{JobStore, ListFilter};
use crate::task::TaskRegistry;
use crate::telemetry::metrics;
use crate::worker::{WorkerConfig, WorkerPool};

/// Runtime knobs shared by the engine's components.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queues worker pools lease from.
    pub queues: Vec<String>,
    /// Concurrent handler invocations per worker pool.
    pub worker_concurrency: usize,
    /// Per-attempt handler deadline.
    pub job_timeout: Duration,
    /// Dispatch poll fallback when no ready notification arrives.
    pub poll_interval: Duration,
    /// Grace period for in-flight handlers at shutdown.
    pub shutdown_grace: Duration,
    /// Lease age beyond which a job counts as stalled.
    pub stall_threshold: Duration,
    /// Reclaimer sweep period.
    pub reclaim_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            worker_concurrency: 10,
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(600),
            reclaim_interval: Duration::from_secs(600),
        }
    }
}

/// The task-execution engine.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<TaskRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defer a job. Routes to the task's declared queue unless the builder
    /// picked one; fails with `DuplicateJob` on a queueing-lock collision.
    pub async fn defer(&self, mut new: NewJob) -> Result<JobId> {
        if new.queue.is_none() {
            new.queue = self
                .registry
                .default_queue(new.task_name())
                .map(str::to_string);
        }
        let queue = new
            .queue
            .clone()
            .unwrap_or_else(|| "default".to_string());

        match self.store.defer(new).await {
            Ok(id) => {
                debug!(id = %id, queue = %queue, "job deferred");
                metrics::jobs_deferred().add(
                    1,
                    &[
                        KeyValue::new("queue", queue),
                        KeyValue::new("result", "ok"),
                    ],
                );
                Ok(id)
            }
            Err(e @ Error::DuplicateJob(_)) => {
                metrics::jobs_deferred().add(
                    1,
                    &[
                        KeyValue::new("queue", queue),
                        KeyValue::new("result", "duplicate"),
                    ],
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Status query interface. `NotFound` if the id is unknown.
    pub async fn get_status(&self, id: JobId) -> Result<JobStatus> {
        let job = self.store.get(id).await?;
        Ok(JobStatus::from(&job))
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        self.store.list(filter).await
    }

    /// Withdraw a job that no worker has picked up yet.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        self.store.cancel(id).await?;
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", "todo"),
                KeyValue::new("to", "cancelled"),
            ],
        );
        Ok(())
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            WorkerConfig {
                queues: self.config.queues.clone(),
                concurrency: self.config.worker_concurrency,
                job_timeout: self.config.job_timeout,
                poll_interval: self.config.poll_interval,
                shutdown_grace: self.config.shutdown_grace,
            },
        )
    }

    pub fn reclaimer(&self) -> Reclaimer {
        Reclaimer::new(
            Arc::clone(&self.store),
            ReclaimerConfig {
                interval: self.config.reclaim_interval,
                stall_threshold: self.config.stall_threshold,
            },
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        )
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.registry)
    }
}
