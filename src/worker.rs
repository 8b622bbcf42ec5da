//! Worker pool: leases ready jobs and runs their handlers.
//!
//! One pool instance holds a bounded set of execution slots. The lease
//! loop acquires a slot, claims the next eligible job atomically through
//! the store, and spawns the handler under the per-attempt timeout. On
//! shutdown the pool stops leasing, gives in-flight handlers a grace
//! period, and leaves anything still running for the stalled-job
//! reclaimer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, Span, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::Job;
use crate::retry::RetryDecision;
use crate::store::JobStore;
use crate::task::{HandlerFailure, JobContext, TaskRegistry};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for one worker pool instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues this pool leases from.
    pub queues: Vec<String>,
    /// Maximum concurrent handler invocations.
    pub concurrency: usize,
    /// Per-attempt handler deadline.
    pub job_timeout: Duration,
    /// Poll fallback when no ready notification arrives.
    pub poll_interval: Duration,
    /// How long in-flight handlers get to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            concurrency: 10,
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// The worker pool loop: lease, execute, retire.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    /// Lease owner marker recorded on every job this pool claims.
    owner: String,
    /// Execution slots. A lease is only taken while holding a permit, so
    /// outstanding leases never exceed `concurrency`.
    slots: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency));
        Self {
            store,
            registry,
            clock,
            config,
            owner: format!("worker-{}", Uuid::new_v4()),
            slots,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Signal the pool to stop leasing and drain.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the pool until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            owner = %self.owner,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "worker pool started"
        );

        loop {
            // Wait for a free execution slot; shutdown interrupts the wait.
            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.store.lease(&self.config.queues, &self.owner).await {
                Ok(Some(job)) => self.spawn_execution(job, permit),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = self.store.wait_ready(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    // Store trouble pauses leasing; no job state changes.
                    drop(permit);
                    warn!(error = %e, "job store unavailable, backing off");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Wait up to the grace period for in-flight handlers.
    async fn drain(&self) {
        info!("worker pool draining");
        let all = self.config.concurrency as u32;
        match tokio::time::timeout(self.config.shutdown_grace, self.slots.acquire_many(all)).await {
            Ok(Ok(_all_slots)) => info!("all in-flight handlers finished"),
            Ok(Err(_)) => {}
            Err(_elapsed) => warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "handlers still running after grace period; leaving their leases for the reclaimer"
            ),
        }
    }

    fn spawn_execution(&self, job: Job, permit: OwnedSemaphorePermit) {
        let worker = self.clone();
        let span = start_job_span(&job.task_name, job.id, job.attempts);
        let exec_span = span.clone();
        tokio::spawn(
            async move {
                // Holds the execution slot for the lifetime of the attempt.
                let _permit = permit;
                if let Err(e) = worker.execute(job, &exec_span).await {
                    error!(error = %e, "job retirement failed");
                }
            }
            .instrument(span),
        );
    }

    /// Run one leased job to retirement: handler under deadline, then the
    /// matching store transition.
    async fn execute(&self, job: Job, span: &Span) -> Result<()> {
        record_state_transition(span, "todo", "doing");
        metrics::job_state_transitions().add(
            1,
            &[KeyValue::new("from", "todo"), KeyValue::new("to", "doing")],
        );

        let Some(def) = self.registry.get(&job.task_name) else {
            warn!(task = %job.task_name, id = %job.id, "no handler registered, failing job");
            metrics::jobs_unroutable().add(1, &[KeyValue::new("task", job.task_name.clone())]);
            record_state_transition(span, "doing", "failed");
            let result = self
                .store
                .fail(
                    job.id,
                    &format!("no handler registered for task {:?}", job.task_name),
                )
                .await;
            return tolerate_lost_lease(result, &job);
        };

        let retry_policy = def.retry_policy().clone();
        let handler = def.handler();
        let deadline = deadline_after(self.clock.now(), self.config.job_timeout);
        let ctx = JobContext::new(
            job.id,
            job.task_name.clone(),
            job.attempts,
            job.args.clone(),
            deadline,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
        );

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.job_timeout, handler.run(ctx)).await {
            Ok(outcome) => outcome,
            // Dropping the handler future cancels the in-flight invocation;
            // whatever it holds is released by its own cancellation path.
            Err(_elapsed) => Err(HandlerFailure::timeout(format!(
                "handler exceeded {:?} deadline",
                self.config.job_timeout
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as f64;

        let result = match outcome {
            Ok(result) => {
                record_state_transition(span, "doing", "succeeded");
                self.record_retirement(&job.task_name, "succeeded", "doing", "succeeded", duration_ms);
                info!(id = %job.id, attempt = job.attempts, duration_ms, "job succeeded");
                self.store.complete(job.id, result).await
            }
            Err(failure) => match retry_policy.decide(job.attempts, Some(&failure.kind)) {
                RetryDecision::RetryAt(delay) => {
                    let at = self.clock.now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    record_state_transition(span, "doing", "todo");
                    self.record_retirement(&job.task_name, "retried", "doing", "todo", duration_ms);
                    warn!(
                        id = %job.id,
                        attempt = job.attempts,
                        error = %failure,
                        delay_secs = delay.as_secs(),
                        "job failed, retry scheduled"
                    );
                    self.store.retry(job.id, at, &failure.to_string()).await
                }
                RetryDecision::GiveUp => {
                    record_state_transition(span, "doing", "failed");
                    self.record_retirement(&job.task_name, "failed", "doing", "failed", duration_ms);
                    error!(
                        id = %job.id,
                        attempts = job.attempts,
                        error = %failure,
                        "job failed permanently"
                    );
                    self.store.fail(job.id, &failure.to_string()).await
                }
            },
        };

        tolerate_lost_lease(result, &job)
    }

    fn record_retirement(
        &self,
        task: &str,
        outcome: &'static str,
        from: &'static str,
        to: &'static str,
        duration_ms: f64,
    ) {
        metrics::job_execution_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("task", task.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
        metrics::job_state_transitions()
            .add(1, &[KeyValue::new("from", from), KeyValue::new("to", to)]);
    }
}

/// A retirement that finds the row in another state lost a race with the
/// reclaimer (or another resolver); the other writer wins.
fn tolerate_lost_lease(result: Result<()>, job: &Job) -> Result<()> {
    match result {
        Err(Error::InvalidTransition { from, to }) => {
            warn!(id = %job.id, %from, %to, "lease lost before retirement");
            Ok(())
        }
        other => other,
    }
}

fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
