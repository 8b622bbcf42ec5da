//! Task registration and execution surface.
//!
//! Task authors register a handler per task name, together with the retry
//! policy and queue the task runs under. Handlers receive an explicit
//! [`JobContext`] carrying the job identity, the attempt count, the
//! execution deadline, and handles for deferring follow-up work and
//! writing idempotent artifacts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{JobId, NewJob};
use crate::retry::RetryPolicy;
use crate::scheduler::{PeriodicSchedule, parse_cron};
use crate::store::JobStore;

// ---------------------------------------------------------------------------
// Failure kinds
// ---------------------------------------------------------------------------

/// Classifies a handler failure for retry-policy matching.
///
/// Kinds form a dot-separated hierarchy: `"net.timeout"` is a
/// specialization of `"net"`, so a policy that retries on `"net"` also
/// retries on `"net.timeout"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureKind(String);

impl FailureKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The dedicated kind produced when a handler exceeds its deadline.
    pub fn timeout() -> Self {
        Self("timeout".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` is `parent` or a sub-kind of it.
    pub fn specializes(&self, parent: &FailureKind) -> bool {
        match self.0.strip_prefix(parent.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FailureKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for FailureKind {
    fn from(kind: String) -> Self {
        Self::new(kind)
    }
}

/// A failure raised by a task body. Caught at the worker boundary and
/// converted into a retry decision; never propagates out of the engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(kind: impl Into<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::timeout(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Job context
// ---------------------------------------------------------------------------

/// Execution context handed to a handler, one per attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub task_name: String,
    /// Attempt count including this one (first execution sees 1).
    pub attempt: u32,
    pub args: serde_json::Value,
    /// When this attempt will be abandoned by the worker.
    pub deadline: DateTime<Utc>,
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        task_name: String,
        attempt: u32,
        args: serde_json::Value,
        deadline: DateTime<Utc>,
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            job_id,
            task_name,
            attempt,
            args,
            deadline,
            store,
            registry,
        }
    }

    /// Look up a named argument.
    pub fn arg(&self, name: &str) -> Option<&serde_json::Value> {
        self.args.get(name)
    }

    /// Defer follow-up work from inside a handler.
    pub async fn defer(&self, mut new: NewJob) -> Result<JobId> {
        if new.queue.is_none() {
            new.queue = self.registry.default_queue(&new.task_name).map(str::to_string);
        }
        self.store.defer(new).await
    }

    /// Insert-or-update an artifact keyed by a stable identifier.
    ///
    /// Handlers producing externally visible state write it through this
    /// primitive so a re-run after a reclaim or timeout race cannot
    /// duplicate or corrupt the result.
    pub async fn upsert_artifact(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.store.upsert_artifact(key, value).await
    }

    pub async fn get_artifact(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.store.get_artifact(key).await
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("task_name", &self.task_name)
            .field("attempt", &self.attempt)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A task body. Returns the job result on success, or a classified failure
/// for the retry policy.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> std::result::Result<serde_json::Value, HandlerFailure>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, HandlerFailure>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> std::result::Result<serde_json::Value, HandlerFailure> {
        (self.0)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Task definitions
// ---------------------------------------------------------------------------

/// A registered task: handler plus the policy it executes under.
#[derive(Clone)]
pub struct TaskDef {
    name: String,
    queue: String,
    retry: RetryPolicy,
    periodic: Option<PeriodicSchedule>,
    handler: Arc<dyn TaskHandler>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            name: name.into(),
            queue: "default".to_string(),
            retry: RetryPolicy::default(),
            periodic: None,
            handler: Arc::new(handler),
        }
    }

    /// Register an async closure as the task body.
    pub fn with_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, HandlerFailure>>
            + Send
            + 'static,
    {
        Self::new(name, FnHandler(f))
    }

    /// Queue this task's jobs are deferred to by default.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Declare a recurring schedule. Accepts standard 5-field cron
    /// expressions (or the 6/7-field form with seconds). The queueing lock
    /// for periodic ticks defaults to the task name.
    pub fn periodic(mut self, cron_expr: &str) -> Result<Self> {
        let schedule = parse_cron(cron_expr)?;
        self.periodic = Some(PeriodicSchedule::new(schedule, self.name.clone()));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn periodic_schedule(&self) -> Option<&PeriodicSchedule> {
        self.periodic.as_ref()
    }

    pub(crate) fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("periodic", &self.periodic.is_some())
            .finish_non_exhaustive()
    }
}

/// Explicit dispatch table from task name to definition, built at process
/// start.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDef>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub fn register(&mut self, def: TaskDef) -> Result<()> {
        if self.tasks.contains_key(def.name()) {
            return Err(Error::AlreadyRegistered(def.name().to_string()));
        }
        self.tasks.insert(def.name().to_string(), def);
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> Option<&TaskDef> {
        self.tasks.get(task_name)
    }

    pub fn default_queue(&self, task_name: &str) -> Option<&str> {
        self.tasks.get(task_name).map(|def| def.queue_name())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Tasks carrying a recurring schedule.
    pub fn periodic_tasks(&self) -> Vec<&TaskDef> {
        self.tasks
            .values()
            .filter(|def| def.periodic.is_some())
            .collect()
    }
}
