//! Postgres-backed job store.
//!
//! All state transitions are conditional updates (`UPDATE … WHERE status =
//! $from`); a zero row count means another writer got there first. Leasing
//! uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never claim the
//! same row, and the queueing lock rides on a partial unique index checked
//! with `ON CONFLICT DO NOTHING`. Producers wake dispatchers through a
//! transactional `pg_notify`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status};
use crate::store::{JobStore, ListFilter};

/// NOTIFY channel for "a job became ready".
const READY_CHANNEL: &str = "persevere_job_ready";

const JOB_COLUMNS: &str = "id, task_name, args, queue, priority, status, attempts, \
     scheduled_at, started_at, lease_owner, queueing_lock, result, last_error, \
     created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    /// Lazily connected LISTEN connection, rebuilt after errors.
    listener: Mutex<Option<PgListener>>,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            listener: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve a zero-row conditional update into the precise error.
    async fn transition_conflict(&self, id: JobId, to: Status) -> Error {
        match self.get(id).await {
            Ok(job) => Error::InvalidTransition {
                from: job.status,
                to,
            },
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl JobStore for PgStore {
    async fn defer(&self, new: NewJob) -> Result<JobId> {
        let now = self.clock.now();
        let queue = new.queue.unwrap_or_else(|| "default".to_string());
        let scheduled_at = new.schedule_at.unwrap_or(now);

        let mut tx = self.pool.begin().await?;

        let inserted: Option<(i64,)> = if let Some(ref lock) = new.queueing_lock {
            // The partial unique index on queueing_lock covers live rows
            // only, so the conflict check races correctly with concurrent
            // producers.
            sqlx::query_as(
                "INSERT INTO persevere_jobs \
                     (task_name, args, queue, priority, status, scheduled_at, queueing_lock, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, 'todo', $5, $6, $7, $7) \
                 ON CONFLICT (queueing_lock) \
                     WHERE queueing_lock IS NOT NULL AND status IN ('todo', 'doing') \
                     DO NOTHING \
                 RETURNING id",
            )
            .bind(&new.task_name)
            .bind(&new.args)
            .bind(&queue)
            .bind(new.priority)
            .bind(scheduled_at)
            .bind(lock)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            Some(
                sqlx::query_as(
                    "INSERT INTO persevere_jobs \
                         (task_name, args, queue, priority, status, scheduled_at, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'todo', $5, $6, $6) \
                     RETURNING id",
                )
                .bind(&new.task_name)
                .bind(&new.args)
                .bind(&queue)
                .bind(new.priority)
                .bind(scheduled_at)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?,
            )
        };

        let Some((id,)) = inserted else {
            // A live job already holds this lock; the existing row is left
            // untouched.
            let lock = new.queueing_lock.unwrap_or_default();
            return Err(Error::DuplicateJob(lock));
        };

        // NOTIFY is transactional — only fires on commit.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(&queue)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(JobId(id))
    }

    async fn lease(&self, queues: &[String], owner: &str) -> Result<Option<Job>> {
        let now = self.clock.now();
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "WITH next_job AS ( \
                 SELECT id FROM persevere_jobs \
                 WHERE status = 'todo' AND queue = ANY($1) AND scheduled_at <= $2 \
                 ORDER BY priority, scheduled_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE persevere_jobs \
             SET status = 'doing', attempts = attempts + 1, started_at = $2, \
                 lease_owner = $3, updated_at = $2 \
             WHERE id IN (SELECT id FROM next_job) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(queues)
        .bind(now)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<()> {
        let now = self.clock.now();
        let rows_affected = sqlx::query(
            "UPDATE persevere_jobs \
             SET status = 'succeeded', result = $1, started_at = NULL, lease_owner = NULL, updated_at = $2 \
             WHERE id = $3 AND status = 'doing'",
        )
        .bind(&result)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_conflict(id, Status::Succeeded).await);
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> Result<()> {
        let now = self.clock.now();
        let rows_affected = sqlx::query(
            "UPDATE persevere_jobs \
             SET status = 'todo', scheduled_at = $1, last_error = $2, \
                 started_at = NULL, lease_owner = NULL, updated_at = $3 \
             WHERE id = $4 AND status = 'doing'",
        )
        .bind(at)
        .bind(error)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_conflict(id, Status::Todo).await);
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        let now = self.clock.now();
        let rows_affected = sqlx::query(
            "UPDATE persevere_jobs \
             SET status = 'failed', last_error = $1, started_at = NULL, lease_owner = NULL, updated_at = $2 \
             WHERE id = $3 AND status = 'doing'",
        )
        .bind(error)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_conflict(id, Status::Failed).await);
        }
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<()> {
        let now = self.clock.now();
        let rows_affected = sqlx::query(
            "UPDATE persevere_jobs SET status = 'cancelled', updated_at = $1 \
             WHERE id = $2 AND status = 'todo'",
        )
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.transition_conflict(id, Status::Cancelled).await);
        }
        Ok(())
    }

    async fn reclaim_stalled(&self, stall_threshold: Duration) -> Result<Vec<JobId>> {
        let now = self.clock.now();
        let cutoff =
            now - chrono::Duration::from_std(stall_threshold).unwrap_or(chrono::Duration::zero());

        // Conditional on status = 'doing': a job completing between scan
        // and update is untouched, and an overlapping sweep finds no rows.
        let rows: Vec<(i64,)> = sqlx::query_as(
            "UPDATE persevere_jobs \
             SET status = 'todo', started_at = NULL, lease_owner = NULL, updated_at = $1 \
             WHERE status = 'doing' AND started_at < $2 \
             RETURNING id",
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM persevere_jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_job()
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM persevere_jobs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::text IS NULL OR queue = $2) \
             ORDER BY id DESC \
             LIMIT $3"
        ))
        .bind(filter.status.map(|status| status.as_str().to_string()))
        .bind(filter.queue)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn upsert_artifact(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let now = self.clock.now();
        sqlx::query(
            "INSERT INTO persevere_artifacts (key, value, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_artifact(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM persevere_artifacts WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn wait_ready(&self, max_wait: Duration) {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => match listener.listen(READY_CHANNEL).await {
                    Ok(()) => *guard = Some(listener),
                    Err(e) => debug!(error = %e, "LISTEN failed, falling back to polling"),
                },
                Err(e) => debug!(error = %e, "listener connection failed, falling back to polling"),
            }
        }

        let Some(listener) = guard.as_mut() else {
            drop(guard);
            tokio::time::sleep(max_wait).await;
            return;
        };

        match tokio::time::timeout(max_wait, listener.recv()).await {
            Ok(Ok(notification)) => {
                debug!(queue = notification.payload(), "notified of ready job");
            }
            Ok(Err(e)) => {
                // Reconnect on the next call; keep the wait bounded
                // instead of hot-looping meanwhile.
                warn!(error = %e, "listener lost, will reconnect");
                *guard = None;
                drop(guard);
                tokio::time::sleep(max_wait).await;
            }
            Err(_elapsed) => {}
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    task_name: String,
    args: serde_json::Value,
    queue: String,
    priority: i32,
    status: String,
    attempts: i32,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    lease_owner: Option<String>,
    queueing_lock: Option<String>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            task_name: self.task_name,
            args: self.args,
            queue: self.queue,
            priority: self.priority,
            status: self.status.parse()?,
            attempts: self.attempts as u32,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            lease_owner: self.lease_owner,
            queueing_lock: self.queueing_lock,
            result: self.result,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
