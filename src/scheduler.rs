//! Periodic scheduling: defers one job per cron tick per periodic task.
//!
//! Tick identity rides on the task's queueing lock — while a previous
//! tick's job is still live, the duplicate defer is refused by the store
//! and the tick is skipped. Tick args carry the tick's Unix timestamp.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::NewJob;
use crate::store::JobStore;
use crate::task::TaskRegistry;
use crate::telemetry::metrics;

/// Parse a cron expression.
///
/// Standard 5-field expressions are accepted by prefixing a `0` seconds
/// field; the 6/7-field forms pass through unchanged.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// A task's recurring schedule plus the lock that deduplicates its ticks.
#[derive(Debug, Clone)]
pub struct PeriodicSchedule {
    schedule: cron::Schedule,
    lock: String,
}

impl PeriodicSchedule {
    pub fn new(schedule: cron::Schedule, lock: String) -> Self {
        Self { schedule, lock }
    }

    /// First tick strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn lock(&self) -> &str {
        &self.lock
    }
}

struct TickState {
    task_name: String,
    queue: String,
    schedule: PeriodicSchedule,
    next: DateTime<Utc>,
}

/// Defers periodic jobs when their cron ticks arrive.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown, or until every schedule is exhausted.
    pub async fn run(&self) -> Result<()> {
        let now = self.clock.now();
        let mut ticks: Vec<TickState> = self
            .registry
            .periodic_tasks()
            .into_iter()
            .filter_map(|def| {
                let schedule = def.periodic_schedule()?.clone();
                let next = schedule.next_after(now)?;
                Some(TickState {
                    task_name: def.name().to_string(),
                    queue: def.queue_name().to_string(),
                    schedule,
                    next,
                })
            })
            .collect();

        if ticks.is_empty() {
            info!("no periodic tasks registered");
            return Ok(());
        }

        info!(tasks = ticks.len(), "scheduler started");

        loop {
            let Some((idx, due)) = ticks
                .iter()
                .enumerate()
                .min_by_key(|(_, tick)| tick.next)
                .map(|(idx, tick)| (idx, tick.next))
            else {
                info!("all periodic schedules exhausted");
                return Ok(());
            };

            let wait = (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.fire(&ticks[idx], due).await;

            match ticks[idx].schedule.next_after(self.clock.now()) {
                Some(next) => ticks[idx].next = next,
                None => {
                    ticks.remove(idx);
                }
            }
        }
    }

    /// Defer one tick's job; a queueing-lock collision means the previous
    /// tick is still live and this tick is skipped.
    async fn fire(&self, tick: &TickState, due: DateTime<Utc>) {
        let new = NewJob::new(&tick.task_name)
            .args(serde_json::json!({ "timestamp": due.timestamp() }))
            .queue(tick.queue.clone())
            .schedule_at(due)
            .queueing_lock(tick.schedule.lock().to_string());

        let result = match self.store.defer(new).await {
            Ok(id) => {
                info!(task = %tick.task_name, tick = %due, id = %id, "periodic tick deferred");
                "deferred"
            }
            Err(Error::DuplicateJob(_)) => {
                debug!(task = %tick.task_name, tick = %due, "previous tick still live, skipping");
                "skipped"
            }
            Err(e) => {
                warn!(task = %tick.task_name, error = %e, "periodic defer failed");
                "error"
            }
        };

        metrics::scheduler_ticks().add(
            1,
            &[
                KeyValue::new("task", tick.task_name.clone()),
                KeyValue::new("result", result),
            ],
        );
    }
}
