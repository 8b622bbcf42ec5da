//! End-to-end worker pool tests against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use persevere::clock::SystemClock;
use persevere::model::{Job, JobId, NewJob, Status};
use persevere::retry::RetryPolicy;
use persevere::store::{JobStore, MemoryStore};
use persevere::task::{HandlerFailure, TaskDef, TaskRegistry};
use persevere::worker::{WorkerConfig, WorkerPool};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        queues: vec!["default".to_string()],
        concurrency: 2,
        job_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
    }
}

fn pool_for(store: &Arc<MemoryStore>, registry: TaskRegistry, config: WorkerConfig) -> WorkerPool {
    WorkerPool::new(
        Arc::clone(store) as Arc<dyn JobStore>,
        Arc::new(registry),
        Arc::new(SystemClock),
        config,
    )
}

/// Immediate-retry policy so tests never sleep on backoff.
fn immediate_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts).base_delay(Duration::ZERO)
}

async fn wait_for_status(store: &Arc<MemoryStore>, id: JobId, want: Status) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store.get(id).await.unwrap();
        if job.status == want {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {want}, job is {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn handler_success_marks_job_succeeded() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    registry
        .register(TaskDef::with_fn("greet", |ctx| async move {
            let name = ctx.arg("name").and_then(|v| v.as_str()).unwrap_or("world");
            Ok(json!({ "greeting": format!("hello {name}") }))
        }))
        .unwrap();

    let pool = pool_for(&store, registry, fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store
        .defer(NewJob::new("greet").args(json!({"name": "kelly"})))
        .await
        .unwrap();

    let job = wait_for_status(&store, id, Status::Succeeded).await;
    assert_eq!(job.result, Some(json!({"greeting": "hello kelly"})));
    assert_eq!(job.attempts, 1);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn flaky_handler_retries_until_it_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let failures = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    let counter = Arc::clone(&failures);
    registry
        .register(
            TaskDef::with_fn("flaky", move |ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerFailure::new("net", "connection refused"))
                    } else {
                        Ok(json!({ "succeeded_on": ctx.attempt }))
                    }
                }
            })
            .retry(immediate_retry(5)),
        )
        .unwrap();

    let pool = pool_for(&store, registry, fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("flaky")).await.unwrap();

    let job = wait_for_status(&store, id, Status::Succeeded).await;
    assert_eq!(job.attempts, 3);
    assert_eq!(job.result, Some(json!({"succeeded_on": 3})));
    // The last error before success is still on record.
    assert_eq!(job.last_error.as_deref(), Some("net: connection refused"));

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_retry_budget_fails_the_job() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDef::with_fn("doomed", |_ctx| async {
                Err(HandlerFailure::new("upstream", "always broken"))
            })
            .retry(immediate_retry(2)),
        )
        .unwrap();

    let pool = pool_for(&store, registry, fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("doomed")).await.unwrap();

    let job = wait_for_status(&store, id, Status::Failed).await;
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("upstream: always broken"));

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn timed_out_handler_fails_with_the_timeout_kind() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    // Retries are restricted to "net", so the Timeout kind must reach the
    // policy for the job to fail on its first attempt.
    registry
        .register(
            TaskDef::with_fn("sleepy", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .retry(immediate_retry(5).retry_on(["net"])),
        )
        .unwrap();

    let mut config = fast_config();
    config.job_timeout = Duration::from_millis(50);
    let pool = pool_for(&store, registry, config);
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("sleepy")).await.unwrap();

    let job = wait_for_status(&store, id, Status::Failed).await;
    assert_eq!(job.attempts, 1);
    assert!(
        job.last_error.as_deref().unwrap_or("").starts_with("timeout:"),
        "expected a timeout failure, got {:?}",
        job.last_error
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn timeouts_are_retried_when_listed_as_retryable() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDef::with_fn("sleepy", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .retry(immediate_retry(2).retry_on(["timeout"])),
        )
        .unwrap();

    let mut config = fast_config();
    config.job_timeout = Duration::from_millis(50);
    let pool = pool_for(&store, registry, config);
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("sleepy")).await.unwrap();

    // First timeout grants a retry, the second exhausts the budget.
    let job = wait_for_status(&store, id, Status::Failed).await;
    assert_eq!(job.attempts, 2);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn unregistered_task_fails_immediately() {
    let store = Arc::new(MemoryStore::new());
    let pool = pool_for(&store, TaskRegistry::new(), fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("ghost")).await.unwrap();

    let job = wait_for_status(&store, id, Status::Failed).await;
    assert!(
        job.last_error
            .as_deref()
            .unwrap_or("")
            .contains("no handler registered"),
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrency_cap_bounds_parallel_handlers() {
    let store = Arc::new(MemoryStore::new());
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    let current = Arc::clone(&in_flight);
    let observed = Arc::clone(&peak);
    registry
        .register(TaskDef::with_fn("busy", move |_ctx| {
            let current = Arc::clone(&current);
            let observed = Arc::clone(&observed);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }))
        .unwrap();

    let mut config = fast_config();
    config.concurrency = 1;
    let pool = pool_for(&store, registry, config);
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(store.defer(NewJob::new("busy")).await.unwrap());
    }
    for id in ids {
        wait_for_status(&store, id, Status::Succeeded).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn graceful_shutdown_lets_in_flight_handlers_finish() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    registry
        .register(TaskDef::with_fn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("finished"))
        }))
        .unwrap();

    let pool = pool_for(&store, registry, fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("slow")).await.unwrap();
    wait_for_status(&store, id, Status::Doing).await;

    // Shutdown while the handler runs; the grace period covers it.
    handle.shutdown();
    running.await.unwrap().unwrap();

    let job = store.get(id).await.unwrap();
    assert_eq!(job.status, Status::Succeeded);
    assert_eq!(job.result, Some(json!("finished")));
}

#[tokio::test]
async fn handlers_can_defer_follow_ups_and_write_artifacts() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();

    registry
        .register(TaskDef::with_fn("fetch", |ctx| async move {
            // Conflict-tolerant write keyed by the work item, not the job.
            ctx.upsert_artifact("payload:42", &json!({"value": 42}))
                .await
                .map_err(|e| HandlerFailure::new("store", e.to_string()))?;
            let follow_up = ctx
                .defer(NewJob::new("notify").args(json!({"about": 42})))
                .await
                .map_err(|e| HandlerFailure::new("store", e.to_string()))?;
            Ok(json!({ "deferred": follow_up }))
        }))
        .unwrap();
    registry
        .register(TaskDef::with_fn("notify", |_ctx| async { Ok(json!("sent")) }))
        .unwrap();

    let pool = pool_for(&store, registry, fast_config());
    let handle = pool.clone();
    let running = tokio::spawn(async move { pool.run().await });

    let id = store.defer(NewJob::new("fetch")).await.unwrap();
    let job = wait_for_status(&store, id, Status::Succeeded).await;

    let follow_up = job.result.as_ref().unwrap()["deferred"].as_i64().unwrap();
    wait_for_status(&store, JobId(follow_up), Status::Succeeded).await;

    assert_eq!(
        store.get_artifact("payload:42").await.unwrap(),
        Some(json!({"value": 42}))
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}
