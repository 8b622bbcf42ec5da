//! Periodic scheduling against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use persevere::clock::SystemClock;
use persevere::model::Status;
use persevere::scheduler::Scheduler;
use persevere::store::{JobStore, ListFilter, MemoryStore};
use persevere::task::{TaskDef, TaskRegistry};

fn every_second_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            TaskDef::with_fn("tick", |_ctx| async { Ok(json!(null)) })
                .periodic("* * * * * *")
                .unwrap(),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn one_job_per_tick_under_the_queueing_lock() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(every_second_registry()),
        Arc::new(SystemClock),
    );

    let handle = scheduler.clone();
    let running = tokio::spawn(async move { scheduler.run().await });

    // Several ticks elapse, but with no worker draining the queue every
    // tick after the first collides with the live job's lock.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let jobs = store.list(ListFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 1, "tick dedup failed: {jobs:?}");
    let job = &jobs[0];
    assert_eq!(job.task_name, "tick");
    assert_eq!(job.queueing_lock.as_deref(), Some("tick"));
    assert!(job.args["timestamp"].is_i64());

    // Retiring the live job frees the lock for the next tick.
    let leased = store
        .lease(&["default".to_string()], "w")
        .await
        .unwrap()
        .unwrap();
    store.complete(leased.id, json!(null)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let jobs = store
        .list(ListFilter {
            status: Some(Status::Todo),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1, "next tick was not deferred");
    assert_ne!(jobs[0].id, leased.id);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn scheduler_with_no_periodic_tasks_exits() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = TaskRegistry::new();
    registry
        .register(TaskDef::with_fn("one_shot", |_ctx| async { Ok(json!(null)) }))
        .unwrap();

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(registry),
        Arc::new(SystemClock),
    );

    // Returns immediately instead of idling forever.
    tokio::time::timeout(Duration::from_secs(1), scheduler.run())
        .await
        .expect("scheduler should exit with nothing to schedule")
        .unwrap();

    // Nothing was deferred behind our back.
    assert!(store.list(ListFilter::default()).await.unwrap().is_empty());
}
