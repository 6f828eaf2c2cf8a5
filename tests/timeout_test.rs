//! Timeout reaping and shutdown draining.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::sleep;

use treeline::{Database, JobHandle, MemoryDb, ProcessorFn, QueueWorker};

fn state_of(task: Option<&Value>) -> Option<&str> {
    task.and_then(|v| v.get("_state")).and_then(Value::as_str)
}

async fn wait_for_task(
    db: &MemoryDb,
    id: &str,
    predicate: impl Fn(Option<&Value>) -> bool,
) -> Option<Value> {
    for _ in 0..150 {
        let task = db.get(id).await.unwrap();
        if predicate(task.as_ref()) {
            return task;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached the expected shape");
}

#[tokio::test]
async fn reaps_a_task_abandoned_by_a_dead_worker() {
    let db = Arc::new(MemoryDb::new());

    // A record claimed by a worker that no longer exists, stamped well past
    // the timeout.
    let id = db
        .push(json!({
            "job": "encode",
            "_state": "in_progress",
            "_owner": "dead:0",
            "_progress": 10,
            "_state_changed": db.server_now_ms() - 5000
        }))
        .await
        .unwrap();

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, job: JobHandle| async move {
            job.resolve(None).await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({
            "in_progress_state": "in_progress",
            "finished_state": "done",
            "timeout": 1000
        })))
        .await;

    // The reaper resets the orphan, after which this worker claims and
    // finishes it.
    let task = wait_for_task(&db, &id, |t| state_of(t) == Some("done"))
        .await
        .unwrap();
    assert_eq!(task["job"], json!("encode"));

    worker.shutdown().await;
}

#[tokio::test]
async fn reaps_its_own_task_when_processing_stalls() {
    let db = Arc::new(MemoryDb::new());

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, _job: JobHandle| async move {
            futures::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({
            "in_progress_state": "in_progress",
            "finished_state": "done",
            "timeout": 300
        })))
        .await;

    let id = db.push(json!({"job": 1})).await.unwrap();
    wait_for_task(&db, &id, |t| state_of(t) == Some("in_progress")).await;

    // Once the timeout elapses, the task is back at its start state with all
    // worker bookkeeping stripped.
    let reset = wait_for_task(&db, &id, |t| {
        t.is_some_and(|v| v.get("_owner").is_none() && v.get("_state").is_none())
    })
    .await
    .unwrap();
    let mut keys: Vec<&str> = reset
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["_state_changed", "job"]);
    let stamp = reset["_state_changed"].as_i64().unwrap();
    assert!((db.server_now_ms() - stamp).abs() < 2000);

    // The worker is still tied up with the stalled invocation, so the reset
    // task stays unclaimed.
    sleep(Duration::from_millis(150)).await;
    assert!(state_of(db.get(&id).await.unwrap().as_ref()).is_none());
}

#[tokio::test]
async fn dropping_the_timeout_cancels_armed_timers() {
    let db = Arc::new(MemoryDb::new());

    let stale = db
        .push(json!({
            "job": 1,
            "_state": "in_progress",
            "_owner": "dead:0",
            "_state_changed": db.server_now_ms() - 100
        }))
        .await
        .unwrap();

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, job: JobHandle| async move {
            job.resolve(None).await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({
            "in_progress_state": "in_progress",
            "finished_state": "done",
            "timeout": 500
        })))
        .await;
    // Replacing the spec before the timer fires clears it.
    worker.set_task_spec(None).await;

    sleep(Duration::from_millis(700)).await;
    let untouched = db.get(&stale).await.unwrap().unwrap();
    assert_eq!(untouched["_state"], json!("in_progress"));
    assert_eq!(untouched["_owner"], json!("dead:0"));

    worker.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_the_task_in_flight() {
    let db = Arc::new(MemoryDb::new());

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, job: JobHandle| async move {
            sleep(Duration::from_millis(400)).await;
            job.resolve(None).await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({
            "in_progress_state": "in_progress",
            "finished_state": "done"
        })))
        .await;

    let id = db.push(json!({"job": 1})).await.unwrap();
    wait_for_task(&db, &id, |t| state_of(t) == Some("in_progress")).await;

    let started = Instant::now();
    worker.shutdown().await;
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "shutdown returned before the in-flight task completed"
    );

    // The resolve committed before the drain finished.
    assert_eq!(
        state_of(db.get(&id).await.unwrap().as_ref()),
        Some("done")
    );

    // No further tasks are picked up after the drain.
    let late = db.push(json!({"job": 2})).await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(db.get(&late).await.unwrap(), Some(json!({"job": 2})));
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let db = Arc::new(MemoryDb::new());

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, job: JobHandle| async move {
            sleep(Duration::from_millis(200)).await;
            job.resolve(None).await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({
            "in_progress_state": "in_progress",
            "finished_state": "done"
        })))
        .await;

    let id = db.push(json!({"job": 1})).await.unwrap();
    wait_for_task(&db, &id, |t| state_of(t) == Some("in_progress")).await;

    // Every concurrent and subsequent call observes the same drain.
    tokio::join!(worker.shutdown(), worker.shutdown());
    worker.shutdown().await;
    assert_eq!(
        state_of(db.get(&id).await.unwrap().as_ref()),
        Some("done")
    );
}

#[tokio::test]
async fn shutdown_with_nothing_in_flight_returns_immediately() {
    let db = Arc::new(MemoryDb::new());

    let worker = QueueWorker::builder()
        .tasks(db.clone())
        .process_id("w")
        .processor(ProcessorFn(|_payload: Value, job: JobHandle| async move {
            job.resolve(None).await;
            Ok::<(), anyhow::Error>(())
        }))
        .build()
        .unwrap();
    worker
        .set_task_spec(Some(&json!({"in_progress_state": "in_progress"})))
        .await;

    let started = Instant::now();
    worker.shutdown().await;
    assert!(started.elapsed() < Duration::from_millis(100));
}
