//! Tests for the in-memory backend.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use treeline::{
    server_timestamp, ChildEvent, Database, MemoryDb, Task, TaskQuery, Transition,
};

async fn next_event(sub: &mut treeline::Subscription<ChildEvent>) -> ChildEvent {
    timeout(Duration::from_millis(500), sub.recv())
        .await
        .expect("no event within 500ms")
        .expect("backend gone")
}

#[tokio::test]
async fn push_preserves_insertion_order() {
    let db = MemoryDb::new();

    let first = db.push(json!({"n": 1})).await.unwrap();
    let second = db.push(json!({"n": 2})).await.unwrap();
    let third = db.push(json!({"n": 3})).await.unwrap();

    let all = db.query_once(&TaskQuery::all()).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str(), third.as_str()]);

    let head = db.query_once(&TaskQuery::all().limit(1)).await.unwrap();
    assert_eq!(head.len(), 1);
    assert_eq!(head[0].id, first);
}

#[tokio::test]
async fn state_queries_distinguish_stateless_tasks() {
    let db = MemoryDb::new();

    let stateless = db.push(json!({"n": 1})).await.unwrap();
    let staged = db.push(json!({"n": 2, "_state": "pending"})).await.unwrap();

    let no_state = db.query_once(&TaskQuery::with_state(None)).await.unwrap();
    assert_eq!(no_state.len(), 1);
    assert_eq!(no_state[0].id, stateless);

    let pending = db
        .query_once(&TaskQuery::with_state(Some("pending")))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, staged);
}

#[tokio::test]
async fn transaction_commits_updates_and_resolves_sentinels() {
    let db = MemoryDb::new();
    let id = db.push(json!({"job": "encode"})).await.unwrap();

    let before = db.server_now_ms();
    let result = db
        .transaction(&id, &mut |observed| {
            let mut task = Task::from_value(observed.unwrap()).unwrap();
            task.set_state(Some("pending"));
            task.touch_state_changed();
            task.set_owner(None);
            Transition::Update(task)
        })
        .await
        .unwrap();
    let after = db.server_now_ms();

    assert!(result.committed);
    let snapshot = result.snapshot.unwrap();
    assert_eq!(snapshot["_state"], json!("pending"));
    assert_eq!(snapshot["job"], json!("encode"));

    // The sentinel resolved to server time, and the null owner collapsed.
    let stamp = snapshot["_state_changed"].as_i64().unwrap();
    assert!(stamp >= before && stamp <= after);
    assert!(snapshot.get("_owner").is_none());
}

#[tokio::test]
async fn transaction_skip_aborts_without_writing() {
    let db = MemoryDb::new();
    let id = db.push(json!({"n": 1})).await.unwrap();

    let result = db
        .transaction(&id, &mut |_| Transition::Skip)
        .await
        .unwrap();
    assert!(!result.committed);
    assert_eq!(result.snapshot, Some(json!({"n": 1})));
    assert_eq!(db.get(&id).await.unwrap(), Some(json!({"n": 1})));
}

#[tokio::test]
async fn transaction_remove_deletes_the_location() {
    let db = MemoryDb::new();
    let id = db.push(json!({"n": 1})).await.unwrap();

    let result = db
        .transaction(&id, &mut |_| Transition::Remove)
        .await
        .unwrap();
    assert!(result.committed);
    assert_eq!(result.snapshot, None);
    assert_eq!(db.get(&id).await.unwrap(), None);

    // Deleting an already-empty location is a quiet no-op.
    let result = db
        .transaction("missing", &mut |_| Transition::Remove)
        .await
        .unwrap();
    assert!(result.committed);
}

#[tokio::test]
async fn child_watch_emits_existing_matches_then_diffs() {
    let db = MemoryDb::new();
    let existing = db.push(json!({"n": 1})).await.unwrap();

    let mut sub = db.watch_children(&TaskQuery::with_state(None));
    match next_event(&mut sub).await {
        ChildEvent::Added(snap) => assert_eq!(snap.id, existing),
        other => panic!("expected Added, got {other:?}"),
    }

    let added = db.push(json!({"n": 2})).await.unwrap();
    match next_event(&mut sub).await {
        ChildEvent::Added(snap) => assert_eq!(snap.id, added),
        other => panic!("expected Added, got {other:?}"),
    }

    // Giving the task a state moves it out of the stateless query.
    db.transaction(&added, &mut |observed| {
        let mut task = Task::from_value(observed.unwrap()).unwrap();
        task.set_state(Some("claimed"));
        Transition::Update(task)
    })
    .await
    .unwrap();
    match next_event(&mut sub).await {
        ChildEvent::Removed(snap) => assert_eq!(snap.id, added),
        other => panic!("expected Removed, got {other:?}"),
    }
}

#[tokio::test]
async fn limited_watch_advances_to_the_next_head() {
    let db = MemoryDb::new();
    let first = db.push(json!({"n": 1})).await.unwrap();
    let second = db.push(json!({"n": 2})).await.unwrap();

    let mut sub = db.watch_children(&TaskQuery::with_state(None).limit(1));
    match next_event(&mut sub).await {
        ChildEvent::Added(snap) => assert_eq!(snap.id, first),
        other => panic!("expected Added, got {other:?}"),
    }

    // Claiming the head admits the runner-up into the limit-1 window.
    db.transaction(&first, &mut |observed| {
        let mut task = Task::from_value(observed.unwrap()).unwrap();
        task.set_state(Some("claimed"));
        Transition::Update(task)
    })
    .await
    .unwrap();

    match next_event(&mut sub).await {
        ChildEvent::Removed(snap) => assert_eq!(snap.id, first),
        other => panic!("expected Removed, got {other:?}"),
    }
    match next_event(&mut sub).await {
        ChildEvent::Added(snap) => assert_eq!(snap.id, second),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[tokio::test]
async fn field_watch_reports_current_value_and_changes() {
    let db = MemoryDb::new();
    let id = db.push(json!({"_owner": "a:1"})).await.unwrap();

    let mut sub = db.watch_field(&id, "_owner");
    let initial = timeout(Duration::from_millis(500), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial, Some(json!("a:1")));

    db.transaction(&id, &mut |observed| {
        let mut task = Task::from_value(observed.unwrap()).unwrap();
        task.set_owner(Some("b:2"));
        Transition::Update(task)
    })
    .await
    .unwrap();
    let changed = timeout(Duration::from_millis(500), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(changed, Some(json!("b:2")));

    db.transaction(&id, &mut |_| Transition::Remove)
        .await
        .unwrap();
    let gone = timeout(Duration::from_millis(500), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone, None);
}

#[tokio::test]
async fn server_offset_shifts_the_clock_and_the_sentinel() {
    let offset = 60_000;
    let db = MemoryDb::with_server_offset(offset);
    assert_eq!(db.server_offset_ms(), offset);

    let local = chrono::Utc::now().timestamp_millis();
    let server = db.server_now_ms();
    assert!(server - local >= offset - 1000 && server - local <= offset + 1000);

    let id = db
        .push(json!({"n": 1, "_state_changed": server_timestamp()}))
        .await
        .unwrap();
    let stored: Value = db.get(&id).await.unwrap().unwrap();
    let stamp = stored["_state_changed"].as_i64().unwrap();
    assert!(stamp >= local + offset - 1000);
}
