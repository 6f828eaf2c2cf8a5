//! In-process implementation of the database port.
//!
//! Everything lives in one mutex-held tree. Commits resolve server-timestamp
//! sentinels against this backend's clock, collapse null fields into
//! deletions, and re-evaluate every live query to emit membership diffs, the
//! same observable contract a remote realtime backend provides.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::task::is_server_timestamp;
use crate::transition::Transition;

use super::{
    ChildEvent, ChildSnapshot, Database, DbError, ListenerGuard, Reducer, Subscription, TaskQuery,
    TxnResult,
};

/// An in-memory task collection.
///
/// Push keys are zero-padded counters, so lexicographic key order is
/// insertion order. The artificial server offset lets tests exercise timeout
/// arithmetic without waiting on real clocks.
#[derive(Clone)]
pub struct MemoryDb {
    inner: Arc<Inner>,
}

struct Inner {
    store: Mutex<Store>,
    server_offset_ms: i64,
}

#[derive(Default)]
struct Store {
    tasks: BTreeMap<String, Value>,
    next_key: u64,
    next_listener: u64,
    child_listeners: Vec<ChildListener>,
    field_watchers: Vec<FieldWatcher>,
}

struct ChildListener {
    id: u64,
    query: TaskQuery,
    sender: mpsc::UnboundedSender<ChildEvent>,
    matched: BTreeMap<String, Value>,
}

struct FieldWatcher {
    id: u64,
    task_id: String,
    field: String,
    sender: mpsc::UnboundedSender<Option<Value>>,
    last: Option<Value>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::with_server_offset(0)
    }

    /// A backend whose server clock runs `offset_ms` ahead of this process.
    pub fn with_server_offset(offset_ms: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(Store::default()),
                server_offset_ms: offset_ms,
            }),
        }
    }

    pub fn server_now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.inner.server_offset_ms
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.inner.store.lock().expect("store mutex poisoned")
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

/// The `_state` of a stored record; non-mappings carry none, which is why a
/// malformed record still matches a null-start-state query and gets claimed
/// into quarantine.
fn state_of(value: &Value) -> Option<&str> {
    value.get(crate::task::fields::STATE).and_then(Value::as_str)
}

/// Resolves sentinels and collapses nulls. Returns `None` when nothing
/// remains to store.
fn normalize(value: Value, now_ms: i64) -> Option<Value> {
    match value {
        Value::Null => None,
        v if is_server_timestamp(&v) => Some(Value::from(now_ms)),
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v, now_ms).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        v => Some(v),
    }
}

impl Store {
    fn matches(&self, query: &TaskQuery) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (id, value) in &self.tasks {
            if query.state.matches(state_of(value)) {
                out.insert(id.clone(), value.clone());
                if query.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        out
    }

    /// Re-evaluates every live listener after a commit and emits diffs.
    fn notify(&mut self) {
        let snapshots: Vec<BTreeMap<String, Value>> = self
            .child_listeners
            .iter()
            .map(|l| self.matches(&l.query))
            .collect();

        for (listener, current) in self.child_listeners.iter_mut().zip(snapshots) {
            for (id, old) in &listener.matched {
                if !current.contains_key(id) {
                    let _ = listener.sender.send(ChildEvent::Removed(ChildSnapshot {
                        id: id.clone(),
                        data: old.clone(),
                    }));
                }
            }
            for (id, new) in &current {
                match listener.matched.get(id) {
                    None => {
                        let _ = listener.sender.send(ChildEvent::Added(ChildSnapshot {
                            id: id.clone(),
                            data: new.clone(),
                        }));
                    }
                    Some(old) if old != new => {
                        let _ = listener.sender.send(ChildEvent::Changed(ChildSnapshot {
                            id: id.clone(),
                            data: new.clone(),
                        }));
                    }
                    Some(_) => {}
                }
            }
            listener.matched = current;
        }

        for watcher in &mut self.field_watchers {
            let current = self
                .tasks
                .get(&watcher.task_id)
                .and_then(|v| v.get(&watcher.field))
                .cloned();
            if current != watcher.last {
                let _ = watcher.sender.send(current.clone());
                watcher.last = current;
            }
        }
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn push(&self, task: Value) -> Result<String, DbError> {
        let now = self.server_now_ms();
        let mut store = self.lock();
        let id = format!("{:012}", store.next_key);
        store.next_key += 1;
        if let Some(stored) = normalize(task, now) {
            store.tasks.insert(id.clone(), stored);
            store.notify();
        }
        debug!(task = %id, "pushed task");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, DbError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn transaction(&self, id: &str, reducer: Reducer<'_>) -> Result<TxnResult, DbError> {
        let now = self.server_now_ms();
        let mut store = self.lock();
        let current = store.tasks.get(id).cloned();

        match reducer(current.as_ref()) {
            Transition::Skip => Ok(TxnResult {
                committed: false,
                snapshot: current,
            }),
            Transition::Remove => {
                if store.tasks.remove(id).is_some() {
                    store.notify();
                }
                Ok(TxnResult {
                    committed: true,
                    snapshot: None,
                })
            }
            Transition::Update(task) => {
                let snapshot = normalize(task.into_value(), now);
                match &snapshot {
                    Some(stored) => {
                        store.tasks.insert(id.to_string(), stored.clone());
                    }
                    None => {
                        store.tasks.remove(id);
                    }
                }
                store.notify();
                Ok(TxnResult {
                    committed: true,
                    snapshot,
                })
            }
        }
    }

    async fn query_once(&self, query: &TaskQuery) -> Result<Vec<ChildSnapshot>, DbError> {
        let store = self.lock();
        Ok(store
            .matches(query)
            .into_iter()
            .map(|(id, data)| ChildSnapshot { id, data })
            .collect())
    }

    fn watch_children(&self, query: &TaskQuery) -> Subscription<ChildEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut store = self.lock();
        let matched = store.matches(query);
        for (id, data) in &matched {
            let _ = sender.send(ChildEvent::Added(ChildSnapshot {
                id: id.clone(),
                data: data.clone(),
            }));
        }
        let listener_id = store.next_listener;
        store.next_listener += 1;
        store.child_listeners.push(ChildListener {
            id: listener_id,
            query: query.clone(),
            sender,
            matched,
        });
        drop(store);

        let inner = Arc::clone(&self.inner);
        let guard = ListenerGuard::new(move || {
            let mut store = inner.store.lock().expect("store mutex poisoned");
            store.child_listeners.retain(|l| l.id != listener_id);
        });
        Subscription::new(receiver, guard)
    }

    fn watch_field(&self, id: &str, field: &str) -> Subscription<Option<Value>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut store = self.lock();
        let last = store.tasks.get(id).and_then(|v| v.get(field)).cloned();
        let _ = sender.send(last.clone());
        let listener_id = store.next_listener;
        store.next_listener += 1;
        store.field_watchers.push(FieldWatcher {
            id: listener_id,
            task_id: id.to_string(),
            field: field.to_string(),
            sender,
            last,
        });
        drop(store);

        let inner = Arc::clone(&self.inner);
        let guard = ListenerGuard::new(move || {
            let mut store = inner.store.lock().expect("store mutex poisoned");
            store.field_watchers.retain(|w| w.id != listener_id);
        });
        Subscription::new(receiver, guard)
    }

    fn server_offset_ms(&self) -> i64 {
        self.inner.server_offset_ms
    }
}
