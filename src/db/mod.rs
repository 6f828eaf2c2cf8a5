//! Database port: the interface the pipeline consumes from a hierarchical
//! realtime backend.
//!
//! Tasks live as children under a single caller-provided location. The
//! backend must offer optimistic compare-and-set transactions, child-change
//! events over filtered queries, and the server-timestamp sentinel. The
//! in-process [`MemoryDb`](memory::MemoryDb) implements the trait for tests
//! and embedded use; remote backends plug in the same way.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::transition::Transition;

pub mod memory;

/// Error type for backend operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Equality filter on a task's `_state` field.
///
/// `Is(None)` selects tasks carrying no state at all, which is how stages
/// with a null start state find their work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateFilter {
    Any,
    Is(Option<String>),
}

impl StateFilter {
    pub fn matches(&self, state: Option<&str>) -> bool {
        match self {
            StateFilter::Any => true,
            StateFilter::Is(expected) => expected.as_deref() == state,
        }
    }
}

/// A filtered, insertion-ordered, optionally limited query over the task
/// collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQuery {
    pub state: StateFilter,
    pub limit: Option<usize>,
}

impl TaskQuery {
    /// Every task, in insertion order.
    pub fn all() -> Self {
        Self {
            state: StateFilter::Any,
            limit: None,
        }
    }

    /// Tasks whose `_state` equals `state` (`None` selects stateless tasks).
    pub fn with_state(state: Option<&str>) -> Self {
        Self {
            state: StateFilter::Is(state.map(str::to_string)),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A task id paired with its record, as carried by query results and events.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSnapshot {
    pub id: String,
    pub data: Value,
}

/// Membership change of a watched query.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    /// The task entered the query's result set.
    Added(ChildSnapshot),
    /// The task changed while remaining in the result set.
    Changed(ChildSnapshot),
    /// The task left the result set or was deleted.
    Removed(ChildSnapshot),
}

/// Result of a transaction: whether the reducer's write (or delete) was
/// committed, and the value now at the location.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnResult {
    pub committed: bool,
    pub snapshot: Option<Value>,
}

/// Unregisters a listener when dropped.
pub struct ListenerGuard(Option<Box<dyn FnOnce() + Send>>);

impl ListenerGuard {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(unregister)))
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(unregister) = self.0.take() {
            unregister();
        }
    }
}

/// A live event stream plus the registration it keeps alive. Dropping the
/// subscription detaches the listener.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    _guard: ListenerGuard,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>, guard: ListenerGuard) -> Self {
        Self {
            receiver,
            _guard: guard,
        }
    }

    /// Next event, or `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

/// Reducer run inside a transaction. The backend may invoke it several times
/// under contention, always with the latest observed value.
pub type Reducer<'a> = &'a mut (dyn FnMut(Option<&Value>) -> Transition + Send);

/// A task collection on a hierarchical realtime backend.
#[async_trait]
pub trait Database: Send + Sync {
    /// Appends a task, returning its generated id. Ids order by insertion.
    async fn push(&self, task: Value) -> Result<String, DbError>;

    /// Reads one task's record.
    async fn get(&self, id: &str) -> Result<Option<Value>, DbError>;

    /// Runs `reducer` as an optimistic compare-and-set transaction against
    /// one task location. Server-timestamp sentinels in the written record
    /// are resolved at commit; null fields collapse into deletions.
    async fn transaction(&self, id: &str, reducer: Reducer<'_>) -> Result<TxnResult, DbError>;

    /// One-shot evaluation of `query` against the current collection.
    async fn query_once(&self, query: &TaskQuery) -> Result<Vec<ChildSnapshot>, DbError>;

    /// Watches `query`, emitting an `Added` event per current match followed
    /// by membership changes as commits land.
    fn watch_children(&self, query: &TaskQuery) -> Subscription<ChildEvent>;

    /// Watches one field of one task, emitting its current value immediately
    /// and again on every change (`None` when field or task is gone).
    fn watch_field(&self, id: &str, field: &str) -> Subscription<Option<Value>>;

    /// Cached offset between this process's clock and the server's, in
    /// milliseconds. `server_now = local_now + offset`.
    fn server_offset_ms(&self) -> i64;
}
