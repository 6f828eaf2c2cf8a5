//! Queue worker runtime.
//!
//! A worker listens for tasks entering its stage's start state, claims one at
//! a time through a compare-and-set transaction, hands it to the processing
//! function, and routes the outcome back through further transactions. A
//! per-task expiry reaper returns tasks abandoned by dead workers to the
//! start state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use anyhow::Error as ProcessError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{ChildEvent, ChildSnapshot, Database, DbError, Subscription};
use crate::spec::TaskSpec;
use crate::task::{fields, Task};
use crate::transition::Transitions;

/// Errors from [`WorkerBuilder::build`].
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No tasks reference provided.")]
    NoTasksRef,
    #[error("Invalid process ID provided.")]
    InvalidProcessId,
    #[error("No processing function provided.")]
    NoProcessor,
}

/// Errors from [`JobHandle::progress`].
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Invalid progress")]
    InvalidProgress,
    #[error("Can't update progress - no task currently being processed")]
    NoCurrentTask,
    #[error("Can't update progress - current task no longer owned by this process")]
    NotOwned,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A user-supplied processing function.
///
/// Returning `Err` is equivalent to calling [`JobHandle::reject`] with the
/// error. The future may also run indefinitely without resolving; the worker
/// only advances on explicit `resolve`/`reject` calls, and `shutdown` drains
/// whatever is in flight.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: Value, job: JobHandle) -> Result<(), ProcessError>;
}

/// Adapts an async closure into a [`Processor`].
pub struct ProcessorFn<F>(pub F);

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(Value, JobHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    async fn process(&self, payload: Value, job: JobHandle) -> Result<(), ProcessError> {
        (self.0)(payload, job).await
    }
}

enum Completion {
    Resolve(Option<Value>),
    Reject(Option<ProcessError>),
}

/// Handle given to the processing function for reporting on its task.
///
/// Each handle captures the claim generation it was created under; once the
/// worker has moved on (completion, ownership loss, spec change), calls
/// through the handle become no-ops or reject with a staleness error.
#[derive(Clone)]
pub struct JobHandle {
    worker: Weak<WorkerInner>,
    task_number: u64,
}

impl JobHandle {
    /// Reports progress on the current task. `percent` must be at most 100.
    pub async fn progress(&self, percent: u8) -> Result<(), ProgressError> {
        if percent > 100 {
            return Err(ProgressError::InvalidProgress);
        }
        let Some(inner) = self.worker.upgrade() else {
            return Err(ProgressError::NoCurrentTask);
        };
        let state = inner.state.lock().await;
        if self.task_number != state.task_number {
            return Err(ProgressError::NoCurrentTask);
        }
        let Some(current) = state.current.as_ref() else {
            return Err(ProgressError::NoCurrentTask);
        };
        let id = current.id.clone();
        let transitions = current.transitions.clone();
        let result = inner
            .db
            .transaction(&id, &mut |observed| {
                transitions.update_progress(observed, percent)
            })
            .await?;
        drop(state);
        if !result.committed || result.snapshot.is_none() {
            return Err(ProgressError::NotOwned);
        }
        debug!(task = %id, progress = percent, "progress updated");
        Ok(())
    }

    /// Completes the current task, merging `new_task` into the record and
    /// routing it to its next state. Ignored when stale.
    pub async fn resolve(&self, new_task: Option<Value>) {
        if let Some(inner) = self.worker.upgrade() {
            inner
                .complete(self.task_number, Completion::Resolve(new_task))
                .await;
        }
    }

    /// Fails the current task, recording the error and routing the task per
    /// its retry budget. Pass `None` to record a reasonless failure. Ignored
    /// when stale.
    pub async fn reject(&self, error: Option<ProcessError>) {
        if let Some(inner) = self.worker.upgrade() {
            inner
                .complete(self.task_number, Completion::Reject(error))
                .await;
        }
    }
}

/// Builder for [`QueueWorker`].
pub struct WorkerBuilder {
    tasks: Option<Arc<dyn Database>>,
    process_id: Option<String>,
    sanitize: bool,
    suppress_stack: bool,
    processor: Option<Arc<dyn Processor>>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            tasks: None,
            process_id: None,
            sanitize: true,
            suppress_stack: false,
            processor: None,
        }
    }

    /// The task collection this worker drains.
    pub fn tasks(mut self, db: Arc<dyn Database>) -> Self {
        self.tasks = Some(db);
        self
    }

    /// Identifier of the owning process, the high-order half of owner tokens.
    pub fn process_id(mut self, id: impl Into<String>) -> Self {
        self.process_id = Some(id.into());
        self
    }

    /// Whether payloads handed to the processing function are stripped of
    /// reserved fields (default true). When false, the payload instead
    /// carries a transient `_id` field.
    pub fn sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    /// Suppresses error stacks in recorded error details (default false).
    pub fn suppress_stack(mut self, suppress: bool) -> Self {
        self.suppress_stack = suppress;
        self
    }

    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn build(self) -> Result<QueueWorker, WorkerError> {
        let db = self.tasks.ok_or(WorkerError::NoTasksRef)?;
        let process_id = self
            .process_id
            .filter(|id| !id.is_empty())
            .ok_or(WorkerError::InvalidProcessId)?;
        let processor = self.processor.ok_or(WorkerError::NoProcessor)?;

        let (drained_tx, mut drained_rx) = watch::channel(false);
        let drained = async move {
            let _ = drained_rx.wait_for(|done| *done).await;
        }
        .boxed()
        .shared();

        Ok(QueueWorker {
            inner: Arc::new(WorkerInner {
                db,
                process_id,
                sanitize: self.sanitize,
                suppress_stack: self.suppress_stack,
                processor,
                state: Mutex::new(WorkerState::default()),
                drained_tx,
                drained,
            }),
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A single worker draining one stage of the pipeline.
///
/// Workers are inert until [`set_task_spec`](QueueWorker::set_task_spec)
/// installs a valid spec. Call [`shutdown`](QueueWorker::shutdown) before
/// dropping so listeners and timers detach deterministically.
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker").finish_non_exhaustive()
    }
}

impl QueueWorker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    /// Whether `value` parses as a valid [`TaskSpec`].
    pub fn is_valid_task_spec(value: &Value) -> bool {
        TaskSpec::is_valid(value)
    }

    pub fn process_id(&self) -> &str {
        &self.inner.process_id
    }

    /// Installs or replaces the stage spec.
    ///
    /// Passing `None` or an invalid spec tears down all listeners and timers
    /// without error, leaving the worker idle. Either way, in-flight
    /// callbacks from a previously claimed task are invalidated.
    pub async fn set_task_spec(&self, spec: Option<&Value>) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        state.task_number += 1;
        state.teardown_listeners();
        state.transitions = None;

        let parsed = spec.and_then(TaskSpec::parse);
        let Some(spec) = parsed else {
            if spec.is_some() {
                debug!(process = %inner.process_id, "invalid task spec, worker idle");
            }
            return;
        };
        if state.shutting_down {
            return;
        }

        let owner = inner.owner_token(state.task_number);
        let transitions = Transitions::new(owner, spec, inner.db.server_offset_ms());
        debug!(
            process = %inner.process_id,
            in_progress = %transitions.spec().in_progress_state,
            "task spec installed"
        );

        let new_tasks = inner.db.watch_children(&transitions.next_task_query());
        state.new_task_pump = Some(tokio::spawn(pump_new_tasks(
            Arc::downgrade(inner),
            new_tasks,
        )));

        if transitions.spec().has_timeout() {
            let in_progress = inner.db.watch_children(&transitions.in_progress_query());
            state.in_progress_pump = Some(tokio::spawn(pump_in_progress(
                Arc::downgrade(inner),
                in_progress,
            )));
        }
        state.transitions = Some(transitions);
    }

    /// Stops listening for work and resolves once any in-flight task has
    /// been resolved or rejected and its commit has landed. Idempotent:
    /// every call observes the same drain.
    pub async fn shutdown(&self) {
        self.inner.begin_shutdown().await;
        self.inner.drained.clone().await;
    }
}

struct WorkerInner {
    db: Arc<dyn Database>,
    process_id: String,
    sanitize: bool,
    suppress_stack: bool,
    processor: Arc<dyn Processor>,
    state: Mutex<WorkerState>,
    drained_tx: watch::Sender<bool>,
    drained: Shared<BoxFuture<'static, ()>>,
}

#[derive(Default)]
struct WorkerState {
    /// Claim generation. Bumped on every spec change, claim attempt,
    /// completion, and ownership loss, so closures created under an older
    /// generation observe the mismatch and stand down.
    task_number: u64,
    busy: bool,
    /// The generation whose claim set `busy`, letting a stale completion
    /// release the worker without a newer claim being disturbed.
    busy_generation: u64,
    shutting_down: bool,
    transitions: Option<Transitions>,
    current: Option<CurrentTask>,
    new_task_pump: Option<JoinHandle<()>>,
    in_progress_pump: Option<JoinHandle<()>>,
    expiry_timers: HashMap<String, JoinHandle<()>>,
}

struct CurrentTask {
    id: String,
    transitions: Transitions,
    owner_watch: JoinHandle<()>,
}

impl WorkerState {
    fn teardown_listeners(&mut self) {
        if let Some(pump) = self.new_task_pump.take() {
            pump.abort();
        }
        if let Some(pump) = self.in_progress_pump.take() {
            pump.abort();
        }
        for (_, timer) in self.expiry_timers.drain() {
            timer.abort();
        }
    }
}

impl WorkerInner {
    fn owner_token(&self, task_number: u64) -> String {
        format!("{}:{}", self.process_id, task_number)
    }

    /// Attempts to claim the next eligible task and, on success, dispatches
    /// it to the processing function.
    fn try_to_process(self: &Arc<Self>) -> BoxFuture<'_, ()> {
        async move {
        let mut state = self.state.lock().await;
        if state.busy || state.shutting_down {
            return;
        }
        let Some(transitions) = state.transitions.clone() else {
            return;
        };

        let candidates = match self.db.query_once(&transitions.next_task_query()).await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(error = %error, "failed to look up next task");
                return;
            }
        };
        let Some(candidate) = candidates.into_iter().next() else {
            return;
        };

        state.task_number += 1;
        let owner = self.owner_token(state.task_number);
        let claim_owner = owner.clone();
        let mut owner_fn = move || claim_owner.clone();
        let result = match self
            .db
            .transaction(&candidate.id, &mut |observed| {
                transitions.claim(observed, &mut owner_fn)
            })
            .await
        {
            Ok(result) => result,
            Err(error) => {
                warn!(task = %candidate.id, error = %error, "claim transaction failed");
                return;
            }
        };

        if !result.committed {
            return;
        }
        let Some(snapshot) = result.snapshot else {
            return;
        };
        if transitions.is_in_error_state(&snapshot) {
            info!(task = %candidate.id, "malformed task quarantined");
            return;
        }
        let Some(task) = Task::from_value(&snapshot) else {
            return;
        };
        if task.state() != Some(transitions.spec().in_progress_state.as_str())
            || task.owner() != Some(owner.as_str())
        {
            return;
        }

        info!(task = %candidate.id, owner = %owner, "claimed task");
        state.busy = true;
        state.busy_generation = state.task_number;

        let owner_watch = tokio::spawn(pump_owner_watch(
            Arc::downgrade(self),
            self.db.watch_field(&candidate.id, fields::OWNER),
            candidate.id.clone(),
            owner.clone(),
        ));
        state.current = Some(CurrentTask {
            id: candidate.id.clone(),
            transitions: transitions.with_owner(&owner),
            owner_watch,
        });

        let payload = if self.sanitize {
            task.sanitized()
        } else {
            let mut with_id = task.clone();
            with_id.insert(fields::ID, Value::String(candidate.id.clone()));
            with_id.into_value()
        };
        let job = JobHandle {
            worker: Arc::downgrade(self),
            task_number: state.task_number,
        };
        let processor = Arc::clone(&self.processor);
        tokio::spawn(async move {
            if let Err(error) = processor.process(payload, job.clone()).await {
                job.reject(Some(error)).await;
            }
        });
        }
        .boxed()
    }

    /// Routes a resolve/reject from the processing function. A stale
    /// completion never touches the database; it only releases the worker if
    /// the claim that set `busy` was its own.
    async fn complete(self: &Arc<Self>, task_number: u64, completion: Completion) {
        let mut state = self.state.lock().await;
        if task_number == state.task_number {
            let Some(current) = state.current.take() else {
                return;
            };
            current.owner_watch.abort();
            let id = current.id;
            let transitions = current.transitions;
            let result = match completion {
                Completion::Resolve(payload) => {
                    self.db
                        .transaction(&id, &mut |observed| {
                            transitions.resolve(observed, payload.clone())
                        })
                        .await
                }
                Completion::Reject(error) => {
                    let message = error.as_ref().map(|e| e.to_string());
                    let stack = if self.suppress_stack {
                        None
                    } else {
                        error.as_ref().map(|e| format!("{e:?}"))
                    };
                    self.db
                        .transaction(&id, &mut |observed| {
                            transitions.reject(observed, message.clone(), stack.clone())
                        })
                        .await
                }
            };
            match result {
                Ok(result) if result.committed => info!(task = %id, "task completed"),
                Ok(_) => debug!(task = %id, "completion aborted, task no longer owned"),
                Err(error) => warn!(task = %id, error = %error, "completion transaction failed"),
            }
        } else {
            if !(state.busy && state.busy_generation == task_number) {
                return;
            }
            if let Some(orphan) = state.current.take() {
                orphan.owner_watch.abort();
            }
            debug!("completion from a released task");
        }

        state.busy = false;
        state.task_number += 1;
        let shutting_down = state.shutting_down;
        drop(state);

        if shutting_down {
            let _ = self.drained_tx.send(true);
        } else {
            self.try_to_process().await;
        }
    }

    /// Arms (or re-arms) the expiry timer for an observed in-progress task.
    async fn arm_expiry(self: &Arc<Self>, snapshot: ChildSnapshot) {
        let mut state = self.state.lock().await;
        let Some(transitions) = state.transitions.clone() else {
            return;
        };
        let Some(delay) = transitions.expiry_delay(&snapshot.data) else {
            return;
        };
        if let Some(previous) = state.expiry_timers.remove(&snapshot.id) {
            previous.abort();
        }
        let worker = Arc::downgrade(self);
        let id = snapshot.id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = worker.upgrade() {
                inner.reap(&id).await;
            }
        });
        state.expiry_timers.insert(snapshot.id, timer);
    }

    async fn cancel_expiry(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.expiry_timers.remove(id) {
            timer.abort();
        }
    }

    /// Resets a task whose last state change has outlived the spec timeout.
    /// Any worker may reap, regardless of who owns the task.
    async fn reap(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock().await;
        state.expiry_timers.remove(id);
        let Some(transitions) = state.transitions.clone() else {
            return;
        };
        match self
            .db
            .transaction(id, &mut |observed| transitions.reset_if_timed_out(observed))
            .await
        {
            Ok(result) if result.committed => {
                info!(task = %id, "reset timed-out task");
            }
            Ok(_) => {}
            Err(error) => warn!(task = %id, error = %error, "timeout reset failed"),
        }
    }

    async fn begin_shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        info!(process = %self.process_id, "worker shutting down");
        state.teardown_listeners();
        state.transitions = None;
        if !state.busy {
            let _ = self.drained_tx.send(true);
        }
    }
}

/// Forwards start-state arrivals into claim attempts.
async fn pump_new_tasks(worker: Weak<WorkerInner>, mut events: Subscription<ChildEvent>) {
    while let Some(event) = events.recv().await {
        if matches!(event, ChildEvent::Added(_)) {
            let Some(inner) = worker.upgrade() else {
                return;
            };
            inner.try_to_process().await;
        }
    }
}

/// Maintains expiry timers from the in-progress watch.
async fn pump_in_progress(worker: Weak<WorkerInner>, mut events: Subscription<ChildEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = worker.upgrade() else {
            return;
        };
        match event {
            ChildEvent::Added(snapshot) | ChildEvent::Changed(snapshot) => {
                inner.arm_expiry(snapshot).await;
            }
            ChildEvent::Removed(snapshot) => {
                inner.cancel_expiry(&snapshot.id).await;
            }
        }
    }
}

/// Watches the claimed task's owner field; when another party takes the task
/// over (a reaper reset or a competing claim), the current claim is released
/// so later callbacks from the processing function stand down.
async fn pump_owner_watch(
    worker: Weak<WorkerInner>,
    mut values: Subscription<Option<Value>>,
    task_id: String,
    owner: String,
) {
    while let Some(value) = values.recv().await {
        if value.as_ref().and_then(Value::as_str) == Some(owner.as_str()) {
            continue;
        }
        let Some(inner) = worker.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;
        let ours = state
            .current
            .as_ref()
            .is_some_and(|c| c.id == task_id && c.transitions.owner() == owner);
        if ours {
            info!(task = %task_id, "task ownership lost");
            state.current.take();
            state.task_number += 1;
        }
        return;
    }
}
