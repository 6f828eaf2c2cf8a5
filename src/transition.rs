//! Pure transition functions over observed task records.
//!
//! Every mutation a worker performs is one of these functions, run inside a
//! compare-and-set transaction: the backend hands the reducer the latest
//! observed value and may re-invoke it on contention, so correctness depends
//! only on the observed record. Nothing in this module performs I/O.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::db::{StateFilter, TaskQuery};
use crate::spec::TaskSpec;
use crate::task::{ErrorDetails, Task};

/// Outcome of a transition function, interpreted by the transaction runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Commit this record at the task's location.
    Update(Task),
    /// Delete the task's location.
    Remove,
    /// Abort the transaction without writing.
    Skip,
}

/// Transition functions scoped to one owner token and one stage spec.
///
/// The owner token carries the worker's claim generation; any transition that
/// observes a record owned by someone else aborts. A reaper reset is the one
/// deliberate exception.
#[derive(Debug, Clone)]
pub struct Transitions {
    owner: String,
    spec: TaskSpec,
    server_offset_ms: i64,
}

impl Transitions {
    pub fn new(owner: impl Into<String>, spec: TaskSpec, server_offset_ms: i64) -> Self {
        Self {
            owner: owner.into(),
            spec,
            server_offset_ms,
        }
    }

    /// The same spec and clock under a different owner token. Used to pin a
    /// claimed task to the token that actually won the claim.
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            spec: self.spec.clone(),
            server_offset_ms: self.server_offset_ms,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn server_now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.server_offset_ms
    }

    fn owned_in_progress(&self, task: &Task) -> bool {
        task.owner() == Some(self.owner.as_str())
            && task.state() == Some(self.spec.in_progress_state.as_str())
    }

    fn reset_record(&self, task: &Task) -> Task {
        let mut next = task.clone();
        next.set_state(self.spec.start_state.as_deref());
        next.set_owner(None);
        next.set_progress(None);
        next.touch_state_changed();
        next.set_error_details(None);
        next
    }

    /// Returns the task to its start state if this worker still owns it.
    pub fn reset(&self, current: Option<&Value>) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(task) = Task::from_value(value) else {
            return Transition::Skip;
        };
        if !self.owned_in_progress(&task) {
            return Transition::Skip;
        }
        Transition::Update(self.reset_record(&task))
    }

    /// Returns an in-progress task to its start state once its last state
    /// change is at least `timeout` old. Ownership is not checked: any worker
    /// may reap a task abandoned by a dead one.
    pub fn reset_if_timed_out(&self, current: Option<&Value>) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(timeout) = self.spec.timeout_ms() else {
            return Transition::Skip;
        };
        let Some(task) = Task::from_value(value) else {
            return Transition::Skip;
        };
        if task.state() != Some(self.spec.in_progress_state.as_str()) {
            return Transition::Skip;
        }
        let Some(changed) = task.state_changed_ms() else {
            return Transition::Skip;
        };
        if self.server_now_ms() - changed < timeout {
            return Transition::Skip;
        }
        Transition::Update(self.reset_record(&task))
    }

    /// Claims an eligible task for the owner produced by `owner_token`.
    ///
    /// A record that is not a mapping cannot move through the pipeline at
    /// all; it is routed straight to the error state with its original value
    /// preserved for inspection.
    pub fn claim(
        &self,
        current: Option<&Value>,
        owner_token: &mut dyn FnMut() -> String,
    ) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(task) = Task::from_value(value) else {
            let mut quarantined = Task::new();
            quarantined.set_state(Some(self.spec.error_state.as_str()));
            quarantined.touch_state_changed();
            quarantined.set_error_details(Some(ErrorDetails::malformed(value.clone())));
            return Transition::Update(quarantined);
        };
        if task.state() != self.spec.start_state.as_deref() {
            return Transition::Skip;
        }
        let mut next = task.clone();
        next.set_state(Some(self.spec.in_progress_state.as_str()));
        next.touch_state_changed();
        let owner = owner_token();
        next.set_owner(Some(owner.as_str()));
        next.set_progress(Some(0));
        Transition::Update(next)
    }

    /// Completes the task, merging `payload` over the record and routing it
    /// to its next state.
    ///
    /// The payload's `_new_state` field is consumed: a string routes the task
    /// there, `false` deletes it, and an explicit `null` clears the state so
    /// the record waits stateless. Anything else falls back to the spec's
    /// finished state. With no finished state configured there is nowhere for
    /// a completed task to rest, so those last two cases delete instead.
    pub fn resolve(&self, current: Option<&Value>, payload: Option<Value>) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(task) = Task::from_value(value) else {
            return Transition::Skip;
        };
        if !self.owned_in_progress(&task) {
            return Transition::Skip;
        }

        let mut payload = match payload {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        let next_state = match payload.remove(crate::task::fields::NEW_STATE) {
            Some(Value::String(s)) => Some(s),
            Some(Value::Bool(false)) => return Transition::Remove,
            Some(Value::Null) if self.spec.finished_state.is_none() => {
                return Transition::Remove;
            }
            Some(Value::Null) => None,
            _ => match self.spec.finished_state.clone() {
                Some(state) => Some(state),
                None => return Transition::Remove,
            },
        };

        let mut next = task.clone();
        for (key, value) in payload {
            next.insert(key, value);
        }
        next.set_state(next_state.as_deref());
        next.touch_state_changed();
        next.set_progress(Some(100));
        next.set_owner(None);
        next.set_error_details(None);
        Transition::Update(next)
    }

    /// Records a failure, routing the task back to its start state while the
    /// retry budget lasts and to the error state once it is spent.
    pub fn reject(
        &self,
        current: Option<&Value>,
        error: Option<String>,
        error_stack: Option<String>,
    ) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(task) = Task::from_value(value) else {
            return Transition::Skip;
        };
        if !self.owned_in_progress(&task) {
            return Transition::Skip;
        }

        // A prior error chain only counts when it failed out of the same
        // in-progress state; otherwise the attempt count starts over.
        let previous_attempts = task
            .error_details()
            .filter(|d| d.previous_state.as_deref() == Some(self.spec.in_progress_state.as_str()))
            .and_then(|d| d.attempts)
            .unwrap_or(0);
        let attempts = previous_attempts + 1;

        let next_state = if attempts > self.spec.retries {
            Some(self.spec.error_state.clone())
        } else {
            self.spec.start_state.clone()
        };

        let mut next = task.clone();
        next.set_state(next_state.as_deref());
        next.set_owner(None);
        next.touch_state_changed();
        next.set_error_details(Some(ErrorDetails {
            previous_state: Some(self.spec.in_progress_state.clone()),
            attempts: Some(attempts),
            error,
            error_stack,
            original_task: None,
        }));
        Transition::Update(next)
    }

    /// Updates the progress of a task this worker still owns.
    pub fn update_progress(&self, current: Option<&Value>, progress: u8) -> Transition {
        let Some(value) = current else {
            return Transition::Remove;
        };
        let Some(task) = Task::from_value(value) else {
            return Transition::Skip;
        };
        if !self.owned_in_progress(&task) {
            return Transition::Skip;
        }
        let mut next = task.clone();
        next.set_progress(Some(i64::from(progress)));
        Transition::Update(next)
    }

    /// True when the record sits in this spec's error state, e.g. a claim
    /// that quarantined a malformed record.
    pub fn is_in_error_state(&self, value: &Value) -> bool {
        Task::from_value(value).is_some_and(|t| t.state() == Some(self.spec.error_state.as_str()))
    }

    /// How long until an observed in-progress record is due for reaping.
    /// `None` when the spec carries no timeout.
    pub fn expiry_delay(&self, value: &Value) -> Option<Duration> {
        let timeout = self.spec.timeout_ms()?;
        let elapsed = Task::from_value(value)
            .and_then(|t| t.state_changed_ms())
            .map(|changed| self.server_now_ms() - changed)
            .unwrap_or(0);
        Some(Duration::from_millis((timeout - elapsed).max(0) as u64))
    }

    /// Query selecting the single earliest-inserted task waiting at the start
    /// state.
    pub fn next_task_query(&self) -> TaskQuery {
        TaskQuery {
            state: StateFilter::Is(self.spec.start_state.clone()),
            limit: Some(1),
        }
    }

    /// Query over every task currently held in progress.
    pub fn in_progress_query(&self) -> TaskQuery {
        TaskQuery {
            state: StateFilter::Is(Some(self.spec.in_progress_state.clone())),
            limit: None,
        }
    }
}
