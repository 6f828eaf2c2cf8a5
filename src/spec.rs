//! Stage descriptors binding a worker to one step of the pipeline.

use std::time::Duration;

use serde_json::Value;

/// State a task lands in when it fails out of its retry budget and the spec
/// names no error state of its own.
pub const DEFAULT_ERROR_STATE: &str = "error";

/// Retry budget applied when the spec leaves `retries` unset.
pub const DEFAULT_RETRIES: u32 = 0;

/// A validated stage descriptor.
///
/// A spec names the state a task enters the stage from (`start_state`, where
/// `None` selects tasks carrying no state at all), the state it holds while a
/// worker owns it, and where it lands on success or exhausted failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub start_state: Option<String>,
    pub in_progress_state: String,
    pub finished_state: Option<String>,
    pub error_state: String,
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl TaskSpec {
    /// A spec with the given in-progress state and every optional field at
    /// its default: null start state, no finished state, error state
    /// [`DEFAULT_ERROR_STATE`], no timeout, no retries.
    pub fn new(in_progress_state: impl Into<String>) -> Self {
        Self {
            start_state: None,
            in_progress_state: in_progress_state.into(),
            finished_state: None,
            error_state: DEFAULT_ERROR_STATE.to_string(),
            timeout: None,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = Some(state.into());
        self
    }

    pub fn finished_state(mut self, state: impl Into<String>) -> Self {
        self.finished_state = Some(state.into());
        self
    }

    pub fn error_state(mut self, state: impl Into<String>) -> Self {
        self.error_state = state.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }

    pub fn timeout_ms(&self) -> Option<i64> {
        self.timeout.map(|t| t.as_millis() as i64)
    }

    /// Parses and validates a spec from arbitrary JSON.
    ///
    /// Returns `None` for anything that is not a valid spec: non-mappings,
    /// arrays, a missing or empty `in_progress_state`, states that collide
    /// with the in-progress state, a non-positive or fractional `timeout`, or
    /// a negative or fractional `retries`. Explicit nulls for the optional
    /// fields are equivalent to omitting them.
    pub fn parse(value: &Value) -> Option<Self> {
        let map = value.as_object()?;

        let in_progress_state = match map.get("in_progress_state") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return None,
        };

        let start_state = match map.get("start_state") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            _ => return None,
        };

        let finished_state = match map.get("finished_state") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            _ => return None,
        };

        let error_state = match map.get("error_state") {
            None | Some(Value::Null) => DEFAULT_ERROR_STATE.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => return None,
        };

        let timeout = match map.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                _ => return None,
            },
        };

        let retries = match map.get("retries") {
            None | Some(Value::Null) => DEFAULT_RETRIES,
            Some(v) => match v.as_u64() {
                Some(n) => u32::try_from(n).ok()?,
                None => return None,
            },
        };

        if start_state.as_deref() == Some(in_progress_state.as_str()) {
            return None;
        }
        if start_state.is_some() && start_state == finished_state {
            return None;
        }
        if finished_state.as_deref() == Some(in_progress_state.as_str()) {
            return None;
        }
        if error_state == in_progress_state {
            return None;
        }

        Some(Self {
            start_state,
            in_progress_state,
            finished_state,
            error_state,
            timeout,
            retries,
        })
    }

    /// The validity predicate over arbitrary JSON.
    pub fn is_valid(value: &Value) -> bool {
        Self::parse(value).is_some()
    }
}
