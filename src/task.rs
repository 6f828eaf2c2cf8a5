//! Task records and the control fields the pipeline reserves on them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reserved field names on a task record.
///
/// Everything else on a record is user data and rides along verbatim across
/// state transitions.
pub mod fields {
    /// Current pipeline state, absent for tasks waiting at a null start state.
    pub const STATE: &str = "_state";
    /// Server-side wall clock of the last state transition.
    pub const STATE_CHANGED: &str = "_state_changed";
    /// Owner token of the worker currently holding the task.
    pub const OWNER: &str = "_owner";
    /// Progress percentage reported by the processing function.
    pub const PROGRESS: &str = "_progress";
    /// Details of the most recent rejection or quarantine.
    pub const ERROR_DETAILS: &str = "_error_details";
    /// Transient task id injected into unsanitized payloads. Never persisted.
    pub const ID: &str = "_id";
    /// Resolve-payload directive naming the state to land in. Consumed on resolve.
    pub const NEW_STATE: &str = "_new_state";
}

const RESERVED: &[&str] = &[
    fields::STATE,
    fields::STATE_CHANGED,
    fields::OWNER,
    fields::PROGRESS,
    fields::ERROR_DETAILS,
    fields::ID,
    fields::NEW_STATE,
];

/// The server-timestamp sentinel. Backends replace this value with their own
/// clock at commit time, so state-change stamps are authoritative even when
/// worker clocks drift.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Returns true if `value` is the server-timestamp sentinel.
pub fn is_server_timestamp(value: &Value) -> bool {
    value.as_object().is_some_and(|m| {
        m.len() == 1 && m.get(".sv").and_then(Value::as_str) == Some("timestamp")
    })
}

/// Error metadata attached to a task on rejection or quarantine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The in-progress state the task failed out of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    /// Consecutive failures out of the same in-progress state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    /// The original value of a record quarantined as malformed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_task: Option<Value>,
}

impl ErrorDetails {
    /// Details for a record that was not a mapping at claim time.
    pub fn malformed(original: Value) -> Self {
        Self {
            error: Some("Task was malformed".to_string()),
            original_task: Some(original),
            ..Self::default()
        }
    }
}

/// A task record: a JSON mapping with a handful of reserved control fields.
///
/// Accessors treat an explicit JSON `null` the same as an absent field, which
/// matches how hierarchical realtime databases collapse null writes into
/// deletions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task(Map<String, Value>);

impl Task {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Borrows a task view of `value`, or `None` when it is not a mapping.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().cloned().map(Self)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn set_or_null(&mut self, key: &str, value: Option<Value>) {
        self.0.insert(key.to_string(), value.unwrap_or(Value::Null));
    }

    pub fn state(&self) -> Option<&str> {
        self.str_field(fields::STATE)
    }

    pub fn set_state(&mut self, state: Option<&str>) {
        self.set_or_null(fields::STATE, state.map(|s| Value::String(s.to_string())));
    }

    pub fn owner(&self) -> Option<&str> {
        self.str_field(fields::OWNER)
    }

    pub fn set_owner(&mut self, owner: Option<&str>) {
        self.set_or_null(fields::OWNER, owner.map(|s| Value::String(s.to_string())));
    }

    pub fn progress(&self) -> Option<i64> {
        self.0.get(fields::PROGRESS).and_then(Value::as_i64)
    }

    pub fn set_progress(&mut self, progress: Option<i64>) {
        self.set_or_null(fields::PROGRESS, progress.map(Value::from));
    }

    /// Millisecond timestamp of the last transition, `None` while the value is
    /// still the unresolved sentinel or absent.
    pub fn state_changed_ms(&self) -> Option<i64> {
        self.0.get(fields::STATE_CHANGED).and_then(Value::as_i64)
    }

    /// Stamps the record with the server-timestamp sentinel.
    pub fn touch_state_changed(&mut self) {
        self.0
            .insert(fields::STATE_CHANGED.to_string(), server_timestamp());
    }

    pub fn error_details(&self) -> Option<ErrorDetails> {
        self.0
            .get(fields::ERROR_DETAILS)
            .filter(|v| v.is_object())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_error_details(&mut self, details: Option<ErrorDetails>) {
        let value = details.map(|d| serde_json::to_value(d).expect("plain data serializes"));
        self.set_or_null(fields::ERROR_DETAILS, value);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The user-visible payload: the record without its reserved fields.
    pub fn sanitized(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_fields_read_as_absent() {
        let mut task = Task::new();
        task.set_owner(Some("p:1"));
        assert_eq!(task.owner(), Some("p:1"));

        task.set_owner(None);
        assert_eq!(task.owner(), None);
        // The null is still written so backends can collapse it into a delete.
        assert_eq!(task.get(fields::OWNER), Some(&Value::Null));
    }

    #[test]
    fn sentinel_round_trip() {
        let sentinel = server_timestamp();
        assert!(is_server_timestamp(&sentinel));
        assert!(!is_server_timestamp(&json!({".sv": "increment"})));
        assert!(!is_server_timestamp(&json!(1234)));

        let mut task = Task::new();
        task.touch_state_changed();
        // Unresolved sentinel has no millisecond reading yet.
        assert_eq!(task.state_changed_ms(), None);
    }

    #[test]
    fn sanitize_strips_reserved_fields_only() {
        let value = json!({
            "_state": "in_progress",
            "_owner": "p:0",
            "_progress": 10,
            "_state_changed": 1,
            "_error_details": {"error": "x"},
            "job": "encode",
            "frames": 24
        });
        let task = Task::from_value(&value).unwrap();
        assert_eq!(task.sanitized(), json!({"job": "encode", "frames": 24}));
    }

    #[test]
    fn error_details_survive_round_trip() {
        let mut task = Task::new();
        let details = ErrorDetails {
            previous_state: Some("in_progress".to_string()),
            attempts: Some(2),
            error: Some("boom".to_string()),
            error_stack: None,
            original_task: None,
        };
        task.set_error_details(Some(details.clone()));
        assert_eq!(task.error_details(), Some(details));

        task.set_error_details(None);
        assert_eq!(task.error_details(), None);
    }

    #[test]
    fn malformed_details_carry_the_original_value() {
        let details = ErrorDetails::malformed(json!("not a mapping"));
        assert_eq!(details.error.as_deref(), Some("Task was malformed"));
        assert_eq!(details.original_task, Some(json!("not a mapping")));
        assert_eq!(details.attempts, None);
    }
}
