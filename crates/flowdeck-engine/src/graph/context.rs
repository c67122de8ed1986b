use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Shared data of one run, keyed by node id plus the literal `input` key.
///
/// Append-only: a key, once written, keeps its first value. Templates read
/// whatever keys are populated so far.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    data: Value,
}

impl ExecutionContext {
    /// Start a run context holding only the run input.
    pub fn new(input: Value) -> Self {
        let mut data = Map::new();
        data.insert("input".to_string(), input);
        Self {
            data: Value::Object(data),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The run input (`null` if none was given).
    pub fn input(&self) -> &Value {
        self.data.get("input").unwrap_or(&Value::Null)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.get(key).is_some()
    }

    /// Record a node's output. Returns `false` and leaves the context
    /// untouched if the key was already written.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        let Value::Object(map) = &mut self.data else {
            return false;
        };
        if map.contains_key(&key) {
            warn!(key = %key, "Context key already written, keeping first value");
            return false;
        }
        map.insert(key, value);
        true
    }

    /// The whole context as a JSON object, for template resolution.
    pub fn as_value(&self) -> &Value {
        &self.data
    }

    /// An owned copy, for step input snapshots and tool requests.
    pub fn snapshot(&self) -> Value {
        self.data.clone()
    }

    pub fn into_value(self) -> Value {
        self.data
    }
}
