//! Queue records as delivered by the queue server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resolver::resolve;

/// Keys that may carry a record's identity, tried in order.
const UID_KEYS: [&str; 2] = ["item_uid", "uid"];

/// A loosely shaped queue item.
///
/// The queue server sends plan items as JSON objects whose layout depends on
/// the plan and on whether the item is wrapped one level deeper under `item`.
/// Nothing about the layout is assumed here; the resolver finds fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueRecord(Map<String, Value>);

impl QueueRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from any JSON value.
    ///
    /// Non-object values become `{"name": <text>}`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::String(name) => Self::named(name),
            other => Self::named(other.to_string()),
        }
    }

    fn named(name: String) -> Self {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::String(name));
        Self(map)
    }

    /// Set a top-level field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// The top-level `kwargs` mapping, if present.
    pub fn kwargs(&self) -> Option<&Map<String, Value>> {
        self.0.get("kwargs").and_then(Value::as_object)
    }

    /// The `kwargs` mapping of a record wrapped under `item`, if present.
    pub fn nested_kwargs(&self) -> Option<&Map<String, Value>> {
        self.0
            .get("item")
            .and_then(Value::as_object)
            .and_then(|item| item.get("kwargs"))
            .and_then(Value::as_object)
    }

    /// The top-level `kwargs` mapping, created (or replaced when it is not an
    /// object) on demand.
    pub fn ensure_kwargs(&mut self) -> &mut Map<String, Value> {
        ensure_kwargs(&mut self.0)
    }

    /// Resolve the record's uid through `item_uid` then `uid`.
    pub fn uid(&self) -> Option<String> {
        UID_KEYS.iter().find_map(|key| match resolve(self, key) {
            Some(Value::String(uid)) if !uid.is_empty() => Some(uid.clone()),
            Some(Value::Number(uid)) => Some(uid.to_string()),
            _ => None,
        })
    }

    /// The plan name: the top-level `name` when set, else the resolved one.
    pub fn plan_name(&self) -> String {
        let direct = self.0.get("name").filter(|v| is_truthy(v));
        direct
            .or_else(|| resolve(self, "name").filter(|v| is_truthy(v)))
            .map(format_scalar)
            .unwrap_or_default()
    }

    /// Produce the display form of a record.
    ///
    /// A record wrapped under `item` has its `name` and `kwargs` lifted to the
    /// top level when absent there. Completed records additionally get
    /// `status`/`exit_status` hoisted from `result` (then from the wrapped
    /// item), with `status` defaulting to `"completed"`.
    pub fn normalized(&self, completed: bool) -> QueueRecord {
        let mut normalized = self.0.clone();

        if let Some(Value::Object(nested)) = normalized.get("item").cloned() {
            if !normalized.contains_key("name")
                && let Some(name) = nested.get("name")
            {
                normalized.insert("name".to_string(), name.clone());
            }
            if !normalized.contains_key("kwargs")
                && let Some(kwargs @ Value::Object(_)) = nested.get("kwargs")
            {
                normalized.insert("kwargs".to_string(), kwargs.clone());
            }
        }

        if completed {
            if let Some(Value::Object(result)) = normalized.get("result").cloned() {
                let status = truthy_field(&result, "status").or_else(|| truthy_field(&result, "state"));
                if let Some(status) = status {
                    normalized.insert("status".to_string(), status);
                }
                if let Some(exit_status) = truthy_field(&result, "exit_status") {
                    normalized.insert("exit_status".to_string(), exit_status);
                }
            }

            if let Some(Value::Object(nested)) = normalized.get("item").cloned() {
                for key in ["status", "exit_status"] {
                    if !normalized.contains_key(key)
                        && let Some(value) = truthy_field(&nested, key)
                    {
                        normalized.insert(key.to_string(), value);
                    }
                }
            }

            if !normalized.contains_key("status") {
                normalized.insert("status".to_string(), Value::from("completed"));
            }
            if !normalized.contains_key("state") {
                let status = normalized.get("status").cloned().unwrap_or(Value::Null);
                normalized.insert("state".to_string(), status);
            }
        }

        if normalized.get("name").is_none_or(Value::is_null) {
            normalized.insert("name".to_string(), Value::from("Unknown"));
        }

        QueueRecord(normalized)
    }
}

impl From<Map<String, Value>> for QueueRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

pub(crate) fn ensure_kwargs(map: &mut Map<String, Value>) -> &mut Map<String, Value> {
    let entry = map
        .entry("kwargs")
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(kwargs) => kwargs,
        _ => unreachable!("kwargs was just replaced with an object"),
    }
}

fn truthy_field(map: &Map<String, Value>, key: &str) -> Option<Value> {
    map.get(key).filter(|v| is_truthy(v)).cloned()
}

/// Truthiness in the loose sense the queue server's payloads rely on.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text for a single value: strings verbatim, null empty, anything else as JSON.
pub fn format_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Elements joined with `", "`.
pub fn format_sequence(values: &[Value]) -> String {
    values
        .iter()
        .map(format_scalar)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `key=value` pairs joined with `", "`.
pub fn format_mapping(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(key, value)| format!("{}={}", key, format_scalar(value)))
        .collect::<Vec<_>>()
        .join(", ")
}
