//! Field resolution across the shapes a queue record can take.
//!
//! The queue server sometimes nests the real record under `item` and sometimes
//! does not, and plan parameters may live at the top level or under `kwargs`.
//! Lookups therefore walk a fixed chain of containers instead of assuming a
//! layout.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::columns::AliasMap;
use crate::projection::RowState;
use crate::record::{QueueRecord, format_mapping, format_scalar, format_sequence, is_truthy};

/// Containers searched after the record itself, in order.
const FALLBACK_CONTAINERS: [&str; 4] = ["kwargs", "result", "metadata", "item"];

/// Resolve a dotted key inside a record.
///
/// The key is walked segment by segment; when an intermediate value is a list,
/// the first element that is a mapping holding the next segment is used. The
/// record is tried first, then `kwargs`, `result`, `metadata` and `item`, and
/// finally the wrapped item's `kwargs`. A present `null` counts as found.
pub fn resolve<'a>(record: &'a QueueRecord, key: &str) -> Option<&'a Value> {
    let parts: Vec<&str> = key.split('.').collect();
    let map = record.as_map();

    std::iter::once(Some(map))
        .chain(
            FALLBACK_CONTAINERS
                .iter()
                .map(|container| map.get(*container).and_then(Value::as_object)),
        )
        .chain(std::iter::once(record.nested_kwargs()))
        .flatten()
        .find_map(|container| walk(container, &parts))
}

fn walk<'a>(root: &'a Map<String, Value>, parts: &[&str]) -> Option<&'a Value> {
    let (first, rest) = parts.split_first()?;
    let mut current = root.get(*first)?;
    for part in rest {
        current = match current {
            Value::Object(map) => map.get(*part)?,
            Value::Array(entries) => entries
                .iter()
                .find_map(|entry| entry.as_object().and_then(|map| map.get(*part)))?,
            _ => return None,
        };
    }
    Some(current)
}

/// Result of an alias lookup.
///
/// `value` is `None` when no candidate held a value but one of them is a
/// declared parameter of the plan, so the cell can still be bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasMatch {
    pub value: Option<Value>,
    pub key: String,
}

/// Find the value of an aliased column.
///
/// Candidates are tried against `kwargs` (a present key wins even when null),
/// then against `item.kwargs`, then through [`resolve`]. Failing that, the
/// first candidate that is a declared plan parameter is returned without a
/// value.
pub fn lookup_alias_value(
    column_id: &str,
    record: &QueueRecord,
    aliases: &AliasMap,
    available_params: &HashSet<String>,
) -> Option<AliasMatch> {
    let candidates = aliases.candidates(column_id);
    if candidates.is_empty() {
        return None;
    }

    let literal = |mapping: &Map<String, Value>| {
        candidates.iter().find_map(|candidate| {
            mapping.get(candidate).map(|value| AliasMatch {
                value: Some(value.clone()),
                key: candidate.clone(),
            })
        })
    };

    if let Some(found) = record.kwargs().and_then(literal) {
        return Some(found);
    }
    if let Some(found) = record.nested_kwargs().and_then(literal) {
        return Some(found);
    }

    for candidate in candidates {
        if let Some(value) = resolve(record, candidate).filter(|v| !v.is_null()) {
            return Some(AliasMatch {
                value: Some(value.clone()),
                key: candidate.clone(),
            });
        }
    }

    candidates
        .iter()
        .find(|candidate| available_params.contains(candidate.as_str()))
        .map(|candidate| AliasMatch {
            value: None,
            key: candidate.clone(),
        })
}

/// Text of one table cell and the record key it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCell {
    pub text: String,
    pub source_key: Option<String>,
}

impl DisplayCell {
    fn keyed(text: impl Into<String>, key: &str) -> Self {
        Self {
            text: text.into(),
            source_key: Some(key.to_string()),
        }
    }

    fn unkeyed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_key: None,
        }
    }
}

/// Compute the display text of `column_id` for a record shown at `row_index`.
pub fn display_value(
    column_id: &str,
    record: &QueueRecord,
    row_index: usize,
    state: RowState,
    aliases: &AliasMap,
    available_params: &HashSet<String>,
) -> DisplayCell {
    if column_id == "index" {
        return DisplayCell::unkeyed((row_index + 1).to_string());
    }

    if aliases.contains(column_id)
        && let Some(found) = lookup_alias_value(column_id, record, aliases, available_params)
    {
        let text = found.value.as_ref().map(format_scalar).unwrap_or_default();
        return DisplayCell::keyed(text, &found.key);
    }

    if column_id == "name" {
        let name = resolve(record, "name")
            .or_else(|| record.get("name"))
            .filter(|v| is_truthy(v))
            .map(format_scalar)
            .unwrap_or_else(|| "Unknown".to_string());
        return DisplayCell::keyed(name, "name");
    }

    if let Some(value) = record.kwargs().and_then(|kwargs| kwargs.get(column_id)) {
        return DisplayCell::keyed(format_scalar(value), column_id);
    }

    let value = resolve(record, column_id);
    match column_id {
        "plan" => {
            let name = value
                .filter(|v| is_truthy(v))
                .or_else(|| record.get("name"))
                .map(format_scalar)
                .unwrap_or_else(|| "Unknown".to_string());
            DisplayCell::keyed(name, column_id)
        }
        "status" | "state" => DisplayCell::keyed(status_text(record, state), column_id),
        "scan_ids" => {
            let scan_ids = record
                .get("result")
                .and_then(|result| result.get("scan_ids"))
                .and_then(Value::as_array)
                .map(|ids| format_sequence(ids))
                .unwrap_or_default();
            DisplayCell::keyed(scan_ids, column_id)
        }
        "uid" | "item_uid" => {
            DisplayCell::keyed(record.uid().unwrap_or_default(), column_id)
        }
        "args" => {
            let args = value
                .or_else(|| record.get("args"))
                .and_then(Value::as_array)
                .map(|args| format_sequence(args))
                .unwrap_or_default();
            DisplayCell::keyed(args, column_id)
        }
        "kwargs" => {
            let kwargs = record.kwargs().map(format_mapping).unwrap_or_default();
            DisplayCell::unkeyed(kwargs)
        }
        _ => DisplayCell::keyed(value.map(format_any).unwrap_or_default(), column_id),
    }
}

fn status_text(record: &QueueRecord, state: RowState) -> String {
    let exit_status = record
        .get("result")
        .and_then(|result| result.get("exit_status"))
        .filter(|v| !v.is_null());
    if let Some(exit_status) = exit_status {
        return format_scalar(exit_status);
    }
    if let Some(status) = record.get("status").filter(|v| !v.is_null()) {
        return format_scalar(status);
    }
    match state {
        RowState::Running => "Running".to_string(),
        RowState::Pending => "Pending".to_string(),
        RowState::Completed => "completed".to_string(),
    }
}

pub(crate) fn format_any(value: &Value) -> String {
    match value {
        Value::Array(entries) => format_sequence(entries),
        Value::Object(map) => format_mapping(map),
        other => format_scalar(other),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde_json::json;

    fn record(value: Value) -> QueueRecord {
        QueueRecord::from_value(value)
    }

    fn width_aliases() -> AliasMap {
        AliasMap::new().with_column("width", ["width", "roi_width"])
    }

    #[test]
    fn resolves_across_record_shapes() {
        let shapes = [
            json!({"dwell": 5}),
            json!({"kwargs": {"dwell": 5}}),
            json!({"item": {"kwargs": {"dwell": 5}}}),
        ];
        for shape in shapes {
            let rec = record(shape);
            assert_eq!(resolve(&rec, "dwell"), Some(&json!(5)), "failed for {:?}", rec);
        }
    }

    #[test]
    fn resolves_dotted_keys_through_lists() {
        let rec = record(json!({
            "result": {"runs": [{"uid": "r1"}, {"scan_id": 7}]}
        }));
        assert_eq!(resolve(&rec, "runs.scan_id"), Some(&json!(7)));
        assert_eq!(resolve(&rec, "result.runs.uid"), Some(&json!("r1")));
        assert_eq!(resolve(&rec, "runs.missing"), None);
    }

    #[test]
    fn present_null_counts_as_found() {
        let rec = record(json!({"note": null, "kwargs": {"note": "hidden"}}));
        assert_eq!(resolve(&rec, "note"), Some(&Value::Null));
    }

    #[test]
    fn alias_lookup_finds_later_candidate() {
        let rec = record(json!({"kwargs": {"roi_width": 12}}));
        let found = lookup_alias_value("width", &rec, &width_aliases(), &HashSet::new());
        assert_eq!(
            found,
            Some(AliasMatch {
                value: Some(json!(12)),
                key: "roi_width".to_string()
            })
        );
    }

    #[test]
    fn alias_lookup_prefers_present_null_key() {
        let rec = record(json!({"kwargs": {"width": null, "roi_width": 3}}));
        let found = lookup_alias_value("width", &rec, &width_aliases(), &HashSet::new());
        assert_eq!(found.map(|m| (m.value, m.key)), Some((Some(Value::Null), "width".into())));
    }

    #[test]
    fn alias_lookup_checks_wrapped_kwargs_then_resolver() {
        let wrapped = record(json!({"item": {"kwargs": {"roi_width": 4}}}));
        let found = lookup_alias_value("width", &wrapped, &width_aliases(), &HashSet::new());
        assert_eq!(found.map(|m| m.key), Some("roi_width".to_string()));

        let metadata = record(json!({"metadata": {"width": 9}}));
        let found = lookup_alias_value("width", &metadata, &width_aliases(), &HashSet::new());
        assert_eq!(found.and_then(|m| m.value), Some(json!(9)));
    }

    #[test]
    fn alias_lookup_binds_declared_parameter_without_value() {
        let rec = record(json!({"kwargs": {}}));
        let params: HashSet<String> = ["roi_width".to_string()].into();
        let found = lookup_alias_value("width", &rec, &width_aliases(), &params);
        assert_eq!(
            found,
            Some(AliasMatch {
                value: None,
                key: "roi_width".to_string()
            })
        );
        assert_eq!(lookup_alias_value("width", &rec, &width_aliases(), &HashSet::new()), None);
    }

    #[test]
    fn display_status_prefers_exit_status() {
        let aliases = AliasMap::new();
        let params = HashSet::new();
        let done = record(json!({"status": "completed", "result": {"exit_status": "failed"}}));
        let cell = display_value("status", &done, 0, RowState::Completed, &aliases, &params);
        assert_eq!(cell.text, "failed");

        let running = record(json!({"name": "count"}));
        let cell = display_value("status", &running, 0, RowState::Running, &aliases, &params);
        assert_eq!(cell.text, "Running");
        let cell = display_value("status", &running, 1, RowState::Pending, &aliases, &params);
        assert_eq!(cell.text, "Pending");
    }

    #[test]
    fn display_formats_columns() {
        let aliases = width_aliases();
        let params = HashSet::new();
        let rec = record(json!({
            "item_uid": "u1",
            "name": "fly_scan",
            "args": ["det1", "motor"],
            "kwargs": {"roi_width": 12, "dets": ["a", "b"]},
            "result": {"scan_ids": [3, 4]}
        }));
        let cell = |column: &str| display_value(column, &rec, 2, RowState::Pending, &aliases, &params);

        assert_eq!(cell("index").text, "3");
        assert_eq!(cell("width"), DisplayCell::keyed("12", "roi_width"));
        assert_eq!(cell("name").text, "fly_scan");
        assert_eq!(cell("dets").text, "[\"a\",\"b\"]");
        assert_eq!(cell("scan_ids").text, "3, 4");
        assert_eq!(cell("uid").text, "u1");
        assert_eq!(cell("args").text, "det1, motor");
        assert_eq!(cell("kwargs").source_key, None);
        assert_eq!(cell("missing"), DisplayCell::keyed("", "missing"));
    }
}
