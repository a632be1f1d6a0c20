//! Column discovery for the queue table.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::record::QueueRecord;

/// Alias value that stays discoverable as its own kwargs column.
const RESERVED_ALIAS: &str = "title";

/// Leading columns present in every table.
const LEADING_COLUMNS: [(&str, &str); 3] =
    [("status", "Status"), ("name", "Plan"), ("scan_ids", "Scan ID")];

/// A display column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub id: String,
    pub label: String,
}

impl ColumnSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Ordered mapping from a logical column to the record keys that may hold it.
///
/// For example a `width` column may be satisfied by `width`, `roi_width` or
/// `scan_width`, tried in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasMap {
    entries: Vec<(String, Vec<String>)>,
}

impl AliasMap {
    /// Create an empty alias map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a column and its candidate keys.
    pub fn with_column<I, S>(mut self, column_id: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let column_id = column_id.into();
        let candidates: Vec<String> = candidates.into_iter().map(Into::into).collect();
        if candidates.is_empty() {
            return self;
        }
        match self.entries.iter_mut().find(|(id, _)| *id == column_id) {
            Some(entry) => entry.1 = candidates,
            None => self.entries.push((column_id, candidates)),
        }
        self
    }

    /// Build an alias map from loosely typed configuration.
    ///
    /// Each key may map to a single string or a list; non-string entries are
    /// ignored and keys left without candidates are dropped.
    pub fn from_value(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        map.iter().fold(Self::default(), |aliases, (key, values)| {
            let candidates: Vec<String> = match values {
                Value::String(single) => vec![single.clone()],
                Value::Array(many) => many
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            aliases.with_column(key.clone(), candidates)
        })
    }

    /// Candidate keys for a column, empty when the column is not aliased.
    pub fn candidates(&self, column_id: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(id, _)| id == column_id)
            .map(|(_, candidates)| candidates.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, column_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == column_id)
    }

    /// Aliased column ids in declared order.
    pub fn column_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    /// Every candidate key except the reserved `title`; kwargs keys in this
    /// set are not discovered as separate columns.
    pub fn claimed_keys(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .flat_map(|(_, candidates)| candidates.iter().map(String::as_str))
            .filter(|candidate| *candidate != RESERVED_ALIAS)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<'de> Deserialize<'de> for AliasMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Header label for an aliased column: `title` reads "Comments", anything else
/// goes through [`column_label`].
pub fn alias_label(column_id: &str) -> String {
    if column_id == RESERVED_ALIAS {
        return "Comments".to_string();
    }
    column_label(column_id)
}

/// Header label for a column id, title-cased with underscores as spaces.
pub fn column_label(column_id: &str) -> String {
    let mut label = String::with_capacity(column_id.len());
    let mut at_word_start = true;
    for ch in column_id.replace('_', " ").chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                label.extend(ch.to_uppercase());
            } else {
                label.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            label.push(ch);
            at_word_start = true;
        }
    }
    label
}

/// Append-only list of display columns.
///
/// Leading columns come first, then aliased columns in declared order, then
/// kwargs keys in first-seen order. Once a column is known it keeps its
/// position for the rest of the session, even if no record carries it anymore.
#[derive(Debug, Clone, Default)]
pub struct ColumnSchema {
    columns: Vec<ColumnSpec>,
}

impl ColumnSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn ids(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.id.as_str()).collect()
    }

    /// Merge the columns required by `records` into the schema.
    ///
    /// Returns `false` when the id list is unchanged, in which case the
    /// existing columns are left untouched.
    pub fn ensure_columns<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a QueueRecord>,
        aliases: &AliasMap,
    ) -> bool {
        let known: HashSet<String> = self.columns.iter().map(|c| c.id.clone()).collect();
        let discovered: Vec<ColumnSpec> = discover(records, aliases)
            .into_iter()
            .filter(|spec| !known.contains(&spec.id))
            .collect();

        if discovered.is_empty() {
            return false;
        }
        self.columns.extend(discovered);
        true
    }
}

fn discover<'a>(
    records: impl IntoIterator<Item = &'a QueueRecord>,
    aliases: &AliasMap,
) -> Vec<ColumnSpec> {
    let mut required = Vec::new();
    let mut seen = HashSet::new();
    let mut add = |id: &str, label: String| {
        if !id.is_empty() && seen.insert(id.to_string()) {
            required.push(ColumnSpec::new(id, label));
        }
    };

    for (id, label) in LEADING_COLUMNS {
        add(id, label.to_string());
    }
    for id in aliases.column_ids() {
        add(id, alias_label(id));
    }

    let claimed = aliases.claimed_keys();
    for record in records {
        for kwargs in [record.kwargs(), record.nested_kwargs()].into_iter().flatten() {
            for key in kwargs.keys() {
                if claimed.contains(key.as_str()) {
                    continue;
                }
                add(key, column_label(key));
            }
        }
    }

    required
}
