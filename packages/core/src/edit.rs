//! In-place record edits and update payloads.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::columns::AliasMap;
use crate::parameter::{CoercionError, PlanDefinition};
use crate::record::{QueueRecord, ensure_kwargs, format_scalar};
use crate::resolver::{format_any, resolve};

/// Nested containers an edit may land in when the key is not found higher up.
const NESTED_CONTAINERS: [&str; 3] = ["item", "metadata", "result"];

/// A row field whose text could not be coerced into the payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {source}")]
pub struct PayloadError {
    pub field: String,
    #[source]
    pub source: CoercionError,
}

/// What an edit needs to know besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct EditContext<'a> {
    pub definition: Option<&'a PlanDefinition>,
    pub aliases: &'a AliasMap,
}

impl<'a> EditContext<'a> {
    pub fn new(definition: Option<&'a PlanDefinition>, aliases: &'a AliasMap) -> Self {
        Self { definition, aliases }
    }

    /// Coerce text for `key` through the plan's parameters; keys the plan does
    /// not declare keep the text verbatim.
    pub fn coerce(&self, key: &str, text: &str) -> Result<Value, CoercionError> {
        match self.definition {
            Some(definition) => definition.coerce_for_key(key, text),
            None => Ok(Value::String(text.to_string())),
        }
    }
}

/// Write edited text into a record.
///
/// The first matching location wins: a top-level key, an existing `kwargs`
/// key, another candidate of the key's alias chain (falling back to creating
/// the first candidate in `kwargs`), a key inside the nested `item`,
/// `metadata` or `result` containers, and finally a new `kwargs` entry.
///
/// A coercion failure leaves the record untouched.
pub fn apply_item_edit(
    record: &mut QueueRecord,
    key: &str,
    text: &str,
    ctx: &EditContext<'_>,
) -> Result<(), CoercionError> {
    apply_to(record.as_map_mut(), key, text, ctx, true)?;
    Ok(())
}

fn apply_to(
    map: &mut Map<String, Value>,
    key: &str,
    text: &str,
    ctx: &EditContext<'_>,
    top_level: bool,
) -> Result<bool, CoercionError> {
    if map.contains_key(key) {
        map.insert(key.to_string(), ctx.coerce(key, text)?);
        return Ok(true);
    }

    if let Some(Value::Object(kwargs)) = map.get_mut("kwargs")
        && kwargs.contains_key(key)
    {
        kwargs.insert(key.to_string(), ctx.coerce(key, text)?);
        return Ok(true);
    }

    if !top_level {
        return Ok(false);
    }

    let candidates = ctx.aliases.candidates(key);
    if let Some(first) = candidates.first() {
        for alias in candidates.iter().filter(|alias| alias.as_str() != key) {
            if apply_to(map, alias, text, ctx, false)? {
                return Ok(true);
            }
        }
        let value = ctx.coerce(first, text)?;
        ensure_kwargs(map).insert(first.clone(), value);
        return Ok(true);
    }

    for container in NESTED_CONTAINERS {
        if let Some(Value::Object(nested)) = map.get_mut(container)
            && apply_to(nested, key, text, ctx, false)?
        {
            return Ok(true);
        }
    }

    let value = ctx.coerce(key, text)?;
    ensure_kwargs(map).insert(key.to_string(), value);
    Ok(true)
}

/// Build the `updateItem` payload for an edited row.
///
/// Starts from a clone of the raw record and folds every row field into its
/// `kwargs`: blank text removes the key, text matching the current value
/// keeps the typed value, anything else is coerced and written.
pub fn build_update_payload(
    raw: &QueueRecord,
    row_values: &[(String, String)],
    exclude: &[&str],
    definition: Option<&PlanDefinition>,
) -> Result<QueueRecord, PayloadError> {
    let mut payload = raw.clone();
    let mut updates = Vec::new();
    let mut removals = Vec::new();

    for (key, text) in row_values {
        if exclude.contains(&key.as_str()) {
            continue;
        }
        if text.trim().is_empty() {
            removals.push(key.as_str());
            continue;
        }
        if let Some(current) = resolve(raw, key)
            && (format_scalar(current) == *text || format_any(current) == *text)
        {
            continue;
        }
        let value = match definition {
            Some(definition) => definition.coerce_for_key(key, text),
            None => Ok(Value::String(text.clone())),
        }
        .map_err(|source| PayloadError {
            field: key.clone(),
            source,
        })?;
        updates.push((key.clone(), value));
    }

    let kwargs = payload.ensure_kwargs();
    for key in removals {
        kwargs.shift_remove(key);
    }
    kwargs.extend(updates);

    Ok(payload)
}
