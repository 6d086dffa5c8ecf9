//! Change detection between successive extraction samples.
//!
//! A recursive structural diff produces dotted field paths; the restock
//! heuristic fires when a roasting date moves strictly forward in time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const ROASTING_DATE_FIELD: &str = "roastingDate";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub changed: bool,
    pub changed_fields: Vec<String>,
    pub is_restock: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub path: String,
    pub kind: ChangeKind,
    pub previous: Value,
    pub current: Value,
}

/// Compare two extraction samples. `changed_fields` is symmetric: diffing
/// `(a, b)` and `(b, a)` yields the same path set.
pub fn has_changed(previous: &Value, current: &Value) -> ChangeSummary {
    let mut changed_fields = Vec::new();
    diff_value("", previous, current, &mut changed_fields);
    changed_fields.sort();
    changed_fields.dedup();

    let is_restock = changed_fields.iter().any(|path| path == ROASTING_DATE_FIELD)
        && roasting_date_advanced(previous, current);

    ChangeSummary {
        changed: !changed_fields.is_empty(),
        changed_fields,
        is_restock,
        detected_at: Utc::now(),
    }
}

/// Classify every change as added, removed, or modified.
pub fn change_details(previous: &Value, current: &Value) -> Vec<FieldChange> {
    let summary = has_changed(previous, current);
    summary
        .changed_fields
        .into_iter()
        .map(|path| {
            let old = value_at(previous, &path);
            let new = value_at(current, &path);
            let kind = match (&old, &new) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                _ => ChangeKind::Modified,
            };
            FieldChange {
                path,
                kind,
                previous: old.cloned().unwrap_or(Value::Null),
                current: new.cloned().unwrap_or(Value::Null),
            }
        })
        .collect()
}

/// Serialize change details for the append-only change record.
pub fn change_details_json(previous: &Value, current: &Value) -> Value {
    let details = change_details(previous, current);
    json!(details)
}

fn diff_value(prefix: &str, previous: &Value, current: &Value, out: &mut Vec<String>) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            let mut keys: Vec<&String> = prev_map.keys().chain(curr_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = join_path(prefix, key);
                match (prev_map.get(key), curr_map.get(key)) {
                    (Some(a), Some(b)) => diff_value(&path, a, b, out),
                    (None, Some(_)) | (Some(_), None) => out.push(path),
                    (None, None) => unreachable!(),
                }
            }
        }
        // Arrays compare by value; a single differing element flags the path.
        (a, b) => {
            if a != b {
                if prefix.is_empty() {
                    out.push("$".to_string());
                } else {
                    out.push(prefix.to_string());
                }
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

// Lexicographic comparison is correct for YYYY-MM-DD.
fn roasting_date_advanced(previous: &Value, current: &Value) -> bool {
    match (
        previous.get(ROASTING_DATE_FIELD).and_then(Value::as_str),
        current.get(ROASTING_DATE_FIELD).and_then(Value::as_str),
    ) {
        (Some(old), Some(new)) => old < new,
        _ => false,
    }
}
