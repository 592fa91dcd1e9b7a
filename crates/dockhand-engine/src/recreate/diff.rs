//! Structural diff of two inspect results, logged after a recreation so an
//! operator can see exactly what the runtime changed. Informational only.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    /// Dotted path into the inspect document, array indices in brackets.
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// Top-level fields that differ between any two containers by construction
/// and would only add noise to the report.
const VOLATILE_FIELDS: &[&str] = &[
    "Id",
    "Created",
    "State",
    "ResolvConfPath",
    "HostnamePath",
    "HostsPath",
    "LogPath",
    "GraphDriver",
];

/// Deep-diffs two inspect documents, skipping the volatile runtime fields.
pub fn diff_inspects(old: &Value, new: &Value) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    diff_value(old, new, String::new(), &mut entries);
    entries.retain(|entry| {
        let top = entry.path.split(['.', '[']).next().unwrap_or_default();
        !VOLATILE_FIELDS.contains(&top)
    });
    entries
}

fn diff_value(old: &Value, new: &Value, path: String, entries: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, old_value) in old_map {
                let child = child_path(&path, key);
                match new_map.get(key) {
                    Some(new_value) => diff_value(old_value, new_value, child, entries),
                    None => entries.push(DiffEntry {
                        path: child,
                        old: old_value.clone(),
                        new: Value::Null,
                    }),
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    entries.push(DiffEntry {
                        path: child_path(&path, key),
                        old: Value::Null,
                        new: new_value.clone(),
                    });
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            let shared = old_items.len().min(new_items.len());
            for i in 0..shared {
                diff_value(&old_items[i], &new_items[i], format!("{path}[{i}]"), entries);
            }
            for (i, item) in old_items.iter().enumerate().skip(shared) {
                entries.push(DiffEntry {
                    path: format!("{path}[{i}]"),
                    old: item.clone(),
                    new: Value::Null,
                });
            }
            for (i, item) in new_items.iter().enumerate().skip(shared) {
                entries.push(DiffEntry {
                    path: format!("{path}[{i}]"),
                    old: Value::Null,
                    new: item.clone(),
                });
            }
        }
        _ => {
            if old != new {
                entries.push(DiffEntry {
                    path,
                    old: old.clone(),
                    new: new.clone(),
                });
            }
        }
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
