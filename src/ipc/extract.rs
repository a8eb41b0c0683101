//! Tolerant lookup of a boolean state flag in an editor reply.
//!
//! The editor has moved its state fields around between package versions:
//! `isPlaying` may sit at the top level, under `state`, under `result.state`,
//! or in an attached `_editorState`. Callers name the flag and let the search
//! find it instead of hard-coding a path.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

/// Nesting depth beyond which the search gives up.
const MAX_DEPTH: usize = 32;

/// Find the shallowest object that holds `field` as a boolean.
///
/// The search is breadth-first. At each level the reply's own fields are
/// searched before attached metadata (keys starting with `_`), so a
/// handler's `state` wins over the envelope's `_editorState` copy.
pub fn find_flag_container<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    let mut queue = VecDeque::from([(value, 0usize)]);
    let mut visited: HashSet<*const Value> = HashSet::new();

    while let Some((node, depth)) = queue.pop_front() {
        if !visited.insert(node as *const Value) {
            continue;
        }

        let children: Vec<(&str, &Value)> = match node {
            Value::Object(fields) => {
                if matches!(fields.get(field), Some(Value::Bool(_))) {
                    return Some(node);
                }
                fields.iter().map(|(k, v)| (k.as_str(), v)).collect()
            }
            Value::Array(items) => items.iter().map(|v| ("", v)).collect(),
            _ => continue,
        };

        if depth >= MAX_DEPTH {
            continue;
        }

        let (metadata, own): (Vec<(&str, &Value)>, Vec<(&str, &Value)>) = children
            .into_iter()
            .filter(|(_, v)| v.is_object() || v.is_array())
            .partition(|(k, _)| k.starts_with('_'));
        for (_, child) in own.into_iter().chain(metadata) {
            queue.push_back((child, depth + 1));
        }
    }

    None
}

/// Read `field` from wherever it lives in the reply.
pub fn read_flag(value: &Value, field: &str) -> Option<bool> {
    find_flag_container(value, field)?.get(field)?.as_bool()
}
