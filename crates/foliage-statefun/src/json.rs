// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dotted-path helpers over `serde_json::Value`.

use serde_json::{Map, Value};

/// Read a value at a dotted path. Returns `None` when any segment is
/// missing or traverses a non-object.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects. A
/// non-object on the way is replaced by an object.
pub fn set_by_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at a dotted path, if present.
pub fn remove_by_path(target: &mut Value, path: &str) {
    let Some((parent_path, leaf)) = path.rsplit_once('.') else {
        if let Some(map) = target.as_object_mut() {
            map.remove(path);
        }
        return;
    };
    let mut current = target;
    for segment in parent_path.split('.') {
        match current.as_object_mut().and_then(|m| m.get_mut(segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(leaf);
    }
}

/// String at a dotted path, with a default.
pub fn string_at<'a>(value: &'a Value, path: &str, default: &'a str) -> &'a str {
    get_by_path(value, path)
        .and_then(Value::as_str)
        .unwrap_or(default)
}

/// Recursive merge: objects merge key-wise, anything else is replaced by
/// the patch value.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_and_set_nested() {
        let mut value = json!({});
        set_by_path(&mut value, "link_body.tags", json!(["t1"]));
        set_by_path(&mut value, "link_body.link_type", json!("owns"));
        assert_eq!(get_by_path(&value, "link_body.link_type"), Some(&json!("owns")));
        assert_eq!(get_by_path(&value, "link_body.tags"), Some(&json!(["t1"])));
        assert!(get_by_path(&value, "link_body.absent").is_none());
        assert!(get_by_path(&value, "link_body.tags.deeper").is_none());
    }

    #[test]
    fn set_replaces_scalar_on_the_way() {
        let mut value = json!({"a": 1});
        set_by_path(&mut value, "a.b", json!(2));
        assert_eq!(value, json!({"a": {"b": 2}}));
    }

    #[test]
    fn remove_nested() {
        let mut value = json!({"a": {"b": 1, "c": 2}});
        remove_by_path(&mut value, "a.b");
        assert_eq!(value, json!({"a": {"c": 2}}));
        remove_by_path(&mut value, "a");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn deep_merge_objects() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "keep": true});
        deep_merge(&mut target, &json!({"a": {"y": 3, "z": 4}, "new": "v"}));
        assert_eq!(
            target,
            json!({"a": {"x": 1, "y": 3, "z": 4}, "keep": true, "new": "v"})
        );
    }

    #[test]
    fn deep_merge_replaces_non_objects() {
        let mut target = json!({"a": [1, 2]});
        deep_merge(&mut target, &json!({"a": [3]}));
        assert_eq!(target, json!({"a": [3]}));
    }
}
