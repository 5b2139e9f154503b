//! JSON merge helpers for layered configuration.

use log::debug;
use serde_json::Value;

/// Deep-merge `overlay` into `base`: objects merge per key, anything else replaces.
pub(super) fn merge_json_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(existing) = base_map.get_mut(key) {
                    merge_json_values(existing, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Merge `overlay` into `base` without touching keys locked by `constraints`.
///
/// A non-object value in the constraints tree locks that key and everything
/// below it. Object values only lock the leaves they contain.
pub(super) fn merge_json_with_constraints(
    base: &mut Value,
    overlay: &Value,
    constraints: Option<&Value>,
) {
    let Some(constraints) = constraints else {
        merge_json_values(base, overlay);
        return;
    };
    let Value::Object(locked) = constraints else {
        return;
    };
    let (Value::Object(base_map), Value::Object(overlay_map)) = (base, overlay) else {
        // A locked subtree cannot be replaced by a scalar.
        return;
    };
    for (key, value) in overlay_map {
        let lock = locked.get(key);
        if lock.is_some_and(|lock| !lock.is_object()) {
            debug!("ignoring override of locked config key: {key}");
            continue;
        }
        if let Some(existing) = base_map.get_mut(key) {
            merge_json_with_constraints(existing, value, lock);
        } else {
            base_map.insert(key.clone(), value.clone());
        }
    }
}
