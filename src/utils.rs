use serde_json::Value;
use std::collections::BTreeMap;

/// Fills every field missing or empty in `target` with the value from `defaults`.
/// Values already set in `target` win. Objects are merged recursively, arrays are
/// taken as a whole.
pub fn merge_missing(target: &mut Value, defaults: &Value) {
    match (target, defaults) {
        (Value::Object(target), Value::Object(defaults)) => {
            for (key, default) in defaults {
                if target.get(key).map_or(true, is_empty) {
                    target.insert(key.clone(), default.clone());
                } else if let Some(value) = target.get_mut(key) {
                    merge_missing(value, default);
                }
            }
        }
        (target, defaults) => {
            if is_empty(target) {
                *target = defaults.clone();
            }
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Returns `first` extended with every entry of `second`, `second` wins on conflict.
pub fn extend_map(
    first: Option<&BTreeMap<String, String>>,
    second: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut map = first.cloned().unwrap_or_default();
    map.extend(second.iter().map(|(k, v)| (k.clone(), v.clone())));
    map
}
