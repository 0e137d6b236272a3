//! Filter canonicalization and containment matching.
//!
//! Subscriptions are keyed by `(item name, filter key)`, where the filter
//! key is a canonical serialization of the caller-supplied filter value:
//! object keys are sorted recursively so `{a:1,b:2}` and `{b:2,a:1}` land
//! on the same registry entry.
//!
//! Trigger matching uses an asymmetric containment rule ("does this trigger
//! affect this subscription"), not general equality; see
//! [`filter_contains`].

use serde_json::{Map, Value};

/// Canonical string form of a filter value, usable as a registry key.
pub(crate) fn filter_key(filter: &Value) -> String {
    canonicalize(filter).to_string()
}

/// Canonical cache key for an invocation: item name plus canonicalized
/// positional parameters.
pub(crate) fn invocation_key(name: &str, params: &[Value]) -> String {
    let canon: Vec<Value> = params.iter().map(canonicalize).collect();
    format!("{name}?{}", Value::Array(canon))
}

/// Rebuild a value with every object's keys sorted, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));

            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Does a trigger scoped by `trigger_filter` affect a subscription whose
/// filter is `subscription_filter`?
///
/// For every key present in the subscription filter, the trigger filter
/// must either lack that key or hold an equal value (array values compare
/// by content). A missing (`null`) filter on either side always matches
/// (wildcard semantics). Non-object filters match on plain equality.
pub(crate) fn filter_contains(subscription_filter: &Value, trigger_filter: &Value) -> bool {
    if subscription_filter.is_null() || trigger_filter.is_null() {
        return true;
    }

    match (subscription_filter, trigger_filter) {
        (Value::Object(sub), Value::Object(trig)) => sub.iter().all(|(key, sub_val)| {
            match trig.get(key) {
                // Key absent from the trigger: the trigger is broader than
                // this subscription dimension, so it still applies.
                None => true,
                Some(trig_val) => sub_val == trig_val,
            }
        }),
        (sub, trig) => sub == trig,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_order_insensitive() {
        // ---
        let a = json!({"user": "u1", "done": true});
        let b = json!({"done": true, "user": "u1"});
        assert_eq!(filter_key(&a), filter_key(&b));
    }

    #[test]
    fn test_key_sorts_nested_objects() {
        // ---
        let a = json!({"outer": {"b": 2, "a": 1}});
        let b = json!({"outer": {"a": 1, "b": 2}});
        assert_eq!(filter_key(&a), filter_key(&b));
        assert_ne!(filter_key(&a), filter_key(&json!({"outer": {"a": 1}})));
    }

    #[test]
    fn test_null_filters_are_wildcards() {
        // ---
        assert!(filter_contains(&Value::Null, &json!({"k": 1})));
        assert!(filter_contains(&json!({"k": 1}), &Value::Null));
        assert!(filter_contains(&Value::Null, &Value::Null));
    }

    #[test]
    fn test_containment_by_key() {
        // ---
        let sub = json!({"user": "u1"});

        // Trigger lacking the key affects the subscription.
        assert!(filter_contains(&sub, &json!({"other": 5})));
        // Equal value matches.
        assert!(filter_contains(&sub, &json!({"user": "u1"})));
        // Differing value does not.
        assert!(!filter_contains(&sub, &json!({"user": "u2"})));
    }

    #[test]
    fn test_containment_is_asymmetric() {
        // ---
        let sub = json!({"user": "u1", "done": true});
        let trig = json!({"user": "u1"});

        // Trigger narrows only `user`; the subscription's extra key is
        // irrelevant to whether the trigger affects it.
        assert!(filter_contains(&sub, &trig));
        // The reverse direction compares `done` against a missing key.
        assert!(filter_contains(&trig, &sub));
        // But a conflicting shared key fails in both directions.
        assert!(!filter_contains(&json!({"user": "u2"}), &trig));
    }

    #[test]
    fn test_array_values_compare_by_content() {
        // ---
        let sub = json!({"tags": ["a", "b"]});
        assert!(filter_contains(&sub, &json!({"tags": ["a", "b"]})));
        assert!(!filter_contains(&sub, &json!({"tags": ["b", "a"]})));
    }

    #[test]
    fn test_invocation_key_distinguishes_params() {
        // ---
        let k1 = invocation_key("math/add", &[json!(2), json!(3)]);
        let k2 = invocation_key("math/add", &[json!(2), json!(4)]);
        let k3 = invocation_key("math/add", &[json!(2), json!(3)]);
        assert_ne!(k1, k2);
        assert_eq!(k1, k3);
    }
}
