//! Canonical JSON
//!
//! Hash inputs must serialize identically on every platform and every run.
//! Object keys are emitted in sorted order at every depth, with no
//! insignificant whitespace.

use serde_json::{Map, Value};

/// Return a copy of `value` with every object's keys sorted.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact, key-sorted JSON text for `value`.
pub fn to_canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_keys_sorted() {
        let value = json!({
            "zeta": 1,
            "alpha": { "y": true, "b": [ { "k2": 2, "k1": 1 } ] }
        });

        assert_eq!(
            to_canonical_string(&value),
            r#"{"alpha":{"b":[{"k1":1,"k2":2}],"y":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let a = json!({ "a": 1, "b": 2 });
        let mut map = Map::new();
        map.insert("b".to_string(), json!(2));
        map.insert("a".to_string(), json!(1));
        let b = Value::Object(map);

        assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn test_scalars_untouched() {
        assert_eq!(to_canonical_string(&json!("text")), "\"text\"");
        assert_eq!(to_canonical_string(&json!(null)), "null");
    }
}
