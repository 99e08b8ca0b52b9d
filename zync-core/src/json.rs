//! Canonical JSON serialization and IEEE-754 safety checks.
//!
//! Row keys are persisted and compared as canonical JSON: object keys in
//! ascending byte order, compact separators, no non-finite numbers. Two
//! keys are equal iff their canonical strings are byte-equal, which keeps
//! comparisons free of floating point surprises.

use serde_json::{Map, Value};
use thiserror::Error;

/// Largest integer magnitude that survives a round-trip through an IEEE-754
/// double, i.e. `2^53 - 1`. Values beyond this cannot be handed to JSON
/// clients without silent truncation.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum JsonError {
    #[error("value of `{0}` exceeds the safe Number range: {1}")]
    UnsafeInteger(String, String),
    #[error("row keys must be JSON objects, got: {0}")]
    NotAnObject(String),
    #[error("failed to serialize value: {0}")]
    Serialize(String),
}

/// Serializes a JSON object map to its canonical string form.
///
/// `serde_json`'s default map representation is ordered by key, so a
/// compact serialization of the map is already canonical. Nested objects
/// inherit the same ordering.
pub fn canonical_string(map: &Map<String, Value>) -> Result<String, JsonError> {
    serde_json::to_string(&Value::Object(map.clone()))
        .map_err(|e| JsonError::Serialize(e.to_string()))
}

/// Checks that every integer reachable from `value` fits into the safe
/// Number range. `path` names the value in error messages.
///
/// 64-bit counters (e.g. mutation ids) routinely live near the top of the
/// i64 range; those must surface as errors rather than reach a client that
/// would silently round them.
pub fn ensure_safe_integers(path: &str, value: &Value) -> Result<(), JsonError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
                    return Err(JsonError::UnsafeInteger(path.to_string(), i.to_string()));
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INTEGER as u64 {
                    return Err(JsonError::UnsafeInteger(path.to_string(), u.to_string()));
                }
            } else if let Some(f) = n.as_f64() {
                // Whole-number literals beyond u64 are f64-backed; at
                // this magnitude a client-side Number cannot hold the
                // value without truncation.
                if f.abs() > MAX_SAFE_INTEGER as f64 {
                    return Err(JsonError::UnsafeInteger(path.to_string(), n.to_string()));
                }
            }
            Ok(())
        }
        Value::Array(values) => {
            for (i, v) in values.iter().enumerate() {
                ensure_safe_integers(&format!("{path}[{i}]"), v)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (k, v) in map {
                ensure_safe_integers(&format!("{path}.{k}"), v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Resolves a dotted path against a JSON value, returning `Null` for any
/// missing segment. Auth-data references in permission rules are tracked
/// as paths and resolved here at bind time.
pub fn resolve_path<'a>(value: &'a Value, path: &[String]) -> &'a Value {
    let mut current = value;
    for segment in path {
        match current {
            Value::Object(map) => {
                current = map.get(segment).unwrap_or(&Value::Null);
            }
            _ => return &Value::Null,
        }
    }
    current
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_canonical_string_orders_keys() {
        let v = json!({"zeta": 1, "alpha": {"nested_b": true, "nested_a": null}});
        let map = v.as_object().unwrap();
        assert_eq!(
            canonical_string(map).unwrap(),
            r#"{"alpha":{"nested_a":null,"nested_b":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_string_distinguishes_float_and_int() {
        let a = json!({"k": 1});
        let b = json!({"k": 1.0});
        assert_ne!(
            canonical_string(a.as_object().unwrap()).unwrap(),
            canonical_string(b.as_object().unwrap()).unwrap(),
        );
    }

    #[test]
    fn test_safe_integers_ok() {
        let v = json!({"id": "u1", "count": MAX_SAFE_INTEGER, "neg": -MAX_SAFE_INTEGER});
        ensure_safe_integers("row", &v).unwrap();
    }

    #[test]
    fn test_safe_integers_rejects_large_i64() {
        let v = json!({"last_mutation_id": MAX_SAFE_INTEGER + 1});
        let err = ensure_safe_integers("row", &v).unwrap_err();
        assert!(matches!(err, JsonError::UnsafeInteger(path, _) if path == "row.last_mutation_id"));
    }

    #[test]
    fn test_safe_integers_rejects_large_u64() {
        let v = json!([u64::MAX]);
        let err = ensure_safe_integers("lmids", &v).unwrap_err();
        assert!(matches!(err, JsonError::UnsafeInteger(path, _) if path == "lmids[0]"));
    }

    #[test]
    fn test_safe_integers_rejects_literals_beyond_u64() {
        // Parses as f64: larger than u64 can hold.
        let v: Value =
            serde_json::from_str(r#"{"last_mutation_id": 98371234123423412341238}"#).unwrap();
        let err = ensure_safe_integers("row", &v).unwrap_err();
        assert!(
            matches!(err, JsonError::UnsafeInteger(path, _) if path == "row.last_mutation_id")
        );
    }

    #[test]
    fn test_safe_integers_allows_ordinary_floats() {
        ensure_safe_integers("row", &json!({"score": 1.5, "ratio": -0.25})).unwrap();
    }

    #[test]
    fn test_resolve_path() {
        let v = json!({"properties": {"role": "admin"}});
        let path = vec!["properties".to_string(), "role".to_string()];
        assert_eq!(resolve_path(&v, &path), &json!("admin"));
        let missing = vec!["properties".to_string(), "missing".to_string()];
        assert_eq!(resolve_path(&v, &missing), &Value::Null);
    }
}
