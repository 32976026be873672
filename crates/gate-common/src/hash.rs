//! Canonical content hashing
//!
//! Objects are hashed over a key-sorted JSON rendering, so field order never
//! affects the digest.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Rebuild a JSON value with every object's keys in sorted order
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of the canonical JSON rendering of `value`
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let value = serde_json::to_value(value).unwrap_or(Value::Null);
    let rendered = canonicalize(&value).to_string();
    hex::encode(Sha256::digest(rendered.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_independent() {
        let a: Value = serde_json::from_str(r#"{"id":"qemu/100","status":"running","node":"pve1"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"node":"pve1","id":"qemu/100","status":"running"}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_nested_order_independent() {
        let a = json!({ "outer": { "x": 1, "y": [ { "b": 2, "a": 1 } ] } });
        let b = json!({ "outer": { "y": [ { "a": 1, "b": 2 } ], "x": 1 } });
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_field_change_changes_hash() {
        let a = json!({ "id": "qemu/100", "status": "running" });
        let b = json!({ "id": "qemu/100", "status": "stopped" });
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = canonical_hash(&json!({}));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
