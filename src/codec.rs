//! Canonical JSON codec: the sole input to every identity hash in this
//! crate. Object keys are sorted lexicographically, there is no
//! insignificant whitespace, and absent/`Null`-from-`#[serde(skip...)]`
//! keys are simply never inserted by callers — `serde_json::Value`
//! already has no concept of "undefined".

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Recursively sort object keys, leaving arrays and scalars untouched.
/// Numbers are passed through `serde_json::Value` unchanged, which
/// preserves them losslessly (no float reformatting).
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize a value to canonical JSON: sorted keys, no whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).expect("value must serialize to JSON");
    serde_json::to_string(&canonicalize(&v)).expect("canonical value must serialize")
}

/// Serialize an already-constructed `serde_json::Value` to canonical JSON.
pub fn canonicalize_value(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).expect("canonical value must serialize")
}

/// sha256_hex(canonical(x)) — the sole identity-hash primitive used
/// throughout the engine (trees, commits, artifacts, task results).
pub fn sha256_hex_of<T: Serialize>(value: &T) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Raw SHA-256 hex digest of arbitrary bytes (used for blob/chunk content
/// hashes, which are not JSON).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The fixed UUIDv5 namespace this engine uses for deterministic
/// identifiers (task ids). See design notes: load-bearing constant, never
/// changes.
pub const UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// Deterministic UUIDv5 over arbitrary bytes, in the engine's fixed
/// namespace.
pub fn uuid5(name: &str) -> Uuid {
    Uuid::new_v5(&UUID_NAMESPACE, name.as_bytes())
}

/// Lower 63 bits of a SHA-256 digest, used for deterministic FTS rowids
/// (kept non-negative so it fits SQLite's signed 64-bit `INTEGER PRIMARY
/// KEY` without sign ambiguity).
pub fn lower63_bits(bytes: &[u8]) -> i64 {
    let digest = Sha256::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[0..8]);
    (i64::from_be_bytes(buf)) & 0x7fff_ffff_ffff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 2, "a": 1, "c": {"z": 1, "y": 2}});
        assert_eq!(
            canonicalize_value(&v),
            r#"{"a":1,"b":2,"c":{"y":2,"z":1}}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v = json!({"a": [1, 2, 3]});
        let s = canonicalize_value(&v);
        assert!(!s.contains(' '));
    }

    #[test]
    fn arrays_preserve_order() {
        let v = json!({"xs": [3, 1, 2]});
        assert_eq!(canonicalize_value(&v), r#"{"xs":[3,1,2]}"#);
    }

    #[test]
    fn hash_is_deterministic_regardless_of_input_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(sha256_hex_of(&a), sha256_hex_of(&b));
    }

    #[test]
    fn sha256_hex_len_is_64() {
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }

    #[test]
    fn uuid5_is_deterministic() {
        assert_eq!(uuid5("same-input"), uuid5("same-input"));
        assert_ne!(uuid5("a"), uuid5("b"));
    }

    #[test]
    fn lower63_is_never_negative() {
        for i in 0..50 {
            let v = lower63_bits(format!("item-{i}").as_bytes());
            assert!(v >= 0);
        }
    }
}
