//! Dynamic value model shared by the script runtime, jq transforms, and the
//! HTTP gateway's JSON surface.
//!
//! The storage engine itself only ever sees raw bytes (see
//! [`StorageBytes`]); `Value` exists at the boundary where those bytes are
//! interpreted as structured data. Conversion between the two is always
//! explicit JSON encode/decode, never implicit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

/// Dynamic, JSON-compatible value.
///
/// `Object` uses a `BTreeMap` rather than a hash map so that serialized
/// output (and therefore things like cache keys or digests over a value)
/// is deterministic regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Whether the value is truthy under the script/jq filter convention:
    /// everything is truthy except `Null`, `Bool(false)`, and numeric zero.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    /// Parses raw storage bytes as JSON into a `Value`.
    ///
    /// Returns `None` if the bytes are not valid JSON -- callers that need
    /// to fall back to treating the value as an opaque string should do so
    /// explicitly rather than relying on a default here.
    #[must_use]
    pub fn from_json_bytes(bytes: &[u8]) -> Option<Value> {
        serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .map(Value::from_json)
    }

    /// Serializes the value as JSON bytes, suitable for writing back to the
    /// storage engine.
    #[must_use]
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_json()).unwrap_or_default()
    }

    /// Converts from `serde_json::Value`, the representation used at the
    /// HTTP gateway and by the jq/script runtimes.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to `serde_json::Value`. `Bytes` has no native JSON
    /// representation, so it is base64-encoded as a string -- this is only
    /// ever used for display/interop, never round-tripped through storage.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn truthy_matches_script_convention() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(1).is_truthy());
        assert!(Value::String(String::new()).is_truthy());
    }

    #[test]
    fn json_roundtrip_object() {
        let json = serde_json::json!({"active": true, "count": 3, "name": "x"});
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn bytes_survive_storage_roundtrip() {
        let original = Value::Object(BTreeMap::from([
            ("tag".to_string(), Value::String("a".to_string())),
            ("n".to_string(), Value::Int(-7)),
        ]));
        let bytes = original.to_json_bytes();
        let decoded = Value::from_json_bytes(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn invalid_json_bytes_yield_none() {
        assert!(Value::from_json_bytes(b"not json").is_none());
    }

    fn arb_value(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1e6..1e6).prop_map(Value::Float),
            ".*".prop_map(Value::String),
        ];
        if depth == 0 {
            leaf.boxed()
        } else {
            leaf.prop_recursive(depth, 16, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map(".*", inner, 0..4).prop_map(Value::Object),
                ]
            })
            .boxed()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn json_roundtrip_is_lossless(value in arb_value(3)) {
            let bytes = value.to_json_bytes();
            let decoded = Value::from_json_bytes(&bytes).unwrap();
            prop_assert_eq!(value, decoded);
        }
    }
}
