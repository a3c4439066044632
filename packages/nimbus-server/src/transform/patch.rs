//! RFC 6902 JSON Patch application.

use nimbus_core::{EngineError, EngineResult, Value};

/// Parses a caller-supplied patch document (a JSON array of operations) and
/// applies it to `value`, returning the patched result. `value` is left
/// untouched on error.
pub fn apply_patch(value: &Value, ops: &serde_json::Value) -> EngineResult<Value> {
    let patch: json_patch::Patch =
        serde_json::from_value(ops.clone()).map_err(|e| EngineError::invalid(format!("invalid JSON patch: {e}")))?;

    let mut doc = value.to_json();
    json_patch::patch(&mut doc, &patch).map_err(|e| EngineError::invalid(format!("patch application failed: {e}")))?;
    Ok(Value::from_json(doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_updates_existing_field() {
        let value = Value::from_json(serde_json::json!({"total": 0}));
        let ops = serde_json::json!([{"op": "replace", "path": "/total", "value": 6}]);
        let patched = apply_patch(&value, &ops).unwrap();
        assert_eq!(patched.to_json(), serde_json::json!({"total": 6}));
    }

    #[test]
    fn add_introduces_new_field() {
        let value = Value::from_json(serde_json::json!({"a": 1}));
        let ops = serde_json::json!([{"op": "add", "path": "/b", "value": 2}]);
        let patched = apply_patch(&value, &ops).unwrap();
        assert_eq!(patched.to_json(), serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_op_failure_aborts_patch() {
        let value = Value::from_json(serde_json::json!({"a": 1}));
        let ops = serde_json::json!([
            {"op": "test", "path": "/a", "value": 2},
            {"op": "add", "path": "/b", "value": 3},
        ]);
        assert!(apply_patch(&value, &ops).is_err());
    }

    #[test]
    fn malformed_patch_document_is_invalid() {
        let value = Value::from_json(serde_json::json!({}));
        let ops = serde_json::json!([{"op": "bogus"}]);
        assert!(apply_patch(&value, &ops).is_err());
    }
}
