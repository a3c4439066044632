//! jq expression evaluation via `jaq`.
//!
//! Single-expression, first-output-wins semantics (§4.G): a jq filter can
//! yield zero, one, or many outputs for a given input; we only ever want
//! the first, with `null` treated by the caller as "skip this entry".

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, RcIter};
use jaq_json::Val;
use nimbus_core::{EngineError, EngineResult, Value};

/// Evaluates `expression` against `value`, returning the first output (or
/// `None` if the filter produces no outputs at all).
pub fn eval_first(expression: &str, value: &Value) -> EngineResult<Option<Value>> {
    let program = File { code: expression, path: () };
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();

    let modules = loader
        .load(&arena, program)
        .map_err(|errs| EngineError::invalid(format!("invalid jq expression: {errs:?}")))?;

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| EngineError::invalid(format!("jq compile error: {errs:?}")))?;

    let inputs = RcIter::new(core::iter::empty());
    let input = Val::from(value.to_json());

    let mut outputs = filter.run((Ctx::new([], &inputs), input));
    match outputs.next() {
        Some(Ok(val)) => {
            let json: serde_json::Value = val.into();
            Ok(Some(Value::from_json(json)))
        }
        Some(Err(err)) => Err(EngineError::invalid(format!("jq evaluation error: {err}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_returns_input_unchanged() {
        let value = Value::from_json(serde_json::json!({"a": 1}));
        let result = eval_first(".", &value).unwrap().unwrap();
        assert_eq!(result, value);
    }

    #[test]
    fn field_assignment_computes_total() {
        let value = Value::from_json(serde_json::json!({"price": 2, "qty": 3}));
        let result = eval_first(".total = .price * .qty", &value).unwrap().unwrap();
        assert_eq!(result.to_json()["total"], serde_json::json!(6));
    }

    #[test]
    fn null_output_is_some_null_not_none() {
        let value = Value::from_json(serde_json::json!({}));
        let result = eval_first("null", &value).unwrap();
        assert_eq!(result, Some(Value::Null));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let value = Value::Null;
        assert!(eval_first("{{{not jq", &value).is_err());
    }
}
