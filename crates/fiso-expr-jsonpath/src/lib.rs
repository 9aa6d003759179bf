//! JSONPath implementation of [`fiso_core::contracts::Expression`].
//!
//! Chosen so that override expressions in the event envelope (§4.7) can be
//! written the way the literal spec examples show them: `$.order_id`,
//! `$.data.user_id`, and so on.

use fiso_core::contracts::Expression;
use serde_json::Value;

/// A compiled JSONPath expression. Compilation is re-validated eagerly so
/// that a syntactically invalid path is rejected at `compile` time rather
/// than surfacing as an evaluate-time error.
#[derive(Debug, Clone)]
pub struct JsonPathProgram {
    path: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPathExpression;

impl Expression for JsonPathExpression {
    type Program = JsonPathProgram;

    /// A string is treated as an expression only if it starts with `$`
    /// (the JSONPath root) and actually compiles; anything else — plain
    /// text, malformed paths — downgrades silently to a literal by
    /// returning `None`.
    fn compile(&self, expr: &str) -> Option<Self::Program> {
        if !expr.starts_with('$') {
            return None;
        }
        jsonpath_lib::select(&Value::Object(Default::default()), expr)
            .ok()
            .map(|_| JsonPathProgram {
                path: expr.to_string(),
            })
    }

    /// Evaluates against `bindings` (the pre-transform payload the
    /// envelope builder passes as the root document). Returns the first
    /// match, or `Null` when the path matches nothing.
    fn evaluate(&self, program: &Self::Program, bindings: &Value) -> Value {
        match jsonpath_lib::select(bindings, &program.path) {
            Ok(matches) => matches.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_dollar_strings_are_literals() {
        let expr = JsonPathExpression;
        assert!(expr.compile("just-a-literal").is_none());
    }

    #[test]
    fn malformed_path_downgrades_to_literal() {
        let expr = JsonPathExpression;
        assert!(expr.compile("$[").is_none());
    }

    #[test]
    fn resolves_field_from_original_payload() {
        let expr = JsonPathExpression;
        let program = expr.compile("$.order_id").expect("should compile");
        let data = serde_json::json!({"order_id": "abc", "name": "A"});
        assert_eq!(expr.evaluate(&program, &data), serde_json::json!("abc"));
    }

    #[test]
    fn missing_field_evaluates_to_null() {
        let expr = JsonPathExpression;
        let program = expr.compile("$.missing").unwrap();
        let data = serde_json::json!({"present": 1});
        assert_eq!(expr.evaluate(&program, &data), Value::Null);
    }
}
