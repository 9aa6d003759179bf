//! Canonical event envelope builder (§4.7). Generic over any expression
//! engine implementing [`fiso_core::contracts::Expression`], so the core
//! depends on expression evaluation only through `compile`/`evaluate`.

use chrono::Utc;
use fiso_core::contracts::Expression;
use serde_json::{Map, Value};

pub const SPEC_VERSION: &str = "1.0";
pub const DEFAULT_EVENT_TYPE: &str = "event";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
pub const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Literal-or-expression overrides for envelope fields. Each field is
/// either absent (use the default), or present as raw text that the
/// builder treats as an expression if it compiles, else as a literal.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOverrides {
    pub id: Option<String>,
    pub source: Option<String>,
    pub r#type: Option<String>,
    pub subject: Option<String>,
    pub data: Option<String>,
    pub data_content_type: Option<String>,
    pub data_schema: Option<String>,
}

/// Resolves one override field against `binding`, using `program` if the
/// text compiled as an expression.
fn resolve_text<X: Expression>(engine: &X, binding: &Value, raw: &str) -> String {
    match engine.compile(raw) {
        Some(program) => {
            let evaluated = engine.evaluate(&program, binding);
            match evaluated {
                Value::String(s) => s,
                other => other.to_string(),
            }
        }
        None => raw.to_string(),
    }
}

/// Resolves the `data` override, which is allowed to produce a non-string
/// JSON value. Falls back to the literal text (as a JSON string) if
/// re-serialization somehow fails.
fn resolve_data<X: Expression>(engine: &X, binding: &Value, raw: &str) -> Value {
    match engine.compile(raw) {
        Some(program) => {
            let evaluated = engine.evaluate(&program, binding);
            match serde_json::to_value(&evaluated) {
                Ok(v) => v,
                Err(_) => Value::String(raw.to_string()),
            }
        }
        None => Value::String(raw.to_string()),
    }
}

/// True when `value` looks like an already-wrapped envelope: non-empty
/// `specversion`, `type`, and `source`.
fn looks_like_envelope(value: &Value) -> bool {
    let non_empty_str = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    };
    non_empty_str("specversion") && non_empty_str("type") && non_empty_str("source")
}

pub struct EnvelopeBuilder<X: Expression> {
    engine: X,
    flow_prefix: String,
}

impl<X: Expression> EnvelopeBuilder<X> {
    pub fn new(engine: X, flow_prefix: impl Into<String>) -> Self {
        Self {
            engine,
            flow_prefix: flow_prefix.into(),
        }
    }

    /// Builds (or passes through) the envelope for one event.
    ///
    /// `transformed` is the post-transform payload, which may already be a
    /// full envelope. `original` is the pre-transform payload; expressions
    /// always evaluate against it so envelope metadata reflects the source
    /// event rather than anything the transformer changed.
    pub fn build(
        &self,
        transformed: &[u8],
        original: &[u8],
        flow_name: &str,
        overrides: &EnvelopeOverrides,
    ) -> Result<Value, serde_json::Error> {
        let transformed_json: Value =
            serde_json::from_slice(transformed).unwrap_or_else(|_| Value::String(
                String::from_utf8_lossy(transformed).to_string(),
            ));
        let original_json: Value = serde_json::from_slice(original).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(original).to_string())
        });

        let has_overrides = overrides.id.is_some()
            || overrides.source.is_some()
            || overrides.r#type.is_some()
            || overrides.subject.is_some()
            || overrides.data.is_some()
            || overrides.data_content_type.is_some()
            || overrides.data_schema.is_some();

        if looks_like_envelope(&transformed_json) {
            if !has_overrides {
                return Ok(transformed_json);
            }
            let data_source = transformed_json
                .get("data")
                .cloned()
                .unwrap_or_else(|| original_json.clone());
            let binding = self.binding(&data_source);
            let mut obj = match transformed_json {
                Value::Object(m) => m,
                _ => Map::new(),
            };
            self.apply_overrides(&mut obj, &binding, overrides);
            return Ok(Value::Object(obj));
        }

        let binding = self.binding(&original_json);
        let mut obj = Map::new();
        obj.insert("specversion".to_string(), Value::String(SPEC_VERSION.to_string()));
        obj.insert(
            "source".to_string(),
            Value::String(format!("{}/{}", self.flow_prefix, flow_name)),
        );
        obj.insert(
            "type".to_string(),
            Value::String(DEFAULT_EVENT_TYPE.to_string()),
        );
        obj.insert(
            "id".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        obj.insert("time".to_string(), Value::String(Utc::now().to_rfc3339()));
        obj.insert(
            "datacontenttype".to_string(),
            Value::String(DEFAULT_CONTENT_TYPE.to_string()),
        );
        obj.insert("data".to_string(), transformed_json);

        self.apply_overrides(&mut obj, &binding, overrides);
        Ok(Value::Object(obj))
    }

    /// The root document expressions evaluate against. Per §4.7 the spec's
    /// worked examples address fields directly (`$.order_id`, not
    /// `$.data.order_id`), so the bound root is the pre-transform data
    /// itself rather than a `{data, time}` wrapper; a JSONPath expression
    /// has only one addressable root. `time` is therefore not reachable
    /// from an override expression with this expression engine — see
    /// DESIGN.md.
    fn binding(&self, data: &Value) -> Value {
        data.clone()
    }

    fn apply_overrides(&self, obj: &mut Map<String, Value>, binding: &Value, overrides: &EnvelopeOverrides) {
        if let Some(raw) = &overrides.id {
            obj.insert("id".to_string(), Value::String(resolve_text(&self.engine, binding, raw)));
        }
        if let Some(raw) = &overrides.source {
            obj.insert(
                "source".to_string(),
                Value::String(resolve_text(&self.engine, binding, raw)),
            );
        }
        if let Some(raw) = &overrides.r#type {
            obj.insert("type".to_string(), Value::String(resolve_text(&self.engine, binding, raw)));
        }
        if let Some(raw) = &overrides.subject {
            obj.insert(
                "subject".to_string(),
                Value::String(resolve_text(&self.engine, binding, raw)),
            );
        }
        if let Some(raw) = &overrides.data_content_type {
            obj.insert(
                "datacontenttype".to_string(),
                Value::String(resolve_text(&self.engine, binding, raw)),
            );
        }
        if let Some(raw) = &overrides.data_schema {
            obj.insert(
                "dataschema".to_string(),
                Value::String(resolve_text(&self.engine, binding, raw)),
            );
        }
        if let Some(raw) = &overrides.data {
            obj.insert("data".to_string(), resolve_data(&self.engine, binding, raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiso_expr_jsonpath::JsonPathExpression;

    #[test]
    fn fresh_envelope_has_required_fields() {
        let builder = EnvelopeBuilder::new(JsonPathExpression, "fiso");
        let envelope = builder
            .build(br#"{"transformed":true}"#, br#"{"order_id":"abc"}"#, "f1", &EnvelopeOverrides::default())
            .unwrap();
        assert_eq!(envelope["specversion"], "1.0");
        assert_eq!(envelope["source"], "fiso/f1");
        assert_eq!(envelope["type"], "event");
        assert_eq!(envelope["datacontenttype"], "application/json");
        assert_eq!(envelope["data"], serde_json::json!({"transformed": true}));
        assert!(envelope["id"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn override_resolves_against_original_not_transformed() {
        let builder = EnvelopeBuilder::new(JsonPathExpression, "fiso");
        let overrides = EnvelopeOverrides {
            subject: Some("$.order_id".to_string()),
            ..Default::default()
        };
        let envelope = builder
            .build(
                br#"{"transformed":true}"#,
                br#"{"order_id":"abc","name":"A"}"#,
                "f1",
                &overrides,
            )
            .unwrap();
        assert_eq!(envelope["subject"], "abc");
        assert_eq!(envelope["data"], serde_json::json!({"transformed": true}));
    }

    #[test]
    fn already_enveloped_passthrough_without_overrides() {
        let builder = EnvelopeBuilder::new(JsonPathExpression, "fiso");
        let input = br#"{"specversion":"1.0","type":"custom","source":"x","data":{"a":1}}"#;
        let envelope = builder.build(input, b"{}", "f1", &EnvelopeOverrides::default()).unwrap();
        assert_eq!(envelope["type"], "custom");
        assert_eq!(envelope["source"], "x");
    }

    #[test]
    fn already_enveloped_with_overrides_uses_existing_data_as_binding() {
        let builder = EnvelopeBuilder::new(JsonPathExpression, "fiso");
        let input = br#"{"specversion":"1.0","type":"custom","source":"x","data":{"order_id":"z9"}}"#;
        let overrides = EnvelopeOverrides {
            subject: Some("$.order_id".to_string()),
            ..Default::default()
        };
        let envelope = builder.build(input, b"{}", "f1", &overrides).unwrap();
        assert_eq!(envelope["subject"], "z9");
    }

    #[test]
    fn non_compiling_override_is_used_as_a_literal() {
        let builder = EnvelopeBuilder::new(JsonPathExpression, "fiso");
        let overrides = EnvelopeOverrides {
            subject: Some("not-an-expression".to_string()),
            ..Default::default()
        };
        let envelope = builder
            .build(br#"{}"#, br#"{}"#, "f1", &overrides)
            .unwrap();
        assert_eq!(envelope["subject"], "not-an-expression");
    }
}
