//! JSON-schema synthesis from an observed payload.

use kube_core::DynamicObject;
use serde_json::{json, Map, Value};

/// The schema id of an object: `apiVersion/kind`.
pub fn schema_id(object: &DynamicObject) -> String {
    match &object.types {
        Some(types) => format!("{}/{}", types.api_version, types.kind),
        None => "/".into(),
    }
}

/// Builds the schema document registered for the shape of `payload`.
///
/// The document also reserves an `Extras` definition, an array of `{key, val}` pairs,
/// for fields merged into messages later on.
pub fn document(payload: &Value) -> Value {
    let mut schema = infer(payload);
    if let Value::Object(map) = &mut schema {
        map.insert(
            "$schema".into(),
            Value::String("http://json-schema.org/draft-04/schema#".into()),
        );
        map.insert(
            "definitions".into(),
            json!({
                "Extras": {
                    "type": "array",
                    "template": {
                        "type": "object",
                        "properties": {
                            "key": {"type": "string"},
                            "val": {"type": "string"},
                        },
                    },
                },
            }),
        );
    }
    schema
}

/// Infers a structural schema for `value`.
pub fn infer(value: &Value) -> Value {
    match value {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) if n.is_f64() => json!({"type": "number"}),
        Value::Number(_) => json!({"type": "integer"}),
        Value::String(_) => json!({"type": "string"}),
        Value::Array(items) => match items.first() {
            Some(first) => json!({"type": "array", "items": infer(first)}),
            None => json!({"type": "array"}),
        },
        Value::Object(fields) => {
            let properties: Map<String, Value> = fields
                .iter()
                .map(|(key, value)| (key.clone(), infer(value)))
                .collect();
            json!({"type": "object", "properties": properties})
        }
    }
}
