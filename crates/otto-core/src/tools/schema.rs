//! Argument validation against a tool's parameter schema.
//!
//! Runs before the safety gate; a failure short-circuits into a structured
//! tool error and never reaches the handler. Covers the subset of JSON Schema
//! the registry's descriptors use: required fields and primitive types.

use serde_json::Value;

/// Validate `args` against `schema`. Returns the first violation found.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    if !args.is_object() {
        return Err("arguments must be an object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if args.get(name).is_none() {
                return Err(format!("missing field `{}`", name));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (name, value) in args.as_object().expect("checked above") {
        let Some(spec) = properties.get(name) else {
            // Unknown fields pass through; tools deserialize strictly if they
            // care.
            continue;
        };
        let Some(expected) = spec.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        if !type_matches(value, expected) {
            return Err(format!(
                "field `{}` expected {}, got {}",
                name,
                expected,
                type_name(value)
            ));
        }
    }

    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "limit": { "type": "integer" },
                "recursive": { "type": "boolean" },
            },
            "required": ["path"],
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let args = json!({"path": "src/main.rs", "limit": 10});
        assert!(validate_arguments(&args, &schema()).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let args = json!({"limit": 10});
        let err = validate_arguments(&args, &schema()).unwrap_err();
        assert!(err.contains("missing field `path`"));
    }

    #[test]
    fn wrong_type_is_reported() {
        let args = json!({"path": 42});
        let err = validate_arguments(&args, &schema()).unwrap_err();
        assert!(err.contains("expected string"));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let args = json!("just a string");
        assert!(validate_arguments(&args, &schema()).is_err());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let args = json!({"path": "x", "extra": true});
        assert!(validate_arguments(&args, &schema()).is_ok());
    }
}
