use serde_json::{Map, Number, Value};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};

use crate::graph::{InputVariable, StartConfig, VariableType};

/// Bind runtime inputs against the start node's declared variables.
///
/// Declared variables take the supplied value, else their default. Values are
/// coerced to the declared type; strings are accepted for numbers and booleans
/// since command-line inputs arrive as text. With no variables declared, every
/// supplied input passes through unchanged.
pub fn bind_inputs(config: &StartConfig, supplied: Map<String, Value>) -> Result<Map<String, Value>> {
    if config.variables.is_empty() {
        return Ok(supplied);
    }

    let mut supplied = supplied;
    let mut bound = Map::new();
    for var in &config.variables {
        let value = match supplied.remove(&var.name) {
            Some(Value::Null) | None => var.default_value.clone(),
            Some(v) => Some(v),
        };
        match value {
            Some(Value::Null) | None if var.required => {
                return Err(StepwiseError::Input {
                    name: var.name.clone(),
                    reason: "required input is missing".into(),
                })
            }
            Some(Value::Null) | None => {}
            Some(v) => {
                bound.insert(var.name.clone(), coerce(var, v)?);
            }
        }
    }

    for name in supplied.keys() {
        debug!(input = %name, "Ignoring undeclared input");
    }
    Ok(bound)
}

fn coerce(var: &InputVariable, value: Value) -> Result<Value> {
    let invalid = |reason: String| StepwiseError::Input {
        name: var.name.clone(),
        reason,
    };

    match (var.var_type, value) {
        (VariableType::String, v @ Value::String(_)) => Ok(v),
        (VariableType::String, v @ (Value::Number(_) | Value::Bool(_))) => {
            Ok(Value::String(v.to_string()))
        }
        (VariableType::Number, v @ Value::Number(_)) => Ok(v),
        (VariableType::Number, Value::String(s)) => {
            let text = s.trim();
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Value::from(n));
            }
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid(format!("'{}' is not a number", s)))
        }
        (VariableType::Boolean, v @ Value::Bool(_)) => Ok(v),
        (VariableType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid(format!("'{}' is not a boolean", s))),
        },
        (expected, other) => Err(invalid(format!(
            "expected {}, got {}",
            type_label(expected),
            json_type(&other)
        ))),
    }
}

fn type_label(t: VariableType) -> &'static str {
    match t {
        VariableType::String => "string",
        VariableType::Number => "number",
        VariableType::Boolean => "boolean",
    }
}

fn json_type(value: &Value) -> &'static str {
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

    fn config(variables: Value) -> StartConfig {
        serde_json::from_value(json!({ "variables": variables })).unwrap()
    }

    fn map(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_required_missing() {
        let cfg = config(json!([{"name": "q", "required": true}]));
        let err = bind_inputs(&cfg, Map::new()).unwrap_err();
        assert!(matches!(err, StepwiseError::Input { ref name, .. } if name == "q"));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let cfg = config(json!([{"name": "q", "required": true}]));
        assert!(bind_inputs(&cfg, map(json!({"q": null}))).is_err());
    }

    #[test]
    fn test_default_applied() {
        let cfg = config(json!([{"name": "n", "type": "number", "defaultValue": 3}]));
        let bound = bind_inputs(&cfg, Map::new()).unwrap();
        assert_eq!(bound["n"], json!(3));
    }

    #[test]
    fn test_optional_missing_is_omitted() {
        let cfg = config(json!([{"name": "n", "type": "number"}]));
        assert!(bind_inputs(&cfg, Map::new()).unwrap().is_empty());
    }

    #[test]
    fn test_string_coercion() {
        let cfg = config(json!([
            {"name": "n", "type": "number"},
            {"name": "f", "type": "number"},
            {"name": "b", "type": "boolean"},
            {"name": "s", "type": "string"}
        ]));
        let bound = bind_inputs(
            &cfg,
            map(json!({"n": "42", "f": " 2.5", "b": "TRUE", "s": 7})),
        )
        .unwrap();
        assert_eq!(bound["n"], json!(42));
        assert_eq!(bound["f"], json!(2.5));
        assert_eq!(bound["b"], json!(true));
        assert_eq!(bound["s"], json!("7"));
    }

    #[test]
    fn test_bad_number() {
        let cfg = config(json!([{"name": "n", "type": "number"}]));
        let err = bind_inputs(&cfg, map(json!({"n": "many"}))).unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn test_wrong_json_type() {
        let cfg = config(json!([{"name": "b", "type": "boolean"}]));
        let err = bind_inputs(&cfg, map(json!({"b": [1]}))).unwrap_err();
        assert!(err.to_string().contains("expected boolean, got array"));
    }

    #[test]
    fn test_undeclared_ignored() {
        let cfg = config(json!([{"name": "q"}]));
        let bound = bind_inputs(&cfg, map(json!({"q": "x", "extra": 1}))).unwrap();
        assert_eq!(bound.len(), 1);
    }

    #[test]
    fn test_no_declarations_pass_through() {
        let bound = bind_inputs(&StartConfig::default(), map(json!({"a": 1}))).unwrap();
        assert_eq!(bound["a"], json!(1));
    }
}
