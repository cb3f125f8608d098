//! Closed-world JSON Schema validation for tool inputs.
//!
//! Supports the subset of JSON Schema used by tool definitions: `type`,
//! `properties`, `required`, `additionalProperties`, `items`, `enum`,
//! `const`, `oneOf`, `anyOf`, length/size/range bounds and local `$ref`.
//! Object schemas reject unknown properties unless they set
//! `additionalProperties: true` or give a schema for extras.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use super::tool::ToolDefinition;

/// Maximum `$ref` hops followed before the schema is declared cyclic.
const MAX_REF_DEPTH: usize = 32;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// JSON pointer to the offending value (`""` is the root).
    pub path: String,
    /// What is wrong.
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "(root): {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Formats a batch of errors as one line per failure.
#[must_use]
pub fn describe_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates `input` against the tool's input schema.
///
/// # Errors
///
/// Returns every failure found; an empty error list is never returned.
pub fn validate(input: &Value, tool: &ToolDefinition) -> Result<(), Vec<ValidationError>> {
    validate_schema(input, &tool.input_schema)
}

/// Validates `input` against a bare schema.
///
/// # Errors
///
/// Returns every failure found.
pub fn validate_schema(input: &Value, schema: &Value) -> Result<(), Vec<ValidationError>> {
    let mut validator = Validator {
        root: schema,
        errors: Vec::new(),
    };
    validator.check(input, schema, "", 0);
    if validator.errors.is_empty() {
        Ok(())
    } else {
        Err(validator.errors)
    }
}

/// Runs the tool's sanitizer, then validates.
///
/// Returns the value that passed validation: the repaired input when the
/// sanitizer produced a valid value, else the original input. Sanitizer
/// output that fails validation is discarded and the original is reported.
///
/// # Errors
///
/// Returns the failures for the original input.
pub fn sanitize_then_validate(
    input: &Value,
    tool: &ToolDefinition,
) -> Result<Value, Vec<ValidationError>> {
    if let Some(repaired) = tool.sanitizer.as_ref().and_then(|s| s.apply(input))
        && validate(&repaired, tool).is_ok()
    {
        return Ok(repaired);
    }
    validate(input, tool).map(|()| input.clone())
}

struct Validator<'s> {
    root: &'s Value,
    errors: Vec<ValidationError>,
}

impl<'s> Validator<'s> {
    fn fail(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn resolve_ref(&self, reference: &str) -> Option<&'s Value> {
        let pointer = reference.strip_prefix('#')?;
        if pointer.is_empty() {
            return Some(self.root);
        }
        self.root.pointer(pointer)
    }

    fn check(&mut self, value: &Value, schema: &'s Value, path: &str, depth: usize) {
        let Some(schema_obj) = schema.as_object() else {
            // `true` accepts everything, `false` nothing.
            if schema == &Value::Bool(false) {
                self.fail(path, "no value is allowed here");
            }
            return;
        };

        if let Some(reference) = schema_obj.get("$ref").and_then(Value::as_str) {
            if depth >= MAX_REF_DEPTH {
                self.fail(path, format!("schema reference {reference} is cyclic"));
                return;
            }
            match self.resolve_ref(reference) {
                Some(target) => self.check(value, target, path, depth + 1),
                None => self.fail(path, format!("unresolvable schema reference {reference}")),
            }
            return;
        }

        if let Some(expected) = schema_obj.get("const")
            && value != expected
        {
            self.fail(path, format!("must equal {expected}"));
            return;
        }

        if let Some(Value::Array(options)) = schema_obj.get("enum")
            && !options.contains(value)
        {
            let allowed: Vec<String> = options.iter().map(ToString::to_string).collect();
            self.fail(path, format!("must be one of [{}]", allowed.join(", ")));
            return;
        }

        if let Some(types) = schema_obj.get("type")
            && !type_matches(value, types)
        {
            self.fail(
                path,
                format!("expected {}, got {}", describe_type(types), json_type(value)),
            );
            return;
        }

        if let Some(Value::Array(variants)) = schema_obj.get("oneOf") {
            let matching = variants
                .iter()
                .filter(|variant| self.matches(value, *variant, path, depth))
                .count();
            if matching != 1 {
                self.fail(
                    path,
                    format!(
                        "must match exactly one of {} alternatives, matched {matching}",
                        variants.len()
                    ),
                );
                return;
            }
        }

        if let Some(Value::Array(variants)) = schema_obj.get("anyOf")
            && !variants
                .iter()
                .any(|variant| self.matches(value, variant, path, depth))
        {
            self.fail(path, "does not match any allowed alternative");
            return;
        }

        match value {
            Value::Object(map) => self.check_object(map, schema_obj, path, depth),
            Value::Array(items) => self.check_array(items, schema_obj, path, depth),
            Value::String(s) => self.check_string(s, schema_obj, path),
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    self.check_number(v, schema_obj, path);
                }
            }
            Value::Bool(_) | Value::Null => {}
        }
    }

    /// Checks a sub-schema without recording failures.
    fn matches(&self, value: &Value, schema: &'s Value, path: &str, depth: usize) -> bool {
        let mut trial = Validator {
            root: self.root,
            errors: Vec::new(),
        };
        trial.check(value, schema, path, depth);
        trial.errors.is_empty()
    }

    fn check_object(
        &mut self,
        map: &Map<String, Value>,
        schema: &'s Map<String, Value>,
        path: &str,
        depth: usize,
    ) {
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(name) {
                    self.fail(path, format!("missing required property \"{name}\""));
                }
            }
        }

        let additional = schema.get("additionalProperties");
        // Keys of a composed object are owned by the variant that matched.
        let composed = schema.contains_key("oneOf") || schema.contains_key("anyOf");
        if composed && properties.is_none() && additional.is_none() {
            return;
        }
        for (key, child) in map {
            let child_path = format!("{path}/{}", escape_pointer(key));
            if let Some(child_schema) = properties.and_then(|p| p.get(key)) {
                self.check(child, child_schema, &child_path, depth);
                continue;
            }
            match additional {
                Some(Value::Bool(true)) => {}
                Some(extra @ Value::Object(_)) => self.check(child, extra, &child_path, depth),
                _ => {
                    let known: Vec<&str> = properties
                        .map(|p| p.keys().map(String::as_str).collect())
                        .unwrap_or_default();
                    self.fail(
                        &child_path,
                        format!(
                            "unknown property \"{key}\" (allowed: {})",
                            if known.is_empty() {
                                "none".to_string()
                            } else {
                                known.join(", ")
                            }
                        ),
                    );
                }
            }
        }
    }

    fn check_array(
        &mut self,
        items: &[Value],
        schema: &'s Map<String, Value>,
        path: &str,
        depth: usize,
    ) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64)
            && (items.len() as u64) < min
        {
            self.fail(path, format!("must contain at least {min} items"));
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64)
            && (items.len() as u64) > max
        {
            self.fail(path, format!("must contain at most {max} items"));
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(item, item_schema, &format!("{path}/{i}"), depth);
            }
        }
    }

    fn check_string(&mut self, s: &str, schema: &Map<String, Value>, path: &str) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64)
            && len < min
        {
            self.fail(path, format!("must be at least {min} characters"));
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64)
            && len > max
        {
            self.fail(path, format!("must be at most {max} characters"));
        }
    }

    fn check_number(&mut self, v: f64, schema: &Map<String, Value>, path: &str) {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64)
            && v < min
        {
            self.fail(path, format!("must be >= {min}"));
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64)
            && v > max
        {
            self.fail(path, format!("must be <= {max}"));
        }
    }
}

fn type_matches(value: &Value, types: &Value) -> bool {
    match types {
        Value::String(t) => single_type_matches(value, t),
        Value::Array(options) => options
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(value, t)),
        _ => true,
    }
}

fn single_type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0 && f.is_finite())
        }
        _ => false,
    }
}

fn describe_type(types: &Value) -> String {
    match types {
        Value::String(t) => t.clone(),
        Value::Array(options) => options
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tool::Sanitizer;
    use serde_json::json;
    use test_case::test_case;

    fn search_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1},
                "limit": {"type": "integer", "minimum": 1, "maximum": 20}
            },
            "required": ["query"]
        })
    }

    fn tool(schema: Value) -> ToolDefinition {
        ToolDefinition::new("t", "test tool", schema)
    }

    #[test_case(json!({"query": "rust"}), true ; "minimal valid")]
    #[test_case(json!({"query": "rust", "limit": 5}), true ; "with optional")]
    #[test_case(json!({}), false ; "missing required")]
    #[test_case(json!({"query": ""}), false ; "too short")]
    #[test_case(json!({"query": "x", "limit": 0}), false ; "below minimum")]
    #[test_case(json!({"query": "x", "limit": 2.5}), false ; "non integer")]
    #[test_case(json!({"query": "x", "extra": true}), false ; "unknown property")]
    #[test_case(json!("query"), false ; "wrong root type")]
    fn test_search_schema(input: Value, ok: bool) {
        assert_eq!(validate_schema(&input, &search_schema()).is_ok(), ok);
    }

    #[test]
    fn test_unknown_property_path_and_message() {
        let errors = validate_schema(&json!({"query": "x", "qury": "y"}), &search_schema())
            .err()
            .unwrap_or_default();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/qury");
        assert!(errors[0].message.contains("unknown property"));
        assert!(errors[0].message.contains("query"));
    }

    #[test]
    fn test_additional_properties_true_allows_extras() {
        let schema = json!({"type": "object", "properties": {}, "additionalProperties": true});
        assert!(validate_schema(&json!({"anything": 1}), &schema).is_ok());
    }

    #[test]
    fn test_additional_properties_schema() {
        let schema = json!({"type": "object", "additionalProperties": {"type": "number"}});
        assert!(validate_schema(&json!({"a": 1, "b": 2.5}), &schema).is_ok());
        assert!(validate_schema(&json!({"a": "x"}), &schema).is_err());
    }

    #[test]
    fn test_nested_arrays_of_objects() {
        let schema = json!({
            "type": "object",
            "properties": {
                "claims": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "text": {"type": "string"},
                            "sources": {"type": "array", "items": {"type": "string"}}
                        },
                        "required": ["text"]
                    }
                }
            },
            "required": ["claims"]
        });
        assert!(validate_schema(&json!({"claims": [{"text": "a", "sources": ["u"]}]}), &schema).is_ok());

        let errors = validate_schema(&json!({"claims": [{"text": "a"}, {"sources": [1]}]}), &schema)
            .err()
            .unwrap_or_default();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"/claims/1"));
        assert!(paths.contains(&"/claims/1/sources/0"));
        assert!(validate_schema(&json!({"claims": []}), &schema).is_err());
    }

    #[test]
    fn test_one_of_exactly_one() {
        let schema = json!({
            "oneOf": [
                {"type": "object", "properties": {"url": {"type": "string"}}, "required": ["url"]},
                {"type": "object", "properties": {"query": {"type": "string"}}, "required": ["query"]}
            ]
        });
        assert!(validate_schema(&json!({"url": "u"}), &schema).is_ok());
        assert!(validate_schema(&json!({"query": "q"}), &schema).is_ok());
        // Closed-world objects mean a value with both keys matches neither.
        assert!(validate_schema(&json!({"url": "u", "query": "q"}), &schema).is_err());
        assert!(validate_schema(&json!({}), &schema).is_err());
    }

    #[test]
    fn test_any_of_objects_keep_variant_keys() {
        let schema = json!({
            "type": "object",
            "anyOf": [
                {"properties": {"url": {"type": "string"}}, "required": ["url"]},
                {"properties": {"query": {"type": "string"}}, "required": ["query"]}
            ]
        });
        assert!(validate_schema(&json!({"url": "u"}), &schema).is_ok());
        assert!(validate_schema(&json!({"query": "q"}), &schema).is_ok());
        assert!(validate_schema(&json!({"other": 1}), &schema).is_err());
    }

    #[test]
    fn test_one_of_overlapping_rejected() {
        let schema = json!({"oneOf": [{"type": "string"}, {"type": ["string", "null"]}]});
        assert!(validate_schema(&json!("x"), &schema).is_err());
        assert!(validate_schema(&json!(null), &schema).is_ok());
    }

    #[test]
    fn test_any_of() {
        let schema = json!({"anyOf": [{"type": "string"}, {"type": "integer"}]});
        assert!(validate_schema(&json!(3), &schema).is_ok());
        assert!(validate_schema(&json!(true), &schema).is_err());
    }

    #[test]
    fn test_enum_and_const() {
        let schema = json!({
            "type": "object",
            "properties": {
                "kind": {"enum": ["a", "b"]},
                "version": {"const": 2}
            }
        });
        assert!(validate_schema(&json!({"kind": "a", "version": 2}), &schema).is_ok());
        assert!(validate_schema(&json!({"kind": "c"}), &schema).is_err());
        assert!(validate_schema(&json!({"version": 3}), &schema).is_err());
    }

    #[test]
    fn test_ref_into_defs() {
        let schema = json!({
            "type": "object",
            "properties": {"entity": {"$ref": "#/$defs/entity"}},
            "$defs": {
                "entity": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }
            }
        });
        assert!(validate_schema(&json!({"entity": {"name": "Acme"}}), &schema).is_ok());
        assert!(validate_schema(&json!({"entity": {}}), &schema).is_err());
    }

    #[test]
    fn test_cyclic_ref_terminates() {
        let schema = json!({"$ref": "#/$defs/a", "$defs": {"a": {"$ref": "#/$defs/a"}}});
        let errors = validate_schema(&json!(1), &schema).err().unwrap_or_default();
        assert!(errors[0].message.contains("cyclic"));
    }

    #[test]
    fn test_unresolvable_ref() {
        let schema = json!({"$ref": "#/$defs/missing"});
        assert!(validate_schema(&json!(1), &schema).is_err());
    }

    #[test]
    fn test_type_union() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate_schema(&json!(null), &schema).is_ok());
        assert!(validate_schema(&json!(1), &schema).is_err());
    }

    #[test]
    fn test_integer_accepts_whole_float() {
        let schema = json!({"type": "integer"});
        assert!(validate_schema(&json!(4.0), &schema).is_ok());
    }

    #[test]
    fn test_sanitize_then_validate_repairs() {
        let def = tool(search_schema()).with_sanitizer(Sanitizer::common());
        let repaired = sanitize_then_validate(&json!({"properties": {"query": "q"}}), &def);
        assert_eq!(repaired, Ok(json!({"query": "q"})));
    }

    #[test]
    fn test_sanitize_failure_falls_back_to_original() {
        let broken = Sanitizer::new(|_| Some(json!({"garbage": true})));
        let def = tool(search_schema()).with_sanitizer(broken);
        assert_eq!(
            sanitize_then_validate(&json!({"query": "q"}), &def),
            Ok(json!({"query": "q"}))
        );
        let errors = sanitize_then_validate(&json!({}), &def).err().unwrap_or_default();
        assert!(errors[0].message.contains("missing required property"));
    }

    #[test]
    fn test_describe_errors() {
        let errors = vec![
            ValidationError {
                path: String::new(),
                message: "bad".to_string(),
            },
            ValidationError {
                path: "/a".to_string(),
                message: "worse".to_string(),
            },
        ];
        assert_eq!(describe_errors(&errors), "(root): bad\n/a: worse");
    }
}
