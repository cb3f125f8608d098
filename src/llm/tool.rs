//! Tool definitions for function-calling.
//!
//! A [`ToolDefinition`] pairs a JSON-Schema input shape with an optional
//! [`Sanitizer`] that repairs common model mistakes before validation.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

/// Repair function run on a tool input before validation.
///
/// Returns `None` when it has nothing to repair. The gateway falls back to
/// the original input whenever the repaired value still fails validation.
#[derive(Clone)]
pub struct Sanitizer(Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>);

impl Sanitizer {
    /// Wraps a repair function.
    pub fn new(f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Runs the repair function.
    #[must_use]
    pub fn apply(&self, input: &Value) -> Option<Value> {
        (self.0)(input)
    }

    /// Unwraps inputs nested one level too deep under a `properties` key.
    #[must_use]
    pub fn properties_wrapper() -> Self {
        Self::new(unwrap_properties_wrapper)
    }

    /// Parses object or array fields the model sent as JSON strings.
    #[must_use]
    pub fn stringified_json() -> Self {
        Self::new(parse_stringified_json)
    }

    /// Both built-in repairs, applied in sequence.
    #[must_use]
    pub fn common() -> Self {
        Self::new(|input| {
            let unwrapped = unwrap_properties_wrapper(input);
            let base = unwrapped.as_ref().unwrap_or(input);
            match parse_stringified_json(base) {
                Some(parsed) => Some(parsed),
                None => unwrapped,
            }
        })
    }
}

impl fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sanitizer(<fn>)")
    }
}

/// `{"properties": {...}}` with nothing else becomes the inner object.
#[must_use]
pub fn unwrap_properties_wrapper(input: &Value) -> Option<Value> {
    let obj = input.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    match obj.get("properties") {
        Some(inner @ Value::Object(_)) => Some(inner.clone()),
        _ => None,
    }
}

/// Top-level string fields that hold a JSON object or array are parsed.
#[must_use]
pub fn parse_stringified_json(input: &Value) -> Option<Value> {
    let obj = input.as_object()?;
    let mut changed = false;
    let mut out = Map::with_capacity(obj.len());
    for (key, value) in obj {
        let repaired = value.as_str().and_then(|s| {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str::<Value>(s).ok()
            } else {
                None
            }
        });
        if let Some(parsed) = repaired {
            changed = true;
            out.insert(key.clone(), parsed);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    changed.then_some(Value::Object(out))
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Tool name, unique within a request.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON Schema describing the tool input.
    pub input_schema: Value,
    /// Optional repair pre-pass.
    #[serde(skip)]
    pub sanitizer: Option<Sanitizer>,
}

impl ToolDefinition {
    /// Creates a definition without a sanitizer.
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            sanitizer: None,
        }
    }

    /// Attaches a sanitizer.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }
}

/// How the model must use the offered tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum ToolChoice {
    /// At least one tool call is required.
    Required,
    /// This specific tool must be called.
    Tool(String),
}

impl ToolChoice {
    /// Shorthand for [`ToolChoice::Tool`].
    pub fn tool(name: impl Into<String>) -> Self {
        Self::Tool(name.into())
    }
}

/// Looks up a definition by name.
#[must_use]
pub fn find_tool<'a>(tools: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    tools.iter().find(|t| t.name == name)
}
