//! Tool schemas and tool-call validation.
//!
//! The core validates tool calls but never executes them. A returned call must
//! name one of the tools the caller supplied, and every argument key must be
//! declared in that tool's top-level parameter properties; beyond the key
//! check, arguments are validated against the full JSON Schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CascadeError;

/// A tool the caller exposes to the model: name, description, and a JSON
/// Schema describing the parameters object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object. Expected shape:
    /// `{"type": "object", "properties": {...}, "required": [...]}`.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Names of the top-level properties the schema declares.
    pub fn property_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Rough parameter fan-out: property count, counting one level of nesting.
    pub fn parameter_fanout(&self) -> usize {
        fn count(props: &Value) -> usize {
            props
                .as_object()
                .map(|map| {
                    map.values()
                        .map(|v| {
                            1 + v
                                .get("properties")
                                .map(count)
                                .unwrap_or(0)
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        self.parameters.get("properties").map(count).unwrap_or(0)
    }
}

/// How the model is allowed to use the supplied tools.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// The model must call some tool.
    Required,
    /// Tool calls are disabled for this request.
    None,
    /// The model must call the named tool.
    #[serde(untagged)]
    Named(String),
}

/// A structured tool invocation returned by a model. The core validates it
/// against the caller's schemas and hands it back; execution is the caller's
/// responsibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// Arguments object as returned by the model.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }
}

/// Validate a batch of tool calls against the request's tool list.
///
/// Checks, in order:
/// 1. every call names a supplied tool,
/// 2. every argument key is a declared top-level property of that tool,
/// 3. the arguments object satisfies the tool's full parameter schema.
pub fn validate_tool_calls(calls: &[ToolCall], tools: &[ToolSpec]) -> Result<(), CascadeError> {
    for call in calls {
        let tool = tools
            .iter()
            .find(|t| t.name == call.name)
            .ok_or_else(|| {
                CascadeError::Validation(format!(
                    "tool call names `{}` which is not among the supplied tools",
                    call.name
                ))
            })?;

        let args = call.arguments.as_object().ok_or_else(|| {
            CascadeError::Validation(format!(
                "tool call `{}` arguments must be a JSON object",
                call.name
            ))
        })?;

        let declared = tool.property_names();
        for key in args.keys() {
            if !declared.contains(&key.as_str()) {
                return Err(CascadeError::Validation(format!(
                    "tool call `{}` argument `{}` is not declared in the tool's parameter schema",
                    call.name, key
                )));
            }
        }

        let schema = jsonschema::JSONSchema::compile(&tool.parameters).map_err(|e| {
            CascadeError::Validation(format!(
                "tool `{}` has an invalid parameter schema: {e}",
                tool.name
            ))
        })?;
        let validation_result = schema.validate(&call.arguments);
        if let Err(errors) = validation_result {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CascadeError::Validation(format!(
                "tool call `{}` arguments failed schema validation: {detail}",
                call.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_tool() -> ToolSpec {
        ToolSpec::new(
            "get_weather",
            "Look up current weather",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string" },
                    "unit": { "type": "string", "enum": ["c", "f"] }
                },
                "required": ["location"]
            }),
        )
    }

    fn flight_tool() -> ToolSpec {
        ToolSpec::new(
            "book_flight",
            "Book a flight",
            json!({
                "type": "object",
                "properties": {
                    "origin": { "type": "string" },
                    "destination": { "type": "string" },
                    "date": { "type": "string" },
                    "passengers": { "type": "integer", "minimum": 1 }
                },
                "required": ["origin", "destination"]
            }),
        )
    }

    #[test]
    fn valid_call_passes() {
        let call = ToolCall::new("get_weather", json!({ "location": "paris" }));
        assert!(validate_tool_calls(&[call], &[weather_tool()]).is_ok());
    }

    #[test]
    fn unknown_tool_name_is_rejected() {
        let call = ToolCall::new("get_stock_price", json!({ "symbol": "ACME" }));
        let err = validate_tool_calls(&[call], &[weather_tool()]).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("get_stock_price"));
    }

    #[test]
    fn undeclared_argument_key_is_rejected() {
        let call = ToolCall::new(
            "get_weather",
            json!({ "location": "paris", "altitude": 35 }),
        );
        let err = validate_tool_calls(&[call], &[weather_tool()]).unwrap_err();
        assert!(err.to_string().contains("altitude"));
    }

    #[test]
    fn schema_violation_is_rejected() {
        // passengers below the schema minimum
        let call = ToolCall::new(
            "book_flight",
            json!({ "origin": "LAX", "destination": "SEA", "passengers": 0 }),
        );
        let err = validate_tool_calls(&[call], &[flight_tool()]).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn multi_turn_booking_arguments_validate() {
        let call = ToolCall::new(
            "book_flight",
            json!({
                "origin": "LAX",
                "destination": "SEA",
                "date": "next tuesday",
                "passengers": 2
            }),
        );
        assert!(validate_tool_calls(&[call], &[flight_tool()]).is_ok());
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let call = ToolCall::new("get_weather", json!("paris"));
        assert!(validate_tool_calls(&[call], &[weather_tool()]).is_err());
    }

    #[test]
    fn parameter_fanout_counts_nested_properties() {
        let tool = ToolSpec::new(
            "report",
            "",
            json!({
                "type": "object",
                "properties": {
                    "filters": {
                        "type": "object",
                        "properties": { "from": {}, "to": {} }
                    },
                    "format": { "type": "string" }
                }
            }),
        );
        // filters (1) + from/to (2) + format (1)
        assert_eq!(tool.parameter_fanout(), 4);
        assert_eq!(weather_tool().parameter_fanout(), 2);
    }

    #[test]
    fn tool_choice_serializes_to_wire_names() {
        assert_eq!(serde_json::to_string(&ToolChoice::Auto).unwrap(), "\"auto\"");
        assert_eq!(
            serde_json::to_string(&ToolChoice::Named("get_weather".into())).unwrap(),
            "\"get_weather\""
        );
    }
}
