//! Reassembly of streamed tool calls and validation of their arguments.

use crate::chunk::ToolCallDelta;
use crate::error::{ChatError, Hallucination, Result};
use crate::types::{FunctionCall, FunctionProperty, Tool, ToolCall, ToolType};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// A tool call whose fragments are still arriving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialToolCall {
    pub id: Option<String>,
    pub call_type: Option<ToolType>,
    pub name: String,
    pub arguments: String,
}

impl PartialToolCall {
    fn apply(&mut self, delta: &ToolCallDelta) {
        if self.id.is_none() {
            self.id = delta.id.clone().filter(|id| !id.is_empty());
        }
        if self.call_type.is_none() {
            self.call_type = delta.call_type.clone();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref() {
                self.name.push_str(name);
            }
            if let Some(arguments) = function.arguments.as_deref() {
                self.arguments.push_str(arguments);
            }
        }
    }

    fn seal(self, index: u32) -> ToolCall {
        let id = self.id.unwrap_or_else(|| {
            warn!("Tool call {} arrived without an id, synthesizing one", index);
            format!("call_{index}")
        });
        ToolCall {
            id,
            call_type: self.call_type.unwrap_or_default(),
            function: FunctionCall {
                name: self.name,
                arguments: self.arguments,
            },
        }
    }
}

/// Collects tool-call fragments of one slot, keyed by tool-call index.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one fragment and returns the call it belongs to.
    pub fn apply(&mut self, delta: &ToolCallDelta) -> &PartialToolCall {
        let call = self.calls.entry(delta.index).or_default();
        call.apply(delta);
        call
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Freezes the collected calls, ordered by tool-call index.
    pub fn seal(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| call.seal(index))
            .collect()
    }
}

/// Outcome of interpreting a sealed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Parsed(Map<String, Value>),
    Hallucination(Hallucination),
}

impl ToolArguments {
    pub fn is_hallucination(&self) -> bool {
        matches!(self, ToolArguments::Hallucination(_))
    }
}

impl From<Result<Map<String, Value>, Hallucination>> for ToolArguments {
    fn from(result: Result<Map<String, Value>, Hallucination>) -> Self {
        match result {
            Ok(arguments) => ToolArguments::Parsed(arguments),
            Err(hallucination) => ToolArguments::Hallucination(hallucination),
        }
    }
}

/// Parses a sealed tool call's arguments.
///
/// With `declared` set the call must name one of those tools and its
/// arguments must match the declared parameters. Without it only the shape
/// of the arguments is checked.
pub fn resolve(call: &ToolCall, declared: Option<&[Tool]>) -> ToolArguments {
    check_call(call, declared).into()
}

fn check_call(
    call: &ToolCall,
    declared: Option<&[Tool]>,
) -> Result<Map<String, Value>, Hallucination> {
    if let ToolType::Other(kind) = &call.call_type {
        return Err(Hallucination::new(format!(
            "Unsupported tool type: \"{kind}\", only \"function\" is available"
        )));
    }

    let tool = match declared {
        Some(tools) => Some(
            tools
                .iter()
                .find(|tool| tool.function.name == call.function.name)
                .ok_or_else(|| {
                    Hallucination::new(format!("Unknown function: \"{}\"", call.function.name))
                })?,
        ),
        None => None,
    };

    let arguments = parse_object(&call.function.arguments)?;

    if let Some(tool) = tool {
        check_arguments(tool, &arguments)?;
    }
    Ok(arguments)
}

fn parse_object(text: &str) -> Result<Map<String, Value>, Hallucination> {
    // Functions without parameters sometimes get no argument text at all.
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Hallucination::new(format!(
            "Expected the arguments to be a JSON object, got: {other}"
        ))),
        Err(e) => Err(Hallucination::new(format!(
            "Error parsing JSON arguments {text:?}: {e}"
        ))),
    }
}

fn check_arguments(tool: &Tool, arguments: &Map<String, Value>) -> Result<(), Hallucination> {
    let parameters = &tool.function.parameters;

    for required in &parameters.required {
        if !arguments.contains_key(required) {
            return Err(Hallucination::new(format!(
                "Missing required argument: \"{required}\""
            )));
        }
    }

    for (key, value) in arguments {
        let property = parameters
            .properties
            .get(key)
            .ok_or_else(|| Hallucination::new(format!("Unknown argument: \"{key}\"")))?;
        check_property(key, property, value)?;
    }
    Ok(())
}

fn check_property(
    key: &str,
    property: &FunctionProperty,
    value: &Value,
) -> Result<(), Hallucination> {
    let matches = match property.property_type.as_str() {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown schema types are not checked.
        _ => true,
    };
    if !matches {
        return Err(Hallucination::new(format!(
            "Expected {} for argument \"{key}\", got: {value}",
            article_for(&property.property_type)
        )));
    }

    if let Some(allowed) = &property.allowed_values {
        let accepted = value
            .as_str()
            .is_some_and(|s| allowed.iter().any(|candidate| candidate == s));
        if !accepted {
            return Err(Hallucination::new(format!(
                "Expected one of {allowed:?} for argument \"{key}\", got: {value}"
            )));
        }
    }
    Ok(())
}

fn article_for(property_type: &str) -> String {
    match property_type.chars().next() {
        Some('a' | 'e' | 'i' | 'o' | 'u') => format!("an {property_type}"),
        _ => format!("a {property_type}"),
    }
}

/// Fails on the first declared tool that has no executor.
pub(crate) fn check_executors(
    declared: &[Tool],
    has_executor: impl Fn(&str) -> bool,
) -> Result<(), ChatError> {
    match declared
        .iter()
        .map(|tool| tool.function.name.as_str())
        .find(|name| !has_executor(name))
    {
        Some(name) => Err(ChatError::MissingExecutor(name.to_string())),
        None => Ok(()),
    }
}
