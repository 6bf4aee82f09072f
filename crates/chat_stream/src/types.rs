use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Who authored a message.
///
/// Unknown values sent by the server are preserved in `Other` instead of
/// failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::Other(value),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other(value) => value,
        }
    }
}

/// Why the model stopped generating tokens for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    /// The model produced a complete answer.
    Stop,
    /// The token limit was reached; the message is incomplete.
    Length,
    /// The model wants one or more tools to be called.
    ToolCalls,
    /// Output was withheld by the content filter.
    ContentFilter,
    /// Legacy single-function calling.
    FunctionCall,
    Other(String),
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            "function_call" => FinishReason::FunctionCall,
            _ => FinishReason::Other(value),
        }
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        reason.as_str().to_string()
    }
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::FunctionCall => "function_call",
            FinishReason::Other(value) => value,
        }
    }
}

/// Kind of a tool. Only functions exist today.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolType {
    #[default]
    Function,
    Other(String),
}

impl From<String> for ToolType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "function" => ToolType::Function,
            _ => ToolType::Other(value),
        }
    }
}

impl From<ToolType> for String {
    fn from(tool_type: ToolType) -> Self {
        match tool_type {
            ToolType::Function => "function".to_string(),
            ToolType::Other(value) => value,
        }
    }
}

/// A function invocation requested by the model. `arguments` is the raw
/// JSON text exactly as the model produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: ToolType,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new_function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: ToolType::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Text content. `None` for assistant messages that only carry tool calls.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call this message answers. Only set for `Role::Tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Reply to the tool call identified by `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Returns the tool calls of this message, or an empty slice.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }
}

/// A single declared parameter of a function tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
}

impl FunctionProperty {
    pub fn new(property_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            property_type: property_type.into(),
            description: Some(description.into()),
            allowed_values: None,
        }
    }
}

/// JSON-schema style description of a function's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, FunctionProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: FunctionParameters,
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            parameters: FunctionParameters::default(),
        }
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        property: FunctionProperty,
        required: bool,
    ) -> Self {
        let name = name.into();
        if required && !self.parameters.required.contains(&name) {
            self.parameters.required.push(name.clone());
        }
        self.parameters.properties.insert(name, property);
        self
    }

    pub fn with_string_param(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.with_parameter(name, FunctionProperty::new("string", description), required)
    }

    pub fn with_integer_param(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.with_parameter(name, FunctionProperty::new("integer", description), required)
    }

    pub fn with_number_param(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.with_parameter(name, FunctionProperty::new("number", description), required)
    }

    pub fn with_boolean_param(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.with_parameter(name, FunctionProperty::new("boolean", description), required)
    }

    pub fn with_enum_param<I, S>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        values: I,
        required: bool,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut property = FunctionProperty::new("string", description);
        property.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self.with_parameter(name, property, required)
    }

    pub fn into_tool(self) -> Tool {
        Tool {
            tool_type: ToolType::Function,
            function: self,
        }
    }
}

/// A tool declaration sent with the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default)]
    pub tool_type: ToolType,
    pub function: FunctionTool,
}

/// Controls whether and which tool the model may call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Function(String),
}

impl Serialize for ToolChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Required => serializer.serialize_str("required"),
            ToolChoice::Function(name) => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            })
            .serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Request body for the chat completions endpoint.
///
/// `stream` is managed by the transport: `ChatTransport::stream` sets it,
/// `ChatTransport::send` clears it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
            top_p: None,
            n: None,
            stream: None,
            stream_options: None,
            stop: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            logit_bias: None,
            seed: None,
            user: None,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_tool(mut self, tool: FunctionTool) -> Self {
        self.tools.get_or_insert_with(Vec::new).push(tool.into_tool());
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub(crate) fn into_streaming(mut self) -> Self {
        self.stream = Some(true);
        self.stream_options = Some(StreamOptions {
            include_usage: true,
        });
        self
    }

    pub(crate) fn into_non_streaming(mut self) -> Self {
        self.stream = None;
        self.stream_options = None;
        self
    }
}

/// Token accounting reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Complete (non-streaming) chat completion response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The primary choice, if the server returned any.
    pub fn first_message(&self) -> Option<&Message> {
        self.choices.first().map(|choice| &choice.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_round_trips_unknown_values() {
        let role: Role = serde_json::from_value(json!("developer")).unwrap();
        assert_eq!(role, Role::Other("developer".to_string()));
        assert_eq!(serde_json::to_value(&role).unwrap(), json!("developer"));

        let role: Role = serde_json::from_value(json!("tool")).unwrap();
        assert_eq!(role, Role::Tool);
    }

    #[test]
    fn test_finish_reason_keeps_unknown_values() {
        let reason: FinishReason = serde_json::from_value(json!("eos")).unwrap();
        assert_eq!(reason, FinishReason::Other("eos".to_string()));
        let reason: FinishReason = serde_json::from_value(json!("tool_calls")).unwrap();
        assert_eq!(reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_request_serializes_wire_names() {
        let request = ChatRequest::new("gpt-4o-mini")
            .with_messages(vec![
                Message::system("Be brief."),
                Message::tool("call_1", "{\"ok\":true}"),
            ])
            .with_temperature(0.5)
            .with_max_tokens(64)
            .with_tool(
                FunctionTool::new("get_weather", "Get the weather")
                    .with_string_param("city", "City name", true)
                    .with_enum_param("unit", "Unit", ["celsius", "fahrenheit"], false),
            )
            .with_tool_choice(ToolChoice::Function("get_weather".to_string()));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["max_tokens"], 64);
        assert!(value.get("stream").is_none());
        assert!(value.get("top_p").is_none());
        assert_eq!(value["messages"][1]["role"], "tool");
        assert_eq!(value["messages"][1]["tool_call_id"], "call_1");
        assert!(value["messages"][0].get("tool_call_id").is_none());
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["parameters"]["required"], json!(["city"]));
        assert_eq!(
            value["tools"][0]["function"]["parameters"]["properties"]["unit"]["enum"],
            json!(["celsius", "fahrenheit"])
        );
        assert_eq!(
            value["tool_choice"],
            json!({"type": "function", "function": {"name": "get_weather"}})
        );
    }

    #[test]
    fn test_streaming_request_requests_usage() {
        let value = serde_json::to_value(ChatRequest::new("m").into_streaming()).unwrap();
        assert_eq!(value["stream"], true);
        assert_eq!(value["stream_options"]["include_usage"], true);

        let value = serde_json::to_value(ChatRequest::new("m").into_streaming().into_non_streaming())
            .unwrap();
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn test_assistant_tool_call_message_serializes_null_content() {
        let message = Message {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall::new_function("call_1", "f", "{}")]),
            tool_call_id: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value["content"].is_null());
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["arguments"], "{}");
    }
}
