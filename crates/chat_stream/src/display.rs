use crate::conversation::Conversation;
use crate::types::{Message, Role, ToolCall};
use std::fmt;

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ToolCall: id={}, name={}", self.id, self.function.name)?;
        let arguments = serde_json::from_str::<serde_json::Value>(&self.function.arguments)
            .ok()
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| self.function.arguments.clone());
        writeln!(f, "  Arguments: {}", arguments.replace('\n', "\n  "))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tool_call_id {
            Some(id) => writeln!(f, "Message [{}] for {id}:", self.role)?,
            None => writeln!(f, "Message [{}]:", self.role)?,
        }
        if let Some(content) = &self.content {
            writeln!(f, "  Text: {}", content.replace('\n', "\n    "))?;
        }
        for call in self.tool_calls() {
            for line in call.to_string().lines() {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in self.messages() {
            write!(f, "{message}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display() {
        let message = Message {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall::new_function(
                "call_1",
                "get_weather",
                r#"{"city":"Paris"}"#,
            )]),
            tool_call_id: None,
        };
        let rendered = message.to_string();
        assert!(rendered.starts_with("Message [assistant]:\n"));
        assert!(rendered.contains("ToolCall: id=call_1, name=get_weather"));
        assert!(rendered.contains("\"city\": \"Paris\""));

        let rendered = Message::tool("call_1", "sunny").to_string();
        assert_eq!(rendered, "Message [tool] for call_1:\n  Text: sunny\n");
    }

    #[test]
    fn test_malformed_arguments_are_shown_raw() {
        let call = ToolCall::new_function("call_1", "f", "{city: Paris}");
        assert!(call.to_string().contains("Arguments: {city: Paris}"));
    }
}
