//! Typed representation of one streamed `chat.completion.chunk` event.
//!
//! Chunks are ephemeral: the accumulator consumes them and keeps only the
//! merged per-slot state.

use crate::types::{FinishReason, Role, ToolType, Usage};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatResponseChunk {
    #[serde(default)]
    pub id: String,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: Option<String>,
    /// Per-slot deltas. Empty for the trailing usage-only chunk.
    #[serde(default)]
    pub choices: Vec<ChoiceDelta>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponseChunk {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created, 0).single()
    }
}

/// The delta for one response slot within a chunk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChoiceDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: MessageDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MessageDelta {
    /// Only present on the first chunk of a slot.
    #[serde(default)]
    pub role: Option<Role>,
    /// `None` (or JSON `null`) is a no-op, not an empty string.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

impl MessageDelta {
    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.tool_calls.as_ref().map_or(true, |calls| calls.is_empty())
    }
}

/// A fragment of a tool call, keyed by its position in the slot's tool call list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub call_type: Option<ToolType>,
    #[serde(default)]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}
