//! Per-slot merging of streamed deltas into finished messages.
//!
//! Each slot index moves through `Empty -> Accumulating -> Sealed`. An index
//! that was never referenced is Empty and has no entry in the map. The first
//! non-null finish reason seals a slot and nothing moves it out of Sealed.

use crate::assembler::ToolCallAssembler;
use crate::chunk::{ChatResponseChunk, ChoiceDelta};
use crate::error::{ChatError, Result};
use crate::types::{FinishReason, Message, Role, Usage};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Something observable that happened while merging a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotProgress {
    /// A non-empty text fragment was appended to the slot's content.
    Content { index: u32, fragment: String },
    /// A non-empty argument fragment was appended to one of the slot's tool calls.
    ToolInput {
        index: u32,
        tool_index: u32,
        content: String,
        tool_name: Option<String>,
        tool_id: Option<String>,
    },
    /// The slot received its finish reason and can be finalized.
    Sealed {
        index: u32,
        finish_reason: FinishReason,
    },
}

/// A sealed slot, converted into a conversation message.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSlot {
    pub index: u32,
    pub message: Message,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Default)]
struct SlotBuffer {
    role: Option<Role>,
    content: Option<String>,
    tool_calls: ToolCallAssembler,
}

impl SlotBuffer {
    fn into_message(self) -> Message {
        let tool_calls = self.tool_calls.seal();
        let content = match self.content {
            Some(content) => Some(content),
            None if !tool_calls.is_empty() => None,
            None => Some(String::new()),
        };
        Message {
            role: self.role.unwrap_or(Role::Assistant),
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Accumulating(SlotBuffer),
    /// `None` once the finished slot has been handed out.
    Sealed(Option<FinishedSlot>),
}

/// Merges the chunks of one streamed response. One instance per request.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    slots: BTreeMap<u32, SlotState>,
    usage: Option<Usage>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one chunk, returning what changed in the order it happened.
    pub fn accept(&mut self, chunk: &ChatResponseChunk) -> Result<Vec<SlotProgress>> {
        let mut progress = Vec::new();
        for choice in &chunk.choices {
            self.accept_choice(choice, &mut progress)?;
        }
        if let Some(usage) = chunk.usage {
            trace!("Usage reported: {:?}", usage);
            self.usage = Some(usage);
        }
        Ok(progress)
    }

    fn accept_choice(
        &mut self,
        choice: &ChoiceDelta,
        progress: &mut Vec<SlotProgress>,
    ) -> Result<()> {
        let index = choice.index;
        let delta = &choice.delta;

        let opened = !self.slots.contains_key(&index);
        let state = self
            .slots
            .entry(index)
            .or_insert_with(|| SlotState::Accumulating(SlotBuffer::default()));

        let buffer = match &mut *state {
            SlotState::Accumulating(buffer) => buffer,
            SlotState::Sealed(_) => {
                if let Some(reason) = &choice.finish_reason {
                    return Err(ChatError::protocol(format!(
                        "Duplicate finish reason \"{}\" for sealed slot {index}",
                        reason.as_str()
                    )));
                }
                let carries_content = delta.content.as_deref().is_some_and(|c| !c.is_empty())
                    || delta.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty());
                if carries_content {
                    return Err(ChatError::protocol(format!(
                        "Received a fragment for sealed slot {index}"
                    )));
                }
                return Ok(());
            }
        };

        // Only the opening chunk decides the role.
        if opened {
            buffer.role = delta.role.clone();
        }

        if let Some(fragment) = &delta.content {
            buffer
                .content
                .get_or_insert_with(String::new)
                .push_str(fragment);
            if !fragment.is_empty() {
                progress.push(SlotProgress::Content {
                    index,
                    fragment: fragment.clone(),
                });
            }
        }

        for tool_delta in delta.tool_calls.iter().flatten() {
            let call = buffer.tool_calls.apply(tool_delta);
            let fragment = tool_delta
                .function
                .as_ref()
                .and_then(|f| f.arguments.as_deref())
                .unwrap_or_default();
            if !fragment.is_empty() {
                progress.push(SlotProgress::ToolInput {
                    index,
                    tool_index: tool_delta.index,
                    content: fragment.to_string(),
                    tool_name: (!call.name.is_empty()).then(|| call.name.clone()),
                    tool_id: call.id.clone(),
                });
            }
        }

        if let Some(reason) = &choice.finish_reason {
            if let SlotState::Accumulating(buffer) =
                std::mem::replace(state, SlotState::Sealed(None))
            {
                debug!("Slot {} sealed with finish reason {}", index, reason.as_str());
                *state = SlotState::Sealed(Some(FinishedSlot {
                    index,
                    message: buffer.into_message(),
                    finish_reason: reason.clone(),
                }));
            }
            progress.push(SlotProgress::Sealed {
                index,
                finish_reason: reason.clone(),
            });
        }

        Ok(())
    }

    /// Hands out the finished message of a sealed slot.
    ///
    /// Fails for an index that was never seen, is still accumulating, or was
    /// already finalized.
    pub fn finalize(&mut self, index: u32) -> Result<FinishedSlot> {
        match self.slots.get_mut(&index) {
            Some(SlotState::Sealed(finished)) => finished.take().ok_or_else(|| {
                ChatError::protocol(format!("Slot {index} was already finalized"))
            }),
            Some(SlotState::Accumulating(_)) => Err(ChatError::protocol(format!(
                "Slot {index} has no finish reason yet"
            ))),
            None => Err(ChatError::protocol(format!("Missing slot {index}"))),
        }
    }

    pub fn is_sealed(&self, index: u32) -> bool {
        matches!(self.slots.get(&index), Some(SlotState::Sealed(_)))
    }

    /// Indices that were referenced but never received a finish reason.
    pub fn unsealed_slots(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, state)| matches!(state, SlotState::Accumulating(_)))
            .map(|(index, _)| *index)
            .collect()
    }

    /// Indices of sealed slots whose message has not been handed out yet.
    pub fn pending_finished(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, state)| matches!(state, SlotState::Sealed(Some(_))))
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{resolve, ToolArguments};
    use serde_json::json;

    fn chunk(value: serde_json::Value) -> ChatResponseChunk {
        serde_json::from_value(value).unwrap()
    }

    fn content_chunk(index: u32, content: Option<&str>) -> ChatResponseChunk {
        chunk(json!({"id": "c", "created": 1, "choices": [
            {"index": index, "delta": {"content": content}, "finish_reason": null}
        ]}))
    }

    fn finish_chunk(index: u32, reason: &str) -> ChatResponseChunk {
        chunk(json!({"id": "c", "created": 1, "choices": [
            {"index": index, "delta": {}, "finish_reason": reason}
        ]}))
    }

    fn tool_chunk(name: Option<&str>, arguments: Option<&str>, id: Option<&str>) -> ChatResponseChunk {
        let mut function = serde_json::Map::new();
        if let Some(name) = name {
            function.insert("name".into(), json!(name));
        }
        if let Some(arguments) = arguments {
            function.insert("arguments".into(), json!(arguments));
        }
        chunk(json!({"id": "c", "created": 1, "choices": [{"index": 0, "delta": {
            "tool_calls": [{"index": 0, "id": id, "type": id.map(|_| "function"), "function": function}]
        }}]}))
    }

    #[test]
    fn test_text_response() {
        let mut accumulator = DeltaAccumulator::new();
        let chunks = [
            chunk(json!({"id": "c", "created": 1, "choices": [{"index": 0, "delta": {"role": "assistant"}}]})),
            content_chunk(0, Some("Hel")),
            content_chunk(0, Some("lo")),
            finish_chunk(0, "stop"),
        ];

        let mut fragments = Vec::new();
        for chunk in &chunks {
            for progress in accumulator.accept(chunk).unwrap() {
                if let SlotProgress::Content { fragment, .. } = progress {
                    fragments.push(fragment);
                }
            }
        }
        assert_eq!(fragments, vec!["Hel", "lo"]);

        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.finish_reason, FinishReason::Stop);
        assert_eq!(finished.message.role, Role::Assistant);
        assert_eq!(finished.message.content.as_deref(), Some("Hello"));
        assert!(finished.message.tool_calls.is_none());
    }

    #[test]
    fn test_tool_call_response() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&tool_chunk(Some("get_"), None, Some("call_9"))).unwrap();
        accumulator.accept(&tool_chunk(Some("weather"), Some("{\"city\":"), None)).unwrap();
        let progress = accumulator.accept(&tool_chunk(None, Some("\"Paris\"}"), None)).unwrap();
        assert_eq!(
            progress,
            vec![SlotProgress::ToolInput {
                index: 0,
                tool_index: 0,
                content: "\"Paris\"}".to_string(),
                tool_name: Some("get_weather".to_string()),
                tool_id: Some("call_9".to_string()),
            }]
        );
        accumulator.accept(&finish_chunk(0, "tool_calls")).unwrap();

        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.finish_reason, FinishReason::ToolCalls);
        assert!(finished.message.content.is_none());
        let calls = finished.message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].function.name, "get_weather");
        match resolve(&calls[0], None) {
            ToolArguments::Parsed(arguments) => {
                assert_eq!(serde_json::Value::Object(arguments), json!({"city": "Paris"}))
            }
            other => panic!("expected parsed arguments, got {other:?}"),
        }
    }

    #[test]
    fn test_null_content_is_a_no_op() {
        let with_null = [
            content_chunk(0, Some("a")),
            content_chunk(0, None),
            content_chunk(0, Some("b")),
            finish_chunk(0, "stop"),
        ];
        let mut accumulator = DeltaAccumulator::new();
        for chunk in &with_null {
            accumulator.accept(chunk).unwrap();
        }
        assert_eq!(accumulator.finalize(0).unwrap().message.content.as_deref(), Some("ab"));
    }

    #[test]
    fn test_role_comes_from_opening_chunk() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&content_chunk(0, Some("Hi"))).unwrap();
        accumulator
            .accept(&chunk(json!({"id": "c", "created": 1, "choices": [{"index": 0, "delta": {"role": "system"}}]})))
            .unwrap();
        accumulator.accept(&finish_chunk(0, "stop")).unwrap();

        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.message.role, Role::Assistant);
        assert_eq!(finished.message.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_content_concatenation_in_arrival_order() {
        let fragments = ["The", " quick", "", " brown", " 🦊", "."];
        let mut accumulator = DeltaAccumulator::new();
        for fragment in fragments {
            accumulator.accept(&content_chunk(0, Some(fragment))).unwrap();
        }
        accumulator.accept(&finish_chunk(0, "length")).unwrap();
        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.message.content.unwrap(), fragments.concat());
        assert_eq!(finished.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_duplicate_finish_reason_is_protocol_error() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&content_chunk(0, Some("Hi"))).unwrap();
        accumulator.accept(&finish_chunk(0, "stop")).unwrap();

        let error = accumulator.accept(&finish_chunk(0, "length")).unwrap_err();
        assert!(error.is_protocol(), "got {error:?}");

        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.message.content.as_deref(), Some("Hi"));
        assert_eq!(finished.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_fragments_after_seal() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&finish_chunk(0, "stop")).unwrap();
        assert!(accumulator.accept(&content_chunk(0, None)).unwrap().is_empty());
        assert!(accumulator.accept(&content_chunk(0, Some("late"))).unwrap_err().is_protocol());
    }

    #[test]
    fn test_finalize_errors() {
        let mut accumulator = DeltaAccumulator::new();
        assert!(accumulator.finalize(0).unwrap_err().is_protocol());

        accumulator.accept(&content_chunk(0, Some("x"))).unwrap();
        assert!(accumulator.finalize(0).unwrap_err().is_protocol());
        assert_eq!(accumulator.unsealed_slots(), vec![0]);

        accumulator.accept(&finish_chunk(0, "stop")).unwrap();
        assert!(accumulator.finalize(0).is_ok());
        assert!(accumulator.finalize(0).unwrap_err().is_protocol());
    }

    #[test]
    fn test_slots_are_independent() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&chunk(json!({"choices": [
            {"index": 0, "delta": {"role": "assistant", "content": "A"}},
            {"index": 1, "delta": {"role": "assistant", "content": "B"}}
        ]}))).unwrap();
        accumulator.accept(&finish_chunk(1, "stop")).unwrap();
        accumulator.accept(&content_chunk(0, Some("A"))).unwrap();
        accumulator.accept(&finish_chunk(0, "stop")).unwrap();

        assert_eq!(accumulator.pending_finished(), vec![0, 1]);
        assert_eq!(accumulator.finalize(0).unwrap().message.content.as_deref(), Some("AA"));
        assert_eq!(accumulator.finalize(1).unwrap().message.content.as_deref(), Some("B"));
    }

    #[test]
    fn test_empty_response_has_empty_content() {
        let mut accumulator = DeltaAccumulator::new();
        accumulator.accept(&finish_chunk(0, "content_filter")).unwrap();
        let finished = accumulator.finalize(0).unwrap();
        assert_eq!(finished.message.content.as_deref(), Some(""));
        assert_eq!(finished.finish_reason, FinishReason::ContentFilter);
    }

    #[test]
    fn test_records_usage() {
        let mut accumulator = DeltaAccumulator::new();
        let progress = accumulator
            .accept(&chunk(json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}})))
            .unwrap();
        assert!(progress.is_empty());
        assert!(!accumulator.has_slots());
        assert_eq!(accumulator.usage().unwrap().total_tokens, 7);
    }
}
