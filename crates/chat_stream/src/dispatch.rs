//! The request / stream / execute-tools cycle.
//!
//! [`DispatchLoop::run`] streams a completion for the current conversation,
//! appends the finished assistant message and, while that message requests
//! tools, executes them in order, appends their results and asks again.

use crate::accumulator::{DeltaAccumulator, FinishedSlot, SlotProgress};
use crate::assembler::{check_executors, resolve, ToolArguments};
use crate::config::DispatchConfig;
use crate::conversation::Conversation;
use crate::decoder::ChunkDecoder;
use crate::error::{error_payload, ChatError, Hallucination, Result, TransportError};
use crate::openai::ChatTransport;
use crate::tools::ToolRegistry;
use crate::types::{ChatRequest, Message, Tool, ToolCall};
use tracing::{debug, warn};

/// Slot whose message is appended to the conversation.
const PRIMARY_SLOT: u32 = 0;

/// Events delivered to the caller while a run is in progress
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingChunk {
    /// Content fragment of the primary slot
    Text(String),
    /// Argument fragment of a tool call, with whatever metadata is known so far
    InputJson {
        content: String,
        tool_name: Option<String>,
        tool_id: Option<String>,
    },
    /// A tool message was appended to the conversation
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    /// The current streamed response has been fully received
    StreamingComplete,
}

/// Returning an error from the callback abandons the stream.
pub type StreamingCallback = Box<dyn Fn(&StreamingChunk) -> anyhow::Result<()> + Send + Sync>;

pub struct DispatchLoop {
    transport: Box<dyn ChatTransport>,
    config: DispatchConfig,
}

impl DispatchLoop {
    /// Fails with [`ChatError::Config`] when `config` allows no requests.
    pub fn new(transport: Box<dyn ChatTransport>, config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Runs until the model answers without tool calls and returns that answer.
    ///
    /// `request` supplies model and sampling settings; its `messages` are
    /// replaced by the conversation on every iteration. When it declares no
    /// tools, the declarations in `registry` are sent instead.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        request: &ChatRequest,
        registry: &ToolRegistry,
        callback: Option<&StreamingCallback>,
    ) -> Result<Message> {
        let mut template = request.clone();
        if template.tools.is_none() {
            let tools = registry.tools();
            if !tools.is_empty() {
                template.tools = Some(tools);
            }
        }
        if let Some(tools) = &template.tools {
            check_executors(tools, |name| registry.contains(name))?;
        }

        let limit = self.config.max_iterations;
        for iteration in 1..=limit {
            let mut request = template.clone();
            request.messages = conversation.messages().to_vec();
            debug!(
                "Dispatch iteration {}/{} with {} messages",
                iteration,
                limit,
                request.messages.len()
            );

            let finished = self.stream_turn(&request, callback).await?;
            let message = finished.message;
            debug!(
                "Finished with reason {}:\n{}",
                finished.finish_reason.as_str(),
                message
            );
            conversation.push(message.clone());

            if !message.has_tool_calls() {
                return Ok(message);
            }

            // Every tool call gets its reply before a cancellation is reported,
            // so the conversation stays valid for a later request.
            let mut cancelled = None;
            for call in message.tool_calls() {
                let (content, is_error) =
                    execute_call(call, template.tools.as_deref(), registry).await;
                conversation.push(Message::tool(call.id.clone(), content.clone()));
                if cancelled.is_none() {
                    let result = emit(
                        callback,
                        &StreamingChunk::ToolResult {
                            tool_call_id: call.id.clone(),
                            content,
                            is_error,
                        },
                    );
                    cancelled = result.err();
                }
            }
            if let Some(error) = cancelled {
                return Err(error);
            }
        }

        Err(ChatError::IterationLimitExceeded { limit })
    }

    /// Streams one response and returns its primary slot.
    async fn stream_turn(
        &self,
        request: &ChatRequest,
        callback: Option<&StreamingCallback>,
    ) -> Result<FinishedSlot> {
        let source = self.transport.stream(request).await?;
        let mut decoder = ChunkDecoder::new(source);
        let mut accumulator = DeltaAccumulator::new();

        while let Some(chunk) = decoder.next_chunk().await? {
            for progress in accumulator.accept(&chunk)? {
                match progress {
                    SlotProgress::Content { index, fragment } if index == PRIMARY_SLOT => {
                        emit(callback, &StreamingChunk::Text(fragment))?;
                    }
                    SlotProgress::ToolInput {
                        index,
                        content,
                        tool_name,
                        tool_id,
                        ..
                    } if index == PRIMARY_SLOT => {
                        emit(
                            callback,
                            &StreamingChunk::InputJson {
                                content,
                                tool_name,
                                tool_id,
                            },
                        )?;
                    }
                    SlotProgress::Sealed { index, .. } if index != PRIMARY_SLOT => {
                        let dropped = accumulator.finalize(index)?;
                        debug!("Dropping secondary slot {}:\n{}", index, dropped.message);
                    }
                    _ => {}
                }
            }
        }

        let unsealed = accumulator.unsealed_slots();
        if decoder.saw_terminator() {
            if !unsealed.is_empty() {
                return Err(ChatError::protocol(format!(
                    "Stream ended while slots {unsealed:?} had no finish reason"
                )));
            }
        } else if !unsealed.is_empty() || !accumulator.has_slots() {
            return Err(TransportError::Truncated.into());
        } else {
            warn!("Stream closed without a terminator, all slots were sealed");
        }

        emit(callback, &StreamingChunk::StreamingComplete)?;

        if let Some(usage) = accumulator.usage() {
            debug!(
                "Usage: {} prompt + {} completion = {} tokens",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        accumulator.finalize(PRIMARY_SLOT)
    }
}

fn emit(callback: Option<&StreamingCallback>, chunk: &StreamingChunk) -> Result<()> {
    if let Some(callback) = callback {
        if let Err(e) = callback(chunk) {
            debug!("Streaming callback stopped the stream: {}", e);
            return Err(TransportError::Cancelled.into());
        }
    }
    Ok(())
}

/// Produces the content of the tool message answering `call`, and whether it
/// reports an error.
async fn execute_call(
    call: &ToolCall,
    declared: Option<&[Tool]>,
    registry: &ToolRegistry,
) -> (String, bool) {
    let name = call.function.name.as_str();

    let arguments = if declared.is_none() && !registry.contains(name) {
        ToolArguments::Hallucination(Hallucination::new(format!(
            "Unknown function: \"{name}\""
        )))
    } else {
        resolve(call, declared)
    };

    let arguments = match arguments {
        ToolArguments::Parsed(arguments) => arguments,
        ToolArguments::Hallucination(hallucination) => {
            warn!("Hallucinated tool call {}: {}", call.id, hallucination);
            return (hallucination.to_tool_content(), true);
        }
    };

    // Declared tools were checked for executors before the first request.
    let Some(executor) = registry.get(name) else {
        return (error_payload(&format!("Unknown function: \"{name}\"")), true);
    };

    match executor.execute(arguments).await {
        Ok(content) => (content, false),
        Err(e) => {
            warn!("Tool {} failed: {:#}", name, e);
            (error_payload(&format!("{e:#}")), true)
        }
    }
}
