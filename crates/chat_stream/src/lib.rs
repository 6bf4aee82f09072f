//! Streaming chat-completion client with tool-call dispatch
//!
//! This crate implements:
//! - Wire types for OpenAI-compatible chat completion requests and responses
//! - Decoding of server-sent event streams into typed chunks
//! - Per-slot accumulation of streamed deltas into finished messages
//! - Reassembly and validation of fragmented tool calls
//! - A bounded request / execute-tools / resend loop over caller-supplied executors
//! - An HTTP transport with OpenAI and Azure URL/authentication shapes


pub mod accumulator;
pub mod assembler;
pub mod chunk;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod dispatch;
pub mod display;
pub mod error;
pub mod openai;
pub mod streaming;
pub mod tools;
pub mod types;

pub use accumulator::{DeltaAccumulator, FinishedSlot, SlotProgress};
pub use assembler::{resolve, ToolArguments, ToolCallAssembler};
pub use chunk::ChatResponseChunk;
pub use config::{AzureConfig, ClientConfig, DispatchConfig};
pub use conversation::Conversation;
pub use decoder::ChunkDecoder;
pub use dispatch::{DispatchLoop, StreamingCallback, StreamingChunk};
pub use error::{ApiError, ApiErrorKind, ChatError, Hallucination, Result, TransportError};
pub use openai::{ChatTransport, OpenAIClient};
pub use streaming::{ChunkStream, HttpChunkStream, ReplayChunkStream};
pub use tools::{FnTool, ToolExecutor, ToolRegistry};
pub use types::*;
