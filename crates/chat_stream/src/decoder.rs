//! Server-sent event decoding.
//!
//! Turns the raw byte stream of a streaming completion into typed
//! [`ChatResponseChunk`]s, one per `data:` event, until the `[DONE]` sentinel.

use crate::chunk::ChatResponseChunk;
use crate::error::{extract_api_error, ChatError, Result};
use crate::streaming::ChunkStream;
use futures::Stream;
use serde_json::Value;
use tracing::{debug, trace};

const DONE_SENTINEL: &str = "[DONE]";

/// Longest line accepted before a newline arrives.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

enum Line {
    Skip,
    Done,
    Chunk(Box<ChatResponseChunk>),
}

/// Lazy, non-restartable decoder over a [`ChunkStream`].
///
/// Lines are split on `\n` at the byte level, so a network chunk boundary
/// falling inside a multi-byte character is harmless.
pub struct ChunkDecoder {
    source: Box<dyn ChunkStream>,
    buffer: Vec<u8>,
    max_line_length: usize,
    source_done: bool,
    saw_terminator: bool,
}

impl ChunkDecoder {
    pub fn new(source: Box<dyn ChunkStream>) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            source_done: false,
            saw_terminator: false,
        }
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// True once the `[DONE]` sentinel has been read.
    pub fn saw_terminator(&self) -> bool {
        self.saw_terminator
    }

    /// Returns the next chunk, or `None` when the stream is over.
    ///
    /// The stream is over after the sentinel, or when the source ends. Callers
    /// tell the two apart with [`saw_terminator`](Self::saw_terminator).
    pub async fn next_chunk(&mut self) -> Result<Option<ChatResponseChunk>> {
        loop {
            if self.saw_terminator {
                return Ok(None);
            }

            if let Some(line) = self.take_line() {
                match decode_line(&line)? {
                    Line::Skip => continue,
                    Line::Done => {
                        debug!("Received stream terminator");
                        self.saw_terminator = true;
                        return Ok(None);
                    }
                    Line::Chunk(chunk) => return Ok(Some(*chunk)),
                }
            }

            if self.source_done {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // Final line without a trailing newline.
                let line = std::mem::take(&mut self.buffer);
                match decode_line(&line)? {
                    Line::Skip => return Ok(None),
                    Line::Done => {
                        self.saw_terminator = true;
                        return Ok(None);
                    }
                    Line::Chunk(chunk) => return Ok(Some(*chunk)),
                }
            }

            // No complete line is buffered at this point.
            if self.buffer.len() > self.max_line_length {
                return Err(ChatError::protocol(format!(
                    "Stream line exceeds {} bytes without a newline",
                    self.max_line_length
                )));
            }

            match self.source.next_chunk().await? {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => self.source_done = true,
            }
        }
    }

    /// Adapts the decoder into a `futures` stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChatResponseChunk>> + Send {
        futures::stream::unfold(Some(self), |decoder| async move {
            let mut decoder = decoder?;
            match decoder.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(decoder))),
                Ok(None) => None,
                // Nothing more is read after an error.
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> Result<Line> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = std::str::from_utf8(raw)
        .map_err(|e| ChatError::protocol(format!("Stream line is not valid UTF-8: {e}")))?;
    trace!("SSE line: '{}'", line);

    if line.trim().is_empty() || line.starts_with(':') {
        return Ok(Line::Skip);
    }

    let Some(data) = line.strip_prefix("data:") else {
        // `event:`, `id:` and `retry:` fields carry nothing we use.
        return Ok(Line::Skip);
    };
    let data = data.strip_prefix(' ').unwrap_or(data).trim_end();

    if data == DONE_SENTINEL {
        return Ok(Line::Done);
    }
    if data.is_empty() {
        return Ok(Line::Skip);
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| ChatError::protocol(format!("Unparseable stream payload '{data}': {e}")))?;

    if let Some(error) = extract_api_error(&value, None) {
        return Err(error);
    }

    let chunk: ChatResponseChunk = serde_json::from_value(value)
        .map_err(|e| ChatError::protocol(format!("Unexpected chunk shape '{data}': {e}")))?;
    Ok(Line::Chunk(Box::new(chunk)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;
    use crate::streaming::ReplayChunkStream;
    use futures::StreamExt;

    fn decoder_for(body: &str, split: usize) -> ChunkDecoder {
        ChunkDecoder::new(Box::new(ReplayChunkStream::split_every(
            body.as_bytes(),
            split,
        )))
    }

    async fn collect(decoder: &mut ChunkDecoder) -> Result<Vec<ChatResponseChunk>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = decoder.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    const BODY: &str = concat!(
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Grüße\"}}]}\r\n\r\n",
        "\n",
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[tokio::test]
    async fn test_overlong_line_is_protocol_error() {
        let mut decoder = decoder_for(BODY, 16).with_max_line_length(200);
        assert_eq!(collect(&mut decoder).await.unwrap().len(), 3);

        let endless = format!("data: {}", "x".repeat(1000));
        let mut decoder = decoder_for(&endless, 16).with_max_line_length(64);
        let error = collect(&mut decoder).await.unwrap_err();
        assert!(error.is_protocol(), "got {error:?}");
        assert!(error.to_string().contains("64 bytes"));
    }

    #[tokio::test]
    async fn test_decodes_events_and_skips_keep_alives() {
        let mut decoder = decoder_for(BODY, 4096);
        let chunks = collect(&mut decoder).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Grüße"));
        assert!(decoder.saw_terminator());
    }

    #[tokio::test]
    async fn test_chunk_boundaries_do_not_matter() {
        for split in [1, 2, 3, 7, 64] {
            let mut decoder = decoder_for(BODY, split);
            let chunks = collect(&mut decoder).await.unwrap();
            assert_eq!(chunks.len(), 3, "split size {split}");
            assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Grüße"));
            assert!(decoder.saw_terminator());
        }
    }

    #[tokio::test]
    async fn test_stops_at_sentinel() {
        let body = "data: [DONE]\n\ndata: {\"choices\":[]}\n\n";
        let mut decoder = decoder_for(body, 4096);
        assert!(decoder.next_chunk().await.unwrap().is_none());
        assert!(decoder.next_chunk().await.unwrap().is_none());
        assert!(decoder.saw_terminator());
    }

    #[tokio::test]
    async fn test_end_without_sentinel() {
        let body = "data: {\"choices\":[]}";
        let mut decoder = decoder_for(body, 4096);
        let chunks = collect(&mut decoder).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!decoder.saw_terminator());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_protocol_error() {
        let body = "data: {\"choices\": [\n\n";
        let mut decoder = decoder_for(body, 4096);
        let error = decoder.next_chunk().await.unwrap_err();
        assert!(error.is_protocol(), "got {error:?}");
    }

    #[tokio::test]
    async fn test_inline_error_event_is_api_error() {
        let body = "data: {\"error\":{\"message\":\"Rate limit reached\",\"type\":\"rate_limit_error\",\"param\":null,\"code\":null}}\n\n";
        let mut decoder = decoder_for(body, 5);
        match decoder.next_chunk().await {
            Err(ChatError::Api(error)) => {
                assert_eq!(error.message, "Rate limit reached");
                assert_eq!(error.kind(), ApiErrorKind::RateLimit);
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_into_stream() {
        let chunks: Vec<_> = decoder_for(BODY, 16).into_stream().collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }
}
