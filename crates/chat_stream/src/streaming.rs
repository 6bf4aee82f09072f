//! Byte-level chunk sources for streamed responses.
//!
//! The decoder reads from a [`ChunkStream`] so that live HTTP bodies and
//! replayed captures go through identical processing.

use crate::error::{Result, TransportError};
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use std::time::Duration;

/// A source of raw response body bytes. Chunk boundaries are arbitrary and
/// carry no meaning.
#[async_trait]
pub trait ChunkStream: Send {
    /// Returns the next piece of the body, or `None` once the body has ended.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Live HTTP response body.
pub struct HttpChunkStream {
    response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(TransportError::Network(format!("HTTP chunk error: {e}")).into()),
        }
    }
}

/// Replays a captured body, one stored piece per call.
pub struct ReplayChunkStream {
    chunks: VecDeque<Vec<u8>>,
    delay: Option<Duration>,
}

impl ReplayChunkStream {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: None,
        }
    }

    /// Builds a stream that emits `body` in pieces of at most `size` bytes.
    /// Splits may fall inside UTF-8 sequences.
    pub fn split_every(body: &[u8], size: usize) -> Self {
        Self::new(body.chunks(size.max(1)).map(<[u8]>::to_vec))
    }

    /// Sleeps before every chunk, to simulate a slow server.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ChunkStream for ReplayChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(None);
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Some(chunk))
    }
}
