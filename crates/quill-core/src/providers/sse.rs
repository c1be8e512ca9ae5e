//! Incremental decoding of `data: {json}` event streams

use std::collections::VecDeque;
use std::future::Future;

use futures::stream::{BoxStream, StreamExt};
use reqwest::RequestBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;

/// Sentinel OpenAI sends after the final chunk
const DONE_SENTINEL: &str = "[DONE]";

/// Await `fut` unless `cancel` fires first
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Splits a byte stream into newline-terminated lines.
///
/// Bytes are buffered until a `\n` arrives so multi-byte characters and
/// JSON payloads split across network chunks are reassembled intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Flush whatever is left once the stream closes
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buffer).trim_end_matches('\r').to_string();
        self.buffer.clear();
        Some(rest)
    }
}

/// Payload of a `data:` line, ignoring `event:`/`id:`/comment lines
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(str::trim)
        .filter(|data| !data.is_empty())
}

/// A server-sent event stream over an HTTP response body
pub struct SseStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    lines: LineBuffer,
    ready: VecDeque<String>,
    exhausted: bool,
}

impl SseStream {
    pub fn new(response: reqwest::Response) -> Self {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Self {
            body,
            lines: LineBuffer::new(),
            ready: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Send `request` and open its body as an event stream.
    ///
    /// Non-2xx responses are read in full and mapped to a [`ProviderError`].
    pub async fn open(
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Self, ProviderError> {
        let response = cancellable(cancel, request.send()).await??;
        let status = response.status();
        if !status.is_success() {
            let body = cancellable(cancel, response.text())
                .await?
                .unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        debug!("Stream opened ({})", status);
        Ok(Self::new(response))
    }

    /// Next `data:` payload; `None` once the stream closes or sends `[DONE]`
    pub async fn next_data(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        loop {
            while let Some(line) = self.ready.pop_front() {
                if let Some(data) = data_payload(&line) {
                    if data == DONE_SENTINEL {
                        self.exhausted = true;
                        self.ready.clear();
                        return Ok(None);
                    }
                    return Ok(Some(data.to_string()));
                }
            }

            if self.exhausted {
                return Ok(None);
            }

            match cancellable(cancel, self.body.next()).await? {
                Some(Ok(chunk)) => self.ready.extend(self.lines.push(&chunk)),
                Some(Err(e)) => return Err(ProviderError::Http(e)),
                None => {
                    self.exhausted = true;
                    if let Some(rest) = self.lines.finish() {
                        self.ready.push_back(rest);
                    }
                }
            }
        }
    }
}
