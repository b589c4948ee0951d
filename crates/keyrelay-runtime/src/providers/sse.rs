//! Server-Sent Events decoding for streaming adapters.
//!
//! Only the `event:` and `data:` fields are used. Events end at a blank
//! line; several `data:` lines in one event are joined with `\n`.

use futures::StreamExt;

use super::http::transport_error;
use super::{ChunkSink, LlmError, LlmErrorKind, StreamChunk, TokenUsage};

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// What an adapter extracted from one event.
#[derive(Debug, Default)]
pub(crate) struct ParsedEvent {
    pub text: Option<String>,
    /// Latest complete usage figure, if the event carried one
    pub usage: Option<TokenUsage>,
    /// The provider signalled the end of the completion
    pub done: bool,
}

impl ParsedEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    pub fn skip() -> Self {
        Self::default()
    }
}

/// Incremental byte → event decoder.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split across network reads decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let rest = String::from_utf8_lossy(&rest);
            let line = rest.trim_end_matches(['\n', '\r']).to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Drive a streaming response: decode events, hand them to `parse`, and
/// forward text to `on_chunk` until `parse` reports completion.
///
/// Returns the last usage reported. A body that ends before `parse`
/// reports completion is a [`LlmErrorKind::ServerError`].
pub(crate) async fn pump_sse<F>(
    provider: &str,
    response: reqwest::Response,
    on_chunk: &mut ChunkSink<'_>,
    mut parse: F,
) -> Result<Option<TokenUsage>, LlmError>
where
    F: FnMut(&SseEvent) -> Result<ParsedEvent, LlmError> + Send,
{
    let mut decoder = SseDecoder::new();
    let mut usage = None;
    let mut body = response.bytes_stream();

    while let Some(bytes) = body.next().await {
        let bytes = bytes.map_err(|e| transport_error(provider, e))?;
        for event in decoder.push(&bytes) {
            if handle_event(&event, &mut parse, on_chunk, &mut usage)? {
                return Ok(usage);
            }
        }
    }

    if let Some(event) = decoder.finish() {
        if handle_event(&event, &mut parse, on_chunk, &mut usage)? {
            return Ok(usage);
        }
    }

    Err(LlmError::new(
        LlmErrorKind::ServerError,
        provider,
        "stream ended before completion",
    ))
}

fn handle_event<F>(
    event: &SseEvent,
    parse: &mut F,
    on_chunk: &mut ChunkSink<'_>,
    usage: &mut Option<TokenUsage>,
) -> Result<bool, LlmError>
where
    F: FnMut(&SseEvent) -> Result<ParsedEvent, LlmError>,
{
    let parsed = parse(event)?;
    if let Some(u) = parsed.usage {
        *usage = Some(u);
    }
    if let Some(text) = parsed.text.filter(|t| !t.is_empty()) {
        on_chunk(StreamChunk::text(text));
    }
    if parsed.done {
        on_chunk(StreamChunk::done());
    }
    Ok(parsed.done)
}
