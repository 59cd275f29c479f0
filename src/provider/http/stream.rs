//! Server-sent event stream: incremental parsing of `text/event-stream` bodies

use crate::error::{Result, SessionError};
use crate::provider::EventStream;
use crate::types::RawEvent;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;

/// Incremental SSE parser
///
/// Buffers raw bytes and splits lines on `\n`, `\r\n` or `\r`, so chunk
/// boundaries may fall anywhere, including inside a UTF-8 sequence or a
/// line terminator. Yields one `RawEvent` per complete block. A block without
/// an `event:` field is expected to carry a whole `{event, data}` unit in its
/// data.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Last line ended in `\r`; a leading `\n` belongs to it
    skip_lf: bool,
    block: Block,
}

#[derive(Debug, Default)]
struct Block {
    tag: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl Block {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.data.is_empty()
    }

    fn push_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.tag = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(self) -> Option<RawEvent> {
        if self.data.is_empty() && self.tag.is_none() {
            return None;
        }
        let data = self.data.join("\n");

        let mut raw = match self.tag {
            Some(tag) => RawEvent::new(
                tag,
                serde_json::from_str(&data).unwrap_or(serde_json::Value::String(data)),
            ),
            None => match serde_json::from_str::<RawEvent>(&data) {
                Ok(raw) => raw,
                // untagged and not a unit: let the decoder quarantine it
                Err(_) => RawEvent::new("", serde_json::Value::String(data)),
            },
        };

        // the SSE id stands in for a missing payload event_id
        if let (Some(id), Some(obj)) = (self.id, raw.data.as_object_mut()) {
            if !id.is_empty() && !obj.contains_key("event_id") {
                obj.insert("event_id".into(), serde_json::Value::String(id));
            }
        }
        Some(raw)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk.as_ref());

        let mut events = Vec::new();
        loop {
            if self.skip_lf {
                match self.buffer.first() {
                    None => break,
                    Some(b'\n') => {
                        self.buffer.drain(..1);
                    }
                    Some(_) => {}
                }
                self.skip_lf = false;
            }

            let Some(end) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            if line.pop() == Some(b'\r') {
                self.skip_lf = true;
            }

            // only complete lines are decoded
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if let Some(event) = std::mem::take(&mut self.block).dispatch() {
                    events.push(event);
                }
            } else {
                self.block.push_line(&line);
            }
        }
        events
    }

    /// Whether a partial block is still buffered
    pub fn has_pending(&self) -> bool {
        !self.block.is_empty() || self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

/// `EventStream` over a streaming HTTP response body
pub struct SseStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    ready: VecDeque<RawEvent>,
}

impl SseStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self::from_stream(response.bytes_stream().boxed())
    }

    pub(crate) fn from_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl EventStream for SseStream {
    async fn next(&mut self) -> Result<Option<RawEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.parser.feed(&chunk)),
                Some(Err(e)) => {
                    return Err(SessionError::Stream(format!("event stream read failed: {}", e)))
                }
                None => {
                    if self.parser.has_pending() {
                        tracing::warn!("Event stream ended inside an unterminated block");
                    }
                    return Ok(None);
                }
            }
        }
    }
}
