//! Streaming Interceptor.
//!
//! Consumes the backend's newline-delimited JSON stream, re-frames every
//! line to the client as `data: <line>\n\n`, and only then inspects the line
//! for tool call fragments. Emission never waits on detection or dispatch.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

use crate::backend::ByteStream;
use crate::error::ProxyError;
use crate::types::{normalize_calls, Message, Role, StreamChunk, ToolCall, ToolCallPayload};

/// Longest backend line accepted before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Frame one backend line as a client event.
pub fn frame(line: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", line))
}

/// Final event carrying a terminal error.
pub fn error_event(err: &ProxyError) -> Bytes {
    frame(&err.to_body().to_string())
}

/// Reassembles lines from arbitrarily split chunks.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn with_limit(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Feed a chunk; returns the complete, non-empty lines it finished.
    ///
    /// Fails once an unterminated line grows past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProxyError> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + pos;
            if let Some(line) = Self::decode(&self.buffer[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            return Err(ProxyError::BackendUnavailable(format!(
                "backend line exceeds {} bytes without a newline",
                self.max_line
            )));
        }
        Ok(lines)
    }

    /// Whatever is left once the stream ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        Self::decode(&raw)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// Tool call fragments and content collected over one streamed turn.
///
/// Other message fields are merged too: string fragments such as
/// `thinking` are concatenated, anything else keeps its last value.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    role: Option<Role>,
    content: String,
    tool_calls: Vec<ToolCallPayload>,
    extra: Map<String, Value>,
}

impl TurnAccumulator {
    /// Inspect one line. Lines that are not chat chunks are ignored.
    pub fn inspect(&mut self, line: &str) {
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(line) else {
            return;
        };
        let Some(delta) = chunk.message else {
            return;
        };

        if delta.role.is_some() {
            self.role = delta.role;
        }
        self.content.push_str(&delta.content);
        self.tool_calls.extend(delta.tool_calls);
        for (key, value) in delta.extra {
            if let (Some(Value::String(acc)), Value::String(fragment)) =
                (self.extra.get_mut(&key), &value)
            {
                acc.push_str(fragment);
                continue;
            }
            self.extra.insert(key, value);
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls().is_empty()
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        normalize_calls(&self.tool_calls)
    }

    /// The assistant turn as the backend produced it, for the history.
    pub fn into_message(self) -> Message {
        let mut message = Message::assistant_with_tool_calls(self.content, self.tool_calls);
        if let Some(role) = self.role {
            message.role = role;
        }
        message.extra = self.extra;
        message
    }
}

#[derive(Debug)]
pub enum RelayError {
    /// The client went away; stop quietly.
    ClientGone,
    Backend(ProxyError),
}

impl From<ProxyError> for RelayError {
    fn from(e: ProxyError) -> Self {
        RelayError::Backend(e)
    }
}

/// Relay one backend stream to the client until it ends.
///
/// Each chunk read is bounded by `idle_timeout`. If the client disconnects
/// the read is abandoned and the backend stream dropped.
pub async fn relay_turn(
    mut body: ByteStream,
    tx: &mpsc::Sender<Bytes>,
    idle_timeout: Duration,
) -> Result<TurnAccumulator, RelayError> {
    let mut splitter = LineSplitter::default();
    let mut acc = TurnAccumulator::default();

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
            _ = tx.closed() => return Err(RelayError::ClientGone),
        };

        let chunk = match next {
            Err(_) => {
                return Err(RelayError::Backend(ProxyError::BackendTimeout(format!(
                    "no data from backend for {:?}",
                    idle_timeout
                ))))
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(RelayError::Backend(e)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        for line in splitter.push(&chunk)? {
            emit(tx, &mut acc, &line).await?;
        }
    }

    if let Some(line) = splitter.finish() {
        emit(tx, &mut acc, &line).await?;
    }
    Ok(acc)
}

async fn emit(
    tx: &mpsc::Sender<Bytes>,
    acc: &mut TurnAccumulator,
    line: &str,
) -> Result<(), RelayError> {
    trace!(line, "Relaying line");
    tx.send(frame(line))
        .await
        .map_err(|_| RelayError::ClientGone)?;
    acc.inspect(line);
    Ok(())
}
