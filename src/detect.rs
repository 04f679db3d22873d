//! Tool Call Detector for buffered responses.
//!
//! The streaming counterpart lives in [`crate::stream`], which applies the
//! same extraction line by line.

use crate::types::{ChatResponse, Message, ToolCall};

/// What a buffered backend response asks the loop to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Not the expected `{message: ...}` structure; relay as-is.
    NotParseable,
    /// A well-formed final answer.
    Final,
    /// The model wants tools run. `message` is the assistant turn to append.
    ToolCalls {
        message: Message,
        calls: Vec<ToolCall>,
    },
}

/// Inspect a buffered response body. Pure: the same body always yields the
/// same detection.
pub fn detect(body: &[u8]) -> Detection {
    let response: ChatResponse = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => return Detection::NotParseable,
    };

    // Entries that cannot be serviced do not count as a tool request
    let calls = response.message.calls();
    if calls.is_empty() {
        return Detection::Final;
    }

    Detection::ToolCalls {
        message: response.message,
        calls,
    }
}
