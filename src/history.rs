//! Conversation History Builder.

use crate::types::{Message, ToolResult};

/// Append one tool round: the assistant message that asked for the tools,
/// untouched, followed by one tool message per result in call order.
pub fn append_turn(messages: &mut Vec<Message>, assistant: Message, results: &[ToolResult]) {
    messages.reserve(results.len() + 1);
    messages.push(assistant);
    messages.extend(results.iter().map(ToolResult::to_message));
}
