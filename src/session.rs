//! Per-request conversation state.
//!
//! A `Session` is created when a tool-augmented request arrives, owned by
//! the task serving that request, and dropped when the loop terminates.
//! Its id lives on the request's tracing span.

use bytes::Bytes;

use crate::error::ProxyError;
use crate::types::ChatRequest;

#[derive(Debug)]
pub struct Session {
    request: ChatRequest,
    turns: u32,
}

impl Session {
    pub fn new(request: ChatRequest) -> Self {
        Self { request, turns: 0 }
    }

    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    pub fn is_streaming(&self) -> bool {
        self.request.stream
    }

    /// Completed tool rounds so far.
    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn messages_mut(&mut self) -> &mut Vec<crate::types::Message> {
        &mut self.request.messages
    }

    /// Record that a tool round has been appended to the history.
    pub fn advance(&mut self) {
        self.turns += 1;
    }

    /// The full request for the next backend turn.
    pub fn body(&self) -> Result<Bytes, ProxyError> {
        Ok(Bytes::from(serde_json::to_vec(&self.request)?))
    }
}

pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use serde_json::json;

    #[test]
    fn test_generate_session_id() {
        let id = generate_session_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn test_body_reflects_history() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "qwen3:1.7b",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0}
        }))
        .unwrap();
        let mut session = Session::new(request);
        assert!(!session.is_streaming());
        assert_eq!(session.turns(), 0);

        session.messages_mut().push(Message::assistant("hello"));
        session.advance();
        assert_eq!(session.turns(), 1);

        let body: serde_json::Value = serde_json::from_slice(&session.body().unwrap()).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["options"]["temperature"], 0);
    }
}
