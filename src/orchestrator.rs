//! Loop Controller.
//!
//! Drives one tool-augmented request to completion:
//!
//! ```text
//! Client request (tools merged)
//!     |
//!     v
//! +---------+     +------------+     +-------+
//! | Backend |---->| Orchestr.  |<--->| Tools |
//! +---------+     +------------+     +-------+
//!     ^                 |
//!     +---- history ----+
//! ```
//!
//! The loop ends when the backend answers without tool calls, when its
//! answer cannot be parsed, or when `max_turns` tool rounds have been run
//! and the backend still wants more.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument, Span};

use crate::backend::{Backend, BufferedResponse, ByteStream, ForwardRequest, StreamingResponse};
use crate::config::OrchestrationConfig;
use crate::detect::{detect, Detection};
use crate::dispatch::{dispatch, DispatchSettings};
use crate::error::ProxyError;
use crate::history::append_turn;
use crate::session::Session;
use crate::stream::{error_event, relay_turn, RelayError};
use crate::tools::ToolRegistry;
use crate::types::ToolResult;

/// Events buffered between the loop task and the client connection.
const STREAM_BUFFER: usize = 64;

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    backend: Arc<dyn Backend>,
    max_turns: u32,
    dispatch: DispatchSettings,
    stream_idle: Duration,
}

/// Head of a streamed reply; `body` yields already framed events.
pub struct StreamingReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: mpsc::Receiver<Bytes>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        backend: Arc<dyn Backend>,
        config: &OrchestrationConfig,
        stream_idle: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            max_turns: config.max_turns,
            dispatch: DispatchSettings {
                max_concurrency: config.max_concurrent_tools,
                timeout: config.tool_timeout(),
            },
            stream_idle,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the loop with buffered backend responses.
    ///
    /// `template` carries the method, path and headers reused for every turn.
    pub async fn run_buffered(
        &self,
        session: &mut Session,
        template: &ForwardRequest,
    ) -> Result<BufferedResponse, ProxyError> {
        loop {
            let response = self.backend.send(template.with_body(session.body()?)).await?;
            if !response.status.is_success() {
                warn!(status = %response.status, "Backend returned an error status");
                return Ok(response);
            }

            let (message, calls) = match detect(&response.body) {
                Detection::NotParseable => {
                    debug!("Backend response is not a chat response, relaying as-is");
                    return Ok(response);
                }
                Detection::Final => {
                    info!(turns = session.turns(), "Conversation complete");
                    return Ok(response);
                }
                Detection::ToolCalls { message, calls } => (message, calls),
            };

            if session.turns() >= self.max_turns {
                warn!(turns = session.turns(), "Tool round limit reached");
                return Err(ProxyError::LoopLimitExceeded {
                    turns: session.turns(),
                });
            }

            info!(
                turn = session.turns() + 1,
                calls = calls.len(),
                "Dispatching tool calls"
            );
            let results = dispatch(&self.registry, &calls, self.dispatch).await;
            log_results(&results);
            append_turn(session.messages_mut(), message, &results);
            session.advance();
        }
    }

    /// Run the loop with a streaming backend.
    ///
    /// Returns once the first backend response head is in, so connection
    /// failures surface as a plain error. Everything after that, including
    /// later tool rounds, flows through the returned channel; a failure
    /// mid-stream becomes a final error event.
    pub async fn run_streaming(
        self: &Arc<Self>,
        session: Session,
        template: ForwardRequest,
    ) -> Result<StreamingReply, ProxyError> {
        let StreamingResponse {
            status,
            headers,
            body,
        } = self
            .backend
            .send_streaming(template.with_body(session.body()?))
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        // The loop outlives the handler; keep it under the request's span
        let this = Arc::clone(self);
        tokio::spawn(
            async move { this.drive_stream(session, template, body, tx).await }
                .instrument(Span::current()),
        );

        Ok(StreamingReply {
            status,
            headers,
            body: rx,
        })
    }

    async fn drive_stream(
        &self,
        session: Session,
        template: ForwardRequest,
        body: ByteStream,
        tx: mpsc::Sender<Bytes>,
    ) {
        match self.stream_turns(session, &template, body, &tx).await {
            Ok(()) => {}
            Err(RelayError::ClientGone) => debug!("Client disconnected, stopping"),
            Err(RelayError::Backend(e)) => {
                warn!(error = %e, "Streaming loop failed");
                let _ = tx.send(error_event(&e)).await;
            }
        }
    }

    async fn stream_turns(
        &self,
        mut session: Session,
        template: &ForwardRequest,
        mut body: ByteStream,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<(), RelayError> {
        loop {
            let turn = relay_turn(body, tx, self.stream_idle).await?;
            if !turn.has_tool_calls() {
                info!(turns = session.turns(), "Conversation complete");
                return Ok(());
            }

            if session.turns() >= self.max_turns {
                warn!(turns = session.turns(), "Tool round limit reached");
                return Err(ProxyError::LoopLimitExceeded {
                    turns: session.turns(),
                }
                .into());
            }

            let calls = turn.calls();
            info!(
                turn = session.turns() + 1,
                calls = calls.len(),
                "Dispatching tool calls"
            );
            let results = tokio::select! {
                results = dispatch(&self.registry, &calls, self.dispatch) => results,
                _ = tx.closed() => return Err(RelayError::ClientGone),
            };
            log_results(&results);
            append_turn(session.messages_mut(), turn.into_message(), &results);
            session.advance();

            let request = template.with_body(session.body()?);
            let response = tokio::select! {
                response = self.backend.send_streaming(request) => response?,
                _ = tx.closed() => return Err(RelayError::ClientGone),
            };
            if !response.status.is_success() {
                warn!(status = %response.status, "Backend returned an error status mid-stream");
            }
            body = response.body;
        }
    }
}

fn log_results(results: &[ToolResult]) {
    let failed = results.iter().filter(|r| r.is_error()).count();
    info!(succeeded = results.len() - failed, failed, "Tool round finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Reply, ScriptedBackend};
    use crate::tools::testing::{registry, StaticTool};
    use crate::tools::Tool;
    use crate::types::ChatRequest;
    use axum::http::Method;
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;

    fn config(max_turns: u32) -> OrchestrationConfig {
        OrchestrationConfig {
            max_turns,
            max_concurrent_tools: 4,
            tool_timeout_secs: 5,
            tool_paths: vec!["api/chat".to_string()],
        }
    }

    fn orchestrator(
        tools: Vec<Arc<dyn Tool>>,
        backend: Arc<ScriptedBackend>,
        max_turns: u32,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(registry(tools)),
            backend,
            &config(max_turns),
            Duration::from_secs(5),
        ))
    }

    fn session(content: &str, stream: bool) -> Session {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "qwen3:1.7b",
            "messages": [{"role": "user", "content": content}],
            "stream": stream
        }))
        .unwrap();
        Session::new(request)
    }

    fn template() -> ForwardRequest {
        ForwardRequest {
            method: Method::POST,
            path_and_query: "api/chat".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> Value {
        json!({
            "model": "qwen3:1.7b",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"id": id, "function": {"name": name, "arguments": arguments}}]
            },
            "done": true
        })
    }

    fn final_answer(content: &str) -> Value {
        json!({
            "model": "qwen3:1.7b",
            "message": {"role": "assistant", "content": content},
            "done": true
        })
    }

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<String> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(String::from_utf8(event.to_vec()).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_greeting_round_trip() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Reply::json(tool_call("1", "get_greeting", json!({"name": "Francis"}))),
            Reply::json(final_answer("Hello, Francis!")),
        ]));
        let orchestrator = orchestrator(
            vec![Arc::new(StaticTool::greeting())],
            backend.clone(),
            8,
        );
        let mut session = session("Use tools to greet Francis", false);

        let response = orchestrator
            .run_buffered(&mut session, &template())
            .await
            .unwrap();

        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"]["content"], "Hello, Francis!");
        assert_eq!(session.turns(), 1);

        let sent = backend.request_bodies();
        assert_eq!(sent.len(), 2);
        let history = sent[1]["messages"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1]["role"], "assistant");
        assert_eq!(history[1]["tool_calls"][0]["function"]["name"], "get_greeting");
        assert_eq!(history[2]["role"], "tool");
        assert_eq!(history[2]["content"], "Hello, Francis!");
        assert_eq!(history[2]["tool_call_id"], "1");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_backend() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Reply::json(tool_call("1", "fooBar", json!({}))),
            Reply::json(final_answer("I could not find that tool.")),
        ]));
        let orchestrator = orchestrator(
            vec![Arc::new(StaticTool::greeting())],
            backend.clone(),
            8,
        );
        let mut session = session("Use fooBar", false);

        let response = orchestrator
            .run_buffered(&mut session, &template())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let sent = backend.request_bodies();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["messages"][2]["content"], "tool fooBar not found");
    }

    #[tokio::test]
    async fn test_plain_answer_passes_through() {
        let answer = final_answer("Hi there");
        let backend = Arc::new(ScriptedBackend::new(vec![Reply::json(answer.clone())]));
        let orchestrator = orchestrator(vec![], backend.clone(), 8);
        let mut session = session("hi", false);

        let response = orchestrator
            .run_buffered(&mut session, &template())
            .await
            .unwrap();

        assert_eq!(backend.requests().len(), 1);
        assert_eq!(response.body, Bytes::from(answer.to_string()));
        assert_eq!(session.turns(), 0);
    }

    #[tokio::test]
    async fn test_turn_limit_is_enforced() {
        let tool = Arc::new(StaticTool::greeting());
        let backend = Arc::new(ScriptedBackend::always(Reply::json(tool_call(
            "1",
            "get_greeting",
            json!({"name": "again"}),
        ))));
        let orchestrator = orchestrator(vec![tool.clone()], backend.clone(), 3);
        let mut session = session("loop forever", false);

        let err = orchestrator
            .run_buffered(&mut session, &template())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::LoopLimitExceeded { turns: 3 }));
        assert_eq!(backend.requests().len(), 4);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backend_unavailable() {
        let backend = Arc::new(ScriptedBackend::always(Reply::Unavailable));
        let orchestrator = orchestrator(vec![], backend, 8);
        let err = orchestrator
            .run_buffered(&mut session("hi", false), &template())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unparseable_and_error_responses_are_relayed() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Reply::Body {
                status: StatusCode::OK,
                body: "not json".to_string(),
            },
            Reply::Body {
                status: StatusCode::NOT_FOUND,
                body: json!({"error": "model not found"}).to_string(),
            },
        ]));
        let orchestrator = orchestrator(vec![], backend.clone(), 8);

        let first = orchestrator
            .run_buffered(&mut session("a", false), &template())
            .await
            .unwrap();
        assert_eq!(first.body, Bytes::from_static(b"not json"));

        let second = orchestrator
            .run_buffered(&mut session("b", false), &template())
            .await
            .unwrap();
        assert_eq!(second.status, StatusCode::NOT_FOUND);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_streaming_reenters_loop_after_tool_calls() {
        let call_line = json!({
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_greeting", "arguments": {"name": "Francis"}}}
            ]},
            "done": false
        });
        let done_line = json!({"message": {"role": "assistant", "content": ""}, "done": true});
        let answer_line = json!({"message": {"role": "assistant", "content": "Hello, Francis!"}, "done": false});

        let backend = Arc::new(ScriptedBackend::new(vec![
            Reply::lines(vec![call_line.clone(), done_line.clone()]),
            Reply::lines(vec![answer_line.clone(), done_line.clone()]),
        ]));
        let orchestrator = orchestrator(
            vec![Arc::new(StaticTool::greeting())],
            backend.clone(),
            8,
        );

        let reply = orchestrator
            .run_streaming(session("Use tools to greet Francis", true), template())
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::OK);

        let events = collect(reply.body).await;
        let expected: Vec<String> = [&call_line, &done_line, &answer_line, &done_line]
            .iter()
            .map(|l| format!("data: {}\n\n", l))
            .collect();
        assert_eq!(events, expected);

        let sent = backend.request_bodies();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["stream"], true);
        let history = sent[1]["messages"].as_array().unwrap();
        assert_eq!(history[1]["role"], "assistant");
        assert_eq!(history[1]["tool_calls"].as_array().unwrap().len(), 1);
        assert_eq!(history[2]["role"], "tool");
        assert_eq!(history[2]["tool_call_id"], "call_0");
        assert_eq!(history[2]["content"], "Hello, Francis!");
    }

    #[tokio::test]
    async fn test_streaming_limit_ends_with_error_event() {
        let call_line = json!({
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_greeting", "arguments": {"name": "x"}}}
            ]},
            "done": true
        });
        let backend = Arc::new(ScriptedBackend::always(Reply::lines(vec![call_line])));
        let orchestrator = orchestrator(
            vec![Arc::new(StaticTool::greeting())],
            backend.clone(),
            1,
        );

        let reply = orchestrator
            .run_streaming(session("loop", true), template())
            .await
            .unwrap();
        // The channel closes once the loop gives up
        let events = collect(reply.body).await;

        assert_eq!(events.len(), 3);
        let last = events.last().unwrap();
        let payload: Value =
            serde_json::from_str(last.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(payload["error"]["code"], "tool_loop_limit_exceeded");
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_streaming_connect_failure_is_plain_error() {
        let backend = Arc::new(ScriptedBackend::always(Reply::Unavailable));
        let orchestrator = orchestrator(vec![], backend, 8);
        let result = orchestrator
            .run_streaming(session("hi", true), template())
            .await;
        assert!(matches!(result, Err(ProxyError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_running_tools() {
        let call_line = json!({
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_greeting", "arguments": {"name": "x"}}}
            ]},
            "done": true
        });
        let tool = Arc::new(StaticTool::greeting().with_delay(Duration::from_millis(200)));
        let backend = Arc::new(ScriptedBackend::always(Reply::lines(vec![call_line])));
        let orchestrator = orchestrator(vec![tool.clone()], backend.clone(), 8);

        let mut reply = orchestrator
            .run_streaming(session("greet", true), template())
            .await
            .unwrap();
        assert!(reply.body.recv().await.is_some());

        // Wait for the tool to be running, then hang up
        for _ in 0..100 {
            if tool.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        drop(reply);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(tool.completed.load(Ordering::SeqCst), 0);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_history_keeps_thinking() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Reply::lines(vec![
                json!({"message": {"role": "assistant", "content": "", "thinking": "Need a "}}),
                json!({"message": {"role": "assistant", "content": "", "thinking": "greeting", "tool_calls": [
                    {"function": {"name": "get_greeting", "arguments": {"name": "Ada"}}}
                ]}, "done": true}),
            ]),
            Reply::lines(vec![json!({"message": {"role": "assistant", "content": "Hello, Ada!"}, "done": true})]),
        ]));
        let orchestrator = orchestrator(
            vec![Arc::new(StaticTool::greeting())],
            backend.clone(),
            8,
        );

        let reply = orchestrator
            .run_streaming(session("greet Ada", true), template())
            .await
            .unwrap();
        assert_eq!(collect(reply.body).await.len(), 3);

        let sent = backend.request_bodies();
        assert_eq!(sent[1]["messages"][1]["thinking"], "Need a greeting");
        assert_eq!(sent[1]["messages"][2]["content"], "Hello, Ada!");
    }
}
