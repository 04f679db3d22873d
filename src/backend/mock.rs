//! Scripted in-memory backend for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;

use super::{Backend, BufferedResponse, ForwardRequest, StreamingResponse};
use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub enum Reply {
    /// A complete body with the given status
    Body { status: StatusCode, body: String },
    /// A streamed body, one chunk per entry (chunks need not align with lines)
    Chunks(Vec<String>),
    Unavailable,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Reply::Body {
            status: StatusCode::OK,
            body: value.to_string(),
        }
    }

    /// Stream of newline-terminated JSON lines.
    pub fn lines(lines: Vec<Value>) -> Self {
        Reply::Chunks(lines.into_iter().map(|l| format!("{}\n", l)).collect())
    }
}

/// Replies in order; once the script is exhausted, repeats `fallback`.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Reply>>,
    fallback: Option<Reply>,
    requests: Mutex<Vec<ForwardRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(vec![])
        }
    }

    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Bodies sent so far, parsed as JSON.
    pub fn request_bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    fn next_reply(&self, request: ForwardRequest) -> Reply {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .expect("scripted backend ran out of replies")
    }

    fn headers(content_type: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn send(&self, request: ForwardRequest) -> Result<BufferedResponse, ProxyError> {
        match self.next_reply(request) {
            Reply::Body { status, body } => Ok(BufferedResponse {
                status,
                headers: Self::headers("application/json; charset=utf-8"),
                body: Bytes::from(body),
            }),
            Reply::Chunks(chunks) => Ok(BufferedResponse {
                status: StatusCode::OK,
                headers: Self::headers("application/x-ndjson"),
                body: Bytes::from(chunks.concat()),
            }),
            Reply::Unavailable => Err(ProxyError::BackendUnavailable(
                "connection refused".to_string(),
            )),
        }
    }

    async fn send_streaming(
        &self,
        request: ForwardRequest,
    ) -> Result<StreamingResponse, ProxyError> {
        let (status, chunks) = match self.next_reply(request) {
            Reply::Body { status, body } => (status, vec![body]),
            Reply::Chunks(chunks) => (StatusCode::OK, chunks),
            Reply::Unavailable => {
                return Err(ProxyError::BackendUnavailable(
                    "connection refused".to_string(),
                ))
            }
        };
        let body = futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        Ok(StreamingResponse {
            status,
            headers: Self::headers("application/x-ndjson"),
            body: body.boxed(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
