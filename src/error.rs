//! Error types for the proxy.
//!
//! `ProxyError` covers failures that end a client request (backend
//! unreachable, runaway tool loop). `ToolError` covers tool-level failures,
//! which are never fatal: they are rendered into the conversation so the
//! model can react.

use std::time::Duration;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

pub const HEADER_ERROR_CODE: &str = "X-Mcp-Proxy-Error-Code";

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend could not be reached or the connection broke.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend did not answer within the configured bound.
    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    /// The backend kept requesting tools after the configured number of rounds.
    #[error("backend still requested tools after {turns} tool rounds")]
    LoopLimitExceeded { turns: u32 },

    #[error("method {0} is not supported")]
    MethodNotAllowed(String),

    #[error("failed to encode request for backend: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::LoopLimitExceeded { .. } => StatusCode::LOOP_DETECTED,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::BackendUnavailable(_) => "backend_unavailable",
            ProxyError::BackendTimeout(_) => "backend_timeout",
            ProxyError::LoopLimitExceeded { .. } => "tool_loop_limit_exceeded",
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::Encode(_) => "internal_error",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BackendUnavailable(_) | ProxyError::BackendTimeout(_) => "upstream_error",
            ProxyError::LoopLimitExceeded { .. } => "tool_loop_error",
            ProxyError::MethodNotAllowed(_) => "invalid_request_error",
            ProxyError::Encode(_) => "internal_error",
        }
    }

    /// JSON error body, shared by plain responses and the final event of a stream.
    pub fn to_body(&self) -> Value {
        json!({
            "error": {
                "type": self.error_type(),
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::BackendTimeout(e.to_string())
        } else {
            ProxyError::BackendUnavailable(e.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.to_body())).into_response();
        response
            .headers_mut()
            .insert(HEADER_ERROR_CODE, HeaderValue::from_static(self.code()));
        response
    }
}

/// A tool call that could not produce output.
///
/// The `Display` form is exactly what the backend sees as the tool message.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {0} not found")]
    UnknownTool(String),

    #[error("tool {name} failed: invalid arguments: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("tool {name} failed: {message}")]
    Invocation { name: String, message: String },

    #[error("tool {name} failed: timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{name}' is already registered by '{source_name}'")]
    DuplicateTool { name: String, source_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_messages() {
        assert_eq!(
            ToolError::UnknownTool("fooBar".to_string()).to_string(),
            "tool fooBar not found"
        );
        let err = ToolError::Timeout {
            name: "slow".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "tool slow failed: timed out after 2s");
    }

    #[test]
    fn test_loop_limit_response() {
        let err = ProxyError::LoopLimitExceeded { turns: 3 };
        assert_eq!(err.status(), StatusCode::LOOP_DETECTED);
        let body = err.to_body();
        assert_eq!(body["error"]["code"], "tool_loop_limit_exceeded");
        assert!(body["error"]["message"].as_str().unwrap().contains("3"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
        assert_eq!(
            response.headers()[HEADER_ERROR_CODE],
            "tool_loop_limit_exceeded"
        );
    }

    #[test]
    fn test_backend_errors_map_to_gateway_statuses() {
        assert_eq!(
            ProxyError::BackendUnavailable("refused".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BackendTimeout("slow".to_string()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
