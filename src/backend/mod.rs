//! Backend Forwarder module.
//!
//! The `Backend` trait sends a request to the inference backend either
//! buffered (whole body) or streaming (raw byte stream). The tool loop only
//! talks to this trait, so tests can drive it with a scripted backend.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::ProxyError;

/// Headers never copied between client and backend, in either direction.
pub const EXCLUDED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Copy headers, dropping the hop-by-hop ones.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !EXCLUDED_HEADERS.contains(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Headers to send upstream. `Host` must come from the backend URL.
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = filter_headers(headers);
    filtered.remove(header::HOST);
    filtered
}

/// A request as it will be sent to the backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path and query relative to the backend base URL (e.g. "api/chat")
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    /// Same method, path and headers with a new body (one per loop turn).
    pub fn with_body(&self, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

/// Trait that all backends must implement.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send a request and wait for the entire response body.
    async fn send(&self, request: ForwardRequest) -> Result<BufferedResponse, ProxyError>;

    /// Send a request and return as soon as the response head arrives.
    async fn send_streaming(&self, request: ForwardRequest)
        -> Result<StreamingResponse, ProxyError>;

    /// Return the backend's display name (for logging).
    fn name(&self) -> &str;
}
