//! HTTP front door.
//!
//! Every subpath is accepted. Configured tool paths go through the tool
//! loop; everything else is forwarded untouched and streamed back.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::augment::augment;
use crate::backend::{filter_headers, forward_headers, Backend, ForwardRequest};
use crate::error::ProxyError;
use crate::orchestrator::Orchestrator;
use crate::session::{generate_session_id, Session};
use crate::types::ChatRequest;

const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<dyn Backend>,
    /// Normalized subpaths (no leading or trailing slash)
    pub tool_paths: Arc<[String]>,
}

impl AppState {
    fn is_tool_path(&self, path: &str) -> bool {
        self.tool_paths.iter().any(|p| p == path)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(proxy)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = info_span!("request", id = %generate_session_id());
    match handle(&state, method, uri, headers, body)
        .instrument(span)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, code = e.code(), "Request failed");
            e.into_response()
        }
    }
}

async fn handle(
    state: &AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    if !ALLOWED_METHODS.contains(&method) {
        return Err(ProxyError::MethodNotAllowed(method.to_string()));
    }

    let path = uri.path().trim_matches('/').to_string();
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.clone(),
    };
    let request = ForwardRequest {
        method,
        path_and_query,
        headers: forward_headers(&headers),
        body,
    };

    if !state.is_tool_path(&path) {
        debug!(path = %path, "Passing request through");
        return passthrough(state, request).await;
    }

    let mut chat: ChatRequest = match serde_json::from_slice(&request.body) {
        Ok(chat) => chat,
        Err(e) => {
            warn!(path = %path, error = %e, "Tool path body is not a chat request, forwarding unmodified");
            return passthrough(state, request).await;
        }
    };

    augment(&mut chat, state.orchestrator.registry());
    let session = Session::new(chat);
    info!(
        path = %path,
        stream = session.is_streaming(),
        tools = session.request().tools.len(),
        "Tool-augmented request"
    );

    if session.is_streaming() {
        stream_reply(state, session, request).await
    } else {
        buffered_reply(state, session, request).await
    }
}

async fn buffered_reply(
    state: &AppState,
    mut session: Session,
    request: ForwardRequest,
) -> Result<Response, ProxyError> {
    let response = state
        .orchestrator
        .run_buffered(&mut session, &request)
        .await?;

    let mut reply = Response::new(Body::from(response.body));
    *reply.status_mut() = response.status;
    *reply.headers_mut() = filter_headers(&response.headers);
    Ok(reply)
}

async fn stream_reply(
    state: &AppState,
    session: Session,
    request: ForwardRequest,
) -> Result<Response, ProxyError> {
    let reply = state.orchestrator.run_streaming(session, request).await?;

    let events = ReceiverStream::new(reply.body).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(events));
    *response.status_mut() = reply.status;

    let mut headers = filter_headers(&reply.headers);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    *response.headers_mut() = headers;
    Ok(response)
}

async fn passthrough(state: &AppState, request: ForwardRequest) -> Result<Response, ProxyError> {
    let upstream = state.backend.send_streaming(request).await?;

    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = filter_headers(&upstream.headers);
    Ok(response)
}
