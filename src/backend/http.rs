//! HTTP backend implementation (Ollama-style chat servers).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use tracing::debug;

use super::{Backend, BufferedResponse, ForwardRequest, StreamingResponse};
use crate::config::BackendConfig;
use crate::error::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBackend {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            client,
        })
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}/{}", self.base_url, path_and_query.trim_start_matches('/'))
    }

    fn build(&self, request: ForwardRequest) -> reqwest::RequestBuilder {
        let url = self.url(&request.path_and_query);
        debug!(method = %request.method, %url, body_len = request.body.len(), "Sending request to backend");

        self.client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, request: ForwardRequest) -> Result<BufferedResponse, ProxyError> {
        let response = self.build(request).timeout(self.timeout).send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        debug!(%status, body_len = body.len(), "Backend response received");

        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_streaming(
        &self,
        request: ForwardRequest,
    ) -> Result<StreamingResponse, ProxyError> {
        // Only the response head is bounded here; the gap between chunks is
        // bounded by the stream consumer.
        let response = tokio::time::timeout(self.timeout, self.build(request).send())
            .await
            .map_err(|_| {
                ProxyError::BackendTimeout(format!("no response head within {:?}", self.timeout))
            })??;

        let status = response.status();
        let headers = response.headers().clone();
        debug!(%status, "Backend stream opened");

        Ok(StreamingResponse {
            status,
            headers,
            body: response.bytes_stream().map_err(ProxyError::from).boxed(),
        })
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
