//! Tools hosted on MCP servers.
//!
//! At startup every configured server is connected through the `rmcp` SDK,
//! its tools are listed, and each one is wrapped in an [`McpTool`] that
//! forwards `execute` to `tools/call` on the same connection.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, RawContent},
    service::RunningService,
    transport::{sse_client::SseClientConfig, SseClientTransport, StreamableHttpClientTransport},
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{Tool, ToolRegistry};
use crate::config::{ToolServerConfig, ToolServerTransport};
use crate::error::ToolError;

type McpClient = RunningService<RoleClient, ()>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("tool listing failed: {0}")]
    Discovery(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A tool discovered on an MCP server.
pub struct McpTool {
    server: Arc<str>,
    client: Arc<McpClient>,
    name: String,
    description: String,
    schema: Value,
}

impl McpTool {
    fn new(server: Arc<str>, client: Arc<McpClient>, tool: rmcp::model::Tool) -> Self {
        Self {
            server,
            client,
            name: tool.name.to_string(),
            description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
            schema: Value::Object((*tool.input_schema).clone()),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn source(&self) -> &str {
        &self.server
    }

    async fn execute(&self, params: Map<String, Value>) -> Result<String, ToolError> {
        debug!(server = %self.server, tool = %self.name, "Calling MCP tool");

        let request = CallToolRequestParam {
            name: Cow::Owned(self.name.clone()),
            arguments: Some(params),
        };

        let result = self
            .client
            .call_tool(request)
            .await
            .map_err(|e| ToolError::Invocation {
                name: self.name.clone(),
                message: e.to_string(),
            })?;

        let text = result_text(&result);
        if result.is_error.unwrap_or(false) {
            return Err(ToolError::Invocation {
                name: self.name.clone(),
                message: text,
            });
        }
        Ok(text)
    }
}

/// Flatten a `tools/call` result into the text handed back to the model.
fn result_text(result: &CallToolResult) -> String {
    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    if text.is_empty() {
        if let Some(structured) = &result.structured_content {
            return structured.to_string();
        }
    }
    text
}

/// Open a client session with one tool server.
async fn connect(name: &str, config: &ToolServerConfig) -> Result<McpClient, ToolServerError> {
    info!(server = name, url = %config.url, transport = ?config.transport, "Connecting to tool server");

    match config.transport {
        ToolServerTransport::Sse => {
            let http = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .map_err(|e| ToolServerError::Transport(format!("build HTTP client: {}", e)))?;

            let cfg = SseClientConfig {
                sse_endpoint: config.url.clone().into(),
                ..Default::default()
            };

            let transport = SseClientTransport::start_with_client(http, cfg)
                .await
                .map_err(|e| ToolServerError::Transport(format!("create SSE transport: {}", e)))?;

            ().serve(transport).await.map_err(|e| {
                ToolServerError::ConnectionFailed(format!("initialize SSE client: {}", e))
            })
        }
        ToolServerTransport::StreamableHttp => {
            let transport = StreamableHttpClientTransport::from_uri(config.url.as_str());
            ().serve(transport).await.map_err(|e| {
                ToolServerError::ConnectionFailed(format!("initialize streamable client: {}", e))
            })
        }
    }
}

/// Connect to one server and wrap each of its tools.
pub async fn discover(
    name: &str,
    config: &ToolServerConfig,
    timeout: Duration,
) -> Result<Vec<Arc<dyn Tool>>, ToolServerError> {
    let handshake = async {
        let client = Arc::new(connect(name, config).await?);
        let tools = client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| ToolServerError::Discovery(e.to_string()))?;
        Ok::<_, ToolServerError>((client, tools))
    };

    let (client, tools) = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ToolServerError::Timeout(timeout))??;

    info!(server = name, count = tools.len(), "Discovered tools");
    Ok(wrap_tools(name, client, tools))
}

fn wrap_tools(
    name: &str,
    client: Arc<McpClient>,
    tools: Vec<rmcp::model::Tool>,
) -> Vec<Arc<dyn Tool>> {
    let server: Arc<str> = Arc::from(name);
    tools
        .into_iter()
        .map(|tool| {
            Arc::new(McpTool::new(Arc::clone(&server), Arc::clone(&client), tool)) as Arc<dyn Tool>
        })
        .collect()
}

/// Build the process-wide registry from every configured tool server.
///
/// A server that cannot be reached is logged and skipped, so the proxy still
/// serves plain chat when a tool server is down. A tool whose name is already
/// taken by an earlier server is skipped as well.
pub async fn build_registry(
    servers: &BTreeMap<String, ToolServerConfig>,
    timeout: Duration,
) -> ToolRegistry {
    let mut builder = ToolRegistry::builder();

    for (name, config) in servers {
        let tools = match discover(name, config, timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                error!(server = %name, error = %e, "Failed to load tools from server, skipping");
                continue;
            }
        };
        for tool in tools {
            if let Err(e) = builder.register(tool) {
                warn!(server = %name, error = %e, "Skipping tool");
            }
        }
    }

    let registry = builder.build();
    if registry.is_empty() {
        warn!("No tools available; requests will be forwarded without tool augmentation");
    } else {
        info!(count = registry.len(), "Tool registry ready");
    }
    registry
}
