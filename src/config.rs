//! Configuration management for mcp-proxy.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the proxy listens on
    #[serde(default = "default_listen")]
    pub listen: String,
    pub backend: BackendConfig,
    pub orchestration: OrchestrationConfig,
    /// Tool servers keyed by a display name
    #[serde(default)]
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:48001".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    /// Bound on a buffered backend round trip, and on the gap between two
    /// chunks of a streamed one
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    300
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum number of tool rounds per request. Required: there is no
    /// unbounded mode.
    pub max_turns: u32,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Subpaths whose requests get tools injected and run through the tool loop
    #[serde(default = "default_tool_paths")]
    pub tool_paths: Vec<String>,
}

fn default_max_concurrent_tools() -> usize {
    4
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_tool_paths() -> Vec<String> {
    vec!["api/chat".to_string()]
}

impl OrchestrationConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolServerConfig {
    pub url: String,
    #[serde(default)]
    pub transport: ToolServerTransport,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolServerTransport {
    #[default]
    Sse,
    StreamableHttp,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut tool_servers = BTreeMap::new();
        tool_servers.insert(
            "demo".to_string(),
            ToolServerConfig {
                url: "http://127.0.0.1:48000/sse".to_string(),
                transport: ToolServerTransport::Sse,
            },
        );

        Self {
            listen: default_listen(),
            backend: BackendConfig {
                url: "http://localhost:11434".to_string(),
                timeout_secs: default_backend_timeout_secs(),
            },
            orchestration: OrchestrationConfig {
                max_turns: 8,
                max_concurrent_tools: default_max_concurrent_tools(),
                tool_timeout_secs: default_tool_timeout_secs(),
                tool_paths: default_tool_paths(),
            },
            tool_servers,
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".mcp-proxy").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// Unlike a missing optional file, a missing config is an error here:
    /// the turn cap has to be chosen explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let content = std::fs::read_to_string(&config_path).with_context(|| {
            format!(
                "Failed to read config file: {} (run with --init to create one)",
                config_path.display()
            )
        })?;
        let mut config = Self::from_toml_str(&content).with_context(|| {
            format!("Failed to parse config file: {}", config_path.display())
        })?;

        if let Ok(listen) = std::env::var("MCP_PROXY_LISTEN") {
            config.listen = listen;
        }
        if let Ok(url) = std::env::var("MCP_PROXY_BACKEND_URL") {
            config.backend.url = url;
        }

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.orchestration.max_turns >= 1,
            "orchestration.max_turns must be at least 1"
        );
        ensure!(
            self.orchestration.max_concurrent_tools >= 1,
            "orchestration.max_concurrent_tools must be at least 1"
        );
        ensure!(
            self.orchestration.tool_timeout_secs >= 1,
            "orchestration.tool_timeout_secs must be at least 1"
        );
        ensure!(
            self.backend.timeout_secs >= 1,
            "backend.timeout_secs must be at least 1"
        );
        ensure!(
            self.backend.url.starts_with("http://") || self.backend.url.starts_with("https://"),
            "backend.url must be an http(s) URL, got '{}'",
            self.backend.url
        );
        for (name, server) in &self.tool_servers {
            ensure!(
                server.url.starts_with("http://") || server.url.starts_with("https://"),
                "tool_servers.{}.url must be an http(s) URL, got '{}'",
                name,
                server.url
            );
        }
        Ok(())
    }

    /// Tool paths without leading or trailing slashes.
    pub fn normalized_tool_paths(&self) -> Vec<String> {
        self.orchestration
            .tool_paths
            .iter()
            .map(|p| p.trim_matches('/').to_string())
            .collect()
    }

    pub fn save_default(path: Option<&Path>) -> Result<PathBuf> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let default = Self::default();
        let content = toml::to_string_pretty(&default).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;
        Ok(config_path)
    }
}
