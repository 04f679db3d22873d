use std::path::PathBuf;

use clap::Parser;

use crate::config::AppConfig;

/// Chat proxy that lets an LLM backend call tools hosted on MCP servers.
#[derive(Debug, Parser)]
#[command(name = "mcp-proxy", version, about)]
pub struct Cli {
    /// Config file (defaults to ~/.mcp-proxy/config.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Backend base URL, overrides the config file
    #[arg(long, value_name = "URL")]
    pub backend_url: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    pub init: bool,
}

impl Cli {
    /// Command-line values win over both the file and the environment.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(url) = &self.backend_url {
            config.backend.url = url.clone();
        }
    }
}
