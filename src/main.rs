mod augment;
mod backend;
mod cli;
mod config;
mod detect;
mod dispatch;
mod error;
mod history;
mod orchestrator;
mod server;
mod session;
mod stream;
mod tools;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backend::http::HttpBackend;
use backend::Backend;
use cli::Cli;
use config::AppConfig;
use orchestrator::Orchestrator;
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.init {
        let path = AppConfig::save_default(cli.config.as_deref())?;
        println!("[Config] Created default config: {}", path.display());
        println!("[Config] Edit it to set the backend URL, tool servers and max_turns.");
        return Ok(());
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    info!(
        listen = %config.listen,
        backend = %config.backend.url,
        max_turns = config.orchestration.max_turns,
        tool_servers = config.tool_servers.len(),
        "Configuration loaded"
    );

    let registry = tools::mcp::build_registry(
        &config.tool_servers,
        config.orchestration.tool_timeout(),
    )
    .await;

    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config.backend)?);
    info!(backend = backend.name(), "Backend client ready");
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        Arc::clone(&backend),
        &config.orchestration,
        config.backend.timeout(),
    );
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        backend,
        tool_paths: config.normalized_tool_paths().into(),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(address = %config.listen, "Proxy listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl-C received, shutting down");
    }
}
