//! Tool Dispatcher.
//!
//! Runs one turn's tool calls against the registry. Calls run concurrently
//! up to a fixed limit, and results come back in call order. Every call
//! yields exactly one result, whatever happens to it.

use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::tools::ToolRegistry;
use crate::types::{ToolCall, ToolResult};

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub max_concurrency: usize,
    pub timeout: Duration,
}

/// Dispatch all calls of a turn and wait for every one of them.
///
/// The futures are polled in place rather than spawned, so dropping the
/// returned future cancels all outstanding invocations.
pub async fn dispatch(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    settings: DispatchSettings,
) -> Vec<ToolResult> {
    // Build the futures up front: a `map` closure over borrowed calls yields
    // a future that is not provably `Send`, which the streaming task needs.
    let invocations: Vec<_> = calls
        .iter()
        .map(|call| Box::pin(invoke(registry, call, settings.timeout)))
        .collect();

    stream::iter(invocations)
        .buffered(settings.max_concurrency.max(1))
        .collect()
        .await
}

async fn invoke(registry: &ToolRegistry, call: &ToolCall, timeout: Duration) -> ToolResult {
    let outcome = match registry.get(&call.name) {
        None => {
            warn!(tool = %call.name, call_id = %call.id, "Backend requested an unknown tool");
            Err(ToolError::UnknownTool(call.name.clone()))
        }
        Some(tool) => match parse_arguments(&call.name, &call.arguments) {
            Err(e) => Err(e),
            Ok(args) => {
                debug!(tool = %call.name, call_id = %call.id, ?args, "Invoking tool");
                match tokio::time::timeout(timeout, tool.execute(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(ToolError::Timeout {
                        name: call.name.clone(),
                        timeout,
                    }),
                }
            }
        },
    };

    if let Err(e) = &outcome {
        warn!(call_id = %call.id, error = %e, "Tool call failed");
    }

    ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        outcome,
    }
}

/// Arguments arrive as an object, a JSON-encoded object, or nothing at all.
fn parse_arguments(name: &str, arguments: &Value) -> Result<Map<String, Value>, ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        name: name.to_string(),
        reason,
    };

    match arguments {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(invalid(format!("expected an object, got {}", other))),
            Err(e) => Err(invalid(e.to_string())),
        },
        other => Err(invalid(format!("expected an object, got {}", other))),
    }
}
