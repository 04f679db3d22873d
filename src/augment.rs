//! Request Augmenter.
//!
//! Merges the tools a client asked for with the tools in the registry.
//! Client entries win on a name clash and are passed through byte-for-byte;
//! registry tools the client did not shadow are appended in registry order.

use std::collections::HashSet;

use serde_json::Value;

use crate::tools::ToolRegistry;
use crate::types::ChatRequest;

/// Name of a wire tool entry: `{"function": {"name": ..}}` or a bare `{"name": ..}`.
fn tool_name(tool: &Value) -> Option<&str> {
    tool.pointer("/function/name")
        .or_else(|| tool.get("name"))
        .and_then(Value::as_str)
}

pub fn merge_tools(client_tools: Vec<Value>, registry: &ToolRegistry) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(client_tools.len() + registry.len());

    for tool in client_tools {
        // Later duplicates of a client name are dropped
        let duplicate = tool_name(&tool).is_some_and(|name| !seen.insert(name.to_string()));
        if !duplicate {
            merged.push(tool);
        }
    }

    merged.extend(
        registry
            .definitions()
            .iter()
            .filter(|def| !seen.contains(&def.name))
            .map(|def| def.to_wire()),
    );
    merged
}

/// Replace the request's tool list with the merged one.
pub fn augment(request: &mut ChatRequest, registry: &ToolRegistry) {
    let client_tools = std::mem::take(&mut request.tools);
    request.tools = merge_tools(client_tools, registry);
}
