//! Tool System module.
//!
//! This module defines the `Tool` trait and the `ToolRegistry` that together
//! form the tool execution framework.
//!
//! - **Tool trait**: every invocable tool provides its name, description,
//!   JSON Schema for parameters, and an execute method. Tools discovered on
//!   MCP servers implement it in [`mcp`].
//! - **ToolRegistry**: a name-keyed map built once at startup. It is never
//!   mutated afterwards and is shared across requests behind an `Arc`.

pub mod mcp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{RegistryError, ToolError};
use crate::types::ToolDefinition;

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "get_greeting").
    fn name(&self) -> &str;

    /// A human-readable description of what this tool does.
    /// The model reads this to decide when to use the tool.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's input parameters.
    fn parameters_schema(&self) -> Value;

    /// Where the tool comes from (e.g. the tool server's name), for logs.
    fn source(&self) -> &str;

    /// Execute the tool with the given arguments.
    async fn execute(&self, params: Map<String, Value>) -> Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the backend.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            argument_schema: self.parameters_schema(),
        }
    }
}

/// Immutable set of tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Definitions in registration order, so augmented requests are stable
    definitions: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Collects tools during startup discovery.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
    definitions: Vec<ToolDefinition>,
}

impl ToolRegistryBuilder {
    /// Register a tool. Names must be unique across all sources.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        if let Some(existing) = self.tools.get(tool.name()) {
            return Err(RegistryError::DuplicateTool {
                name: tool.name().to_string(),
                source_name: existing.source().to_string(),
            });
        }
        self.definitions.push(tool.to_definition());
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: self.tools,
            definitions: self.definitions,
        }
    }
}
