//! Tool contract and registry.
//!
//! Tools never throw for business failures: they return a string starting
//! with `"Error:"`, which the framework classifies with the same keyword
//! rules used for LLM failures. Panics and infrastructure errors are the
//! broker's problem, not the tool author's.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Prefix marking a tool result as a business error.
pub const TOOL_ERROR_PREFIX: &str = "Error:";

/// A callable tool exposed to the agent core.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the accepted arguments.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool. Business errors come back as `"Error: ..."`
    /// strings; a successful call returns any other string.
    async fn call(&self, arguments: serde_json::Value) -> String;
}

/// Whether a tool output is an error by the string contract.
pub fn is_tool_error(output: &str) -> bool {
    output.trim_start().starts_with(TOOL_ERROR_PREFIX)
}

/// Name-keyed collection of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
