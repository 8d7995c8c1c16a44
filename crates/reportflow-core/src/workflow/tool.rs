//! Step tool port and registry.
//!
//! A tool is the external collaborator a step invokes (parser, mailer, AI
//! client, HTTP endpoint). The engine only sees resolved JSON in and JSON out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use reportflow_types::error::ToolError;
use serde_json::Value;

pub trait StepTool: Send + Sync {
    /// Registry key referenced by `StepDefinition::tool`.
    fn name(&self) -> &str;

    fn execute(&self, config: Value) -> impl Future<Output = Result<Value, ToolError>> + Send;
}

/// Object-safe version of [`StepTool`].
pub trait StepToolDyn: Send + Sync {
    fn name(&self) -> &str;
    fn execute_boxed(&self, config: Value) -> BoxFuture<'_, Result<Value, ToolError>>;
}

impl<T: StepTool> StepToolDyn for T {
    fn name(&self) -> &str {
        StepTool::name(self)
    }

    fn execute_boxed(&self, config: Value) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(self.execute(config))
    }
}

pub struct BoxStepTool {
    inner: Box<dyn StepToolDyn>,
}

impl BoxStepTool {
    pub fn new<T: StepTool + 'static>(tool: T) -> Self {
        Self {
            inner: Box::new(tool),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, config: Value) -> Result<Value, ToolError> {
        self.inner.execute_boxed(config).await
    }
}

/// Tools available to workflow steps, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<BoxStepTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool with the same name is replaced.
    pub fn register<T: StepTool + 'static>(&mut self, tool: T) -> &mut Self {
        let tool = BoxStepTool::new(tool);
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxStepTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
