use reportflow_core::workflow::StepTool;
use reportflow_types::error::ToolError;
use serde_json::Value;

/// Returns its resolved config as the step output.
pub struct EchoTool;

impl StepTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, config: Value) -> Result<Value, ToolError> {
        tracing::debug!("echo step");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_returns_config() {
        let config = json!({ "subject": "Inventory: 12 vehicles", "rows": [1, 2] });
        assert_eq!(EchoTool.execute(config.clone()).await.unwrap(), config);
    }
}
