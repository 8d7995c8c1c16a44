//! HTTP request step.
//!
//! Config:
//! ```json
//! { "url": "https://...", "method": "POST", "headers": { "x-key": "..." }, "body": { ... } }
//! ```
//! `method` defaults to GET. An object/array `body` is sent as JSON, a string
//! as-is. The output is `{ "status", "headers", "body" }`, with `body`
//! parsed as JSON when the response is JSON.
//!
//! Timeouts, connection failures, 429 and 5xx responses are transient; other
//! 4xx responses and bad config are permanent.

use std::collections::HashMap;
use std::time::Duration;

use reportflow_core::workflow::StepTool;
use reportflow_types::error::ToolError;
use serde::Deserialize;
use serde_json::{Value, json};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct HttpStepConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("reportflow-workflow/0.1")
            .build()?;
        Ok(Self { client })
    }
}

fn classify_send_error(url: &str, e: reqwest::Error) -> ToolError {
    if e.is_builder() {
        ToolError::Permanent(format!("invalid request to '{url}': {e}"))
    } else {
        ToolError::Transient(format!("HTTP request to '{url}' failed: {e}"))
    }
}

impl StepTool for HttpTool {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, config: Value) -> Result<Value, ToolError> {
        let config: HttpStepConfig = serde_json::from_value(config)
            .map_err(|e| ToolError::Permanent(format!("invalid http step config: {e}")))?;

        let method: reqwest::Method = config
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| ToolError::Permanent(format!("invalid HTTP method: {}", config.method)))?;

        let mut request = self.client.request(method, &config.url);
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        match config.body {
            Some(Value::String(text)) => request = request.body(text),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(&body),
        }
        if let Some(ms) = config.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_send_error(&config.url, e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let text = response.text().await.map_err(|e| {
            ToolError::Transient(format!("failed to read response from '{}': {e}", config.url))
        })?;

        tracing::info!(
            url = config.url.as_str(),
            status = status.as_u16(),
            body_len = text.len(),
            "HTTP step completed"
        );

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::Transient(format!(
                "'{}' answered {status}",
                config.url
            )));
        }
        if status.is_client_error() {
            return Err(ToolError::Permanent(format!(
                "'{}' answered {status}: {text}",
                config.url
            )));
        }

        let is_json = headers
            .get("content-type")
            .is_some_and(|ct| ct.contains("json"));
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response on a local port.
    async fn serve_once(status_line: &str, content_type: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/inventory")
    }

    #[tokio::test]
    async fn json_response_is_parsed() {
        let url = serve_once("200 OK", "application/json", r#"{"total":12}"#).await;
        let output = HttpTool::new()
            .unwrap()
            .execute(json!({ "url": url }))
            .await
            .unwrap();
        assert_eq!(output["status"], 200);
        assert_eq!(output["body"]["total"], 12);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let url = serve_once("503 Service Unavailable", "text/plain", "down").await;
        let err = HttpTool::new()
            .unwrap()
            .execute(json!({ "url": url, "method": "post", "body": { "a": 1 } }))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let url = serve_once("404 Not Found", "text/plain", "no such report").await;
        let err = HttpTool::new()
            .unwrap()
            .execute(json!({ "url": url }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Permanent(ref m) if m.contains("no such report")));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpTool::new()
            .unwrap()
            .execute(json!({ "url": format!("http://{addr}/") }))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_config_is_permanent() {
        let tool = HttpTool::new().unwrap();
        assert!(matches!(
            tool.execute(json!({ "method": "GET" })).await,
            Err(ToolError::Permanent(_))
        ));
        assert!(matches!(
            tool.execute(json!({ "url": "http://127.0.0.1:1/", "method": "NOT A METHOD" }))
                .await,
            Err(ToolError::Permanent(_))
        ));
    }
}
