//! Tool executor adapters
//!
//! Tools live behind an HTTP endpoint: `POST {base}/{tool_name}` with the
//! call arguments as the JSON body. Any 2xx JSON reply is the tool result.

use crate::runtime::{InvocationError, ToolExecutor};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub struct HttpToolExecutor {
    client: Client,
    base_url: Option<String>,
}

impl HttpToolExecutor {
    /// Without a base URL every call fails with a configuration error
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn url_for(&self, name: &str) -> Result<String, InvocationError> {
        let base = self.base_url.as_deref().ok_or_else(|| {
            InvocationError::tool("no tool executor configured (set AGENTGATE_TOOL_URL)")
        })?;
        if name.is_empty()
            || name.starts_with('.')
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(InvocationError::tool(format!("invalid tool name '{name}'")));
        }
        Ok(format!("{base}/{name}"))
    }

    async fn call(&self, url: &str, arguments: &Value) -> Result<Value, InvocationError> {
        let response = self
            .client
            .post(url)
            .json(arguments)
            .send()
            .await
            .map_err(|e| InvocationError::tool(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InvocationError::tool(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(InvocationError::tool(format!("HTTP {status}: {body}")));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| InvocationError::tool(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn run(
        &self,
        name: &str,
        arguments: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, InvocationError> {
        let url = self.url_for(name)?;
        tracing::info!(tool = %name, "Executing tool");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InvocationError::tool(format!("tool '{name}' cancelled"))),
            result = self.call(&url, arguments) => result,
        }
    }
}
