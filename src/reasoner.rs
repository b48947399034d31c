//! Reasoner adapters
//!
//! The reasoning model lives behind an HTTP endpoint that answers with
//! newline-delimited JSON: zero or more `delta` lines followed by exactly one
//! `final`, `tool_call` or `error` line.

use crate::db::Usage;
use crate::runtime::{InvocationError, Reasoner, ReasonerOutput, ReasonerRequest};
use crate::state_machine::ToolCall;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One line of the reasoner's response stream
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Delta {
        text: String,
    },
    Final {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        usage: Usage,
        #[serde(default = "default_cacheable")]
        cacheable: bool,
    },
    ToolCall {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        usage: Usage,
    },
    Error {
        message: String,
    },
}

fn default_cacheable() -> bool {
    true
}

/// Accumulates stream lines into a reasoner outcome
#[derive(Debug, Default)]
struct StreamState {
    text: String,
    outcome: Option<ReasonerOutput>,
}

impl StreamState {
    /// Apply one line; returns a delta to forward, if any
    fn apply(&mut self, line: &str) -> Result<Option<String>, InvocationError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if self.outcome.is_some() {
            return Err(InvocationError::reasoner(
                "reasoner sent data after its final line",
            ));
        }
        let parsed: StreamLine = serde_json::from_str(line).map_err(|e| {
            InvocationError::reasoner(format!("malformed reasoner line: {e}"))
        })?;
        match parsed {
            StreamLine::Delta { text } => {
                self.text.push_str(&text);
                Ok(Some(text))
            }
            StreamLine::Final {
                text,
                usage,
                cacheable,
            } => {
                self.outcome = Some(ReasonerOutput::Final {
                    text: text.unwrap_or_else(|| std::mem::take(&mut self.text)),
                    usage,
                    cacheable,
                });
                Ok(None)
            }
            StreamLine::ToolCall {
                id,
                name,
                arguments,
                usage,
            } => {
                self.outcome = Some(ReasonerOutput::ToolCall {
                    call: ToolCall {
                        id: id.unwrap_or_else(|| {
                            format!("call_{}", uuid::Uuid::new_v4().simple())
                        }),
                        name,
                        arguments,
                    },
                    usage,
                });
                Ok(None)
            }
            StreamLine::Error { message } => Err(InvocationError::reasoner(message)),
        }
    }

    fn finish(self) -> Result<ReasonerOutput, InvocationError> {
        self.outcome.ok_or_else(|| {
            InvocationError::reasoner("reasoner stream ended without a final line")
        })
    }
}

/// Reasoner reached over HTTP
pub struct HttpReasoner {
    client: Client,
    endpoint: Option<String>,
}

impl HttpReasoner {
    /// Without an endpoint every invocation fails with a configuration error
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn invoke(
        &self,
        request: &ReasonerRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ReasonerOutput, InvocationError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            InvocationError::reasoner("no reasoner configured (set AGENTGATE_REASONER_URL)")
        })?;

        let response = self
            .client
            .post(endpoint)
            .header("accept", "application/x-ndjson")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    InvocationError::reasoner(format!("Connection failed: {e}"))
                } else {
                    InvocationError::reasoner(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvocationError::reasoner(format!("HTTP {status}: {body}")));
        }

        let mut state = StreamState::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| InvocationError::reasoner(format!("Failed to read response: {e}")))?;
            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                forward_line(&mut state, &String::from_utf8_lossy(&line), &deltas).await?;
            }
        }
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            forward_line(&mut state, &line, &deltas).await?;
        }
        state.finish()
    }
}

/// Apply one stream line, passing any text delta on to the listener
async fn forward_line(
    state: &mut StreamState,
    line: &str,
    deltas: &mpsc::Sender<String>,
) -> Result<(), InvocationError> {
    if let Some(delta) = state.apply(line)? {
        if deltas.send(delta).await.is_err() {
            return Err(InvocationError::reasoner("listener went away"));
        }
    }
    Ok(())
}

/// Logging wrapper for reasoners
pub struct LoggingReasoner {
    inner: Arc<dyn Reasoner>,
}

impl LoggingReasoner {
    pub fn new(inner: Arc<dyn Reasoner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Reasoner for LoggingReasoner {
    async fn invoke(
        &self,
        request: &ReasonerRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ReasonerOutput, InvocationError> {
        let start = std::time::Instant::now();
        let result = self.inner.invoke(request, deltas).await;
        let duration = start.elapsed();

        match &result {
            Ok(ReasonerOutput::Final { usage, .. }) => {
                tracing::info!(
                    conv_id = %request.conversation_id,
                    turn_id = %request.turn_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Reasoner replied"
                );
            }
            Ok(ReasonerOutput::ToolCall { call, usage }) => {
                tracing::info!(
                    conv_id = %request.conversation_id,
                    turn_id = %request.turn_id,
                    duration_ms = %duration.as_millis(),
                    tool = %call.name,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Reasoner requested tool call"
                );
            }
            Err(e) => {
                tracing::error!(
                    conv_id = %request.conversation_id,
                    turn_id = %request.turn_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    "Reasoner failed"
                );
            }
        }

        result
    }
}
