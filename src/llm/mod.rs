//! LLM invocation transport.
//!
//! Every external call is stateless: one request, one response, no
//! conversation carried between calls. The HTTP transport enforces a hard
//! timeout by racing a timer against the request and sits behind a circuit
//! breaker so a failing upstream degrades to fast typed errors instead of
//! piling up blocked tasks.

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::LlmConfig;
use crate::{HubError, Result};

/// Rough per-token pricing used for ledger cost estimates.
const COST_PER_INPUT_TOKEN: f64 = 3.0e-6;
const COST_PER_OUTPUT_TOKEN: f64 = 15.0e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CompletionResponse {
    /// Estimated dollar cost of this call, for the ledger.
    pub fn cost_estimate(&self) -> f64 {
        self.input_tokens as f64 * COST_PER_INPUT_TOKEN
            + self.output_tokens as f64 * COST_PER_OUTPUT_TOKEN
    }
}

/// Stateless completion transport. Implementations must be safe to call
/// concurrently; the orchestrator spawns each call in its own task.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

pub struct HttpLlmTransport {
    client: reqwest::Client,
    config: LlmConfig,
    breaker: CircuitBreaker,
}

impl HttpLlmTransport {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
        }
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    async fn send(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| HubError::Llm("no API key configured".to_string()))?;

        let body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens.min(self.config.max_tokens),
            "system": request.system,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(HubError::Llm(format!("upstream returned {status}: {detail}")));
        }

        let payload: serde_json::Value = response.json().await?;
        let text = payload["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|b| b["text"].as_str().map(|s| s.to_string()))
            })
            .ok_or_else(|| HubError::Llm("response carried no text block".to_string()))?;

        Ok(CompletionResponse {
            text,
            input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
        })
    }
}

#[async_trait]
impl LlmTransport for HttpLlmTransport {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        if !self.breaker.allow().await {
            return Err(HubError::Llm("circuit open, transport unavailable".to_string()));
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        // The timer races the call; on fire the request future is dropped
        // and the caller gets a typed timeout.
        let outcome = tokio::time::timeout(deadline, self.send(&request)).await;

        match outcome {
            Ok(Ok(response)) => {
                self.breaker.record_success().await;
                debug!(
                    input_tokens = response.input_tokens,
                    output_tokens = response.output_tokens,
                    "llm call complete"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure().await;
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure().await;
                Err(HubError::Timeout {
                    message: format!("llm call exceeded {}ms", self.config.timeout_ms),
                })
            }
        }
    }
}
