use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::{Completion, CompletionRequest, CompletionResponse, Message};
use crate::config::InferenceConfig;
use crate::error::{InferenceError, InferenceResult};
use crate::flow::FlowContext;

/// Client for the LLM inference endpoint.
///
/// Calls are single-shot: no retry loop in the hot path, so the caller
/// sees the full cost of each invocation and no request is ever billed
/// twice behind its back.
#[derive(Clone)]
pub struct InferenceClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout_ms: u64,
}

impl InferenceClient {
    /// Create a new inference client
    pub fn new(config: &InferenceConfig) -> InferenceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(InferenceError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_ms: config.timeout_ms,
        })
    }

    /// Run one completion call as the given agent.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        flow: &FlowContext,
    ) -> InferenceResult<Completion> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = CompletionRequest::new(&self.model, messages).with_max_tokens(self.max_tokens);

        debug!(
            flow_run_id = %flow.flow_run_id,
            agent = %flow.agent_name,
            model = %request.model,
            messages = request.messages.len(),
            "Calling inference endpoint"
        );

        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    InferenceError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let completion: CompletionResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        let text = completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| InferenceError::InvalidResponse {
                message: "Response contained no completion text".to_string(),
            })?;

        let usage = completion.usage;

        info!(
            flow_run_id = %flow.flow_run_id,
            agent = %flow.agent_name,
            latency_ms = start.elapsed().as_millis() as u64,
            total_tokens = usage.and_then(|u| u.total_tokens).unwrap_or(0),
            "Inference call succeeded"
        );

        Ok(Completion { text, usage })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
