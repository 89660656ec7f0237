//! OpenAI chat-completions transport for the agent's LLM operations.

use crate::mcpscope::llm::common::get_shared_http_client;
use crate::mcpscope::llm::LlmTransport;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::error::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Transport for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiTransport {
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiTransport {
    /// Create a transport against the public OpenAI endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the transport at any OpenAI-compatible base URL (no trailing
    /// slash). Useful for self-hosted gateways.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmTransport for OpenAiTransport {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = get_shared_http_client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(format!("OpenAI API returned {}: {}", status, text).into());
        }

        let parsed: Value = serde_json::from_str(&text)?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "OpenAI response carried no choices[0].message.content".into())
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}
