//! Anthropic Claude transport for the agent's LLM operations.
//!
//! Speaks the messages endpoint directly: the request carries `model`,
//! `max_tokens`, and a single user message; the reply text lives at
//! `content[0].text`. The API key travels in the `x-api-key` header.

use crate::mcpscope::llm::common::get_shared_http_client;
use crate::mcpscope::llm::LlmTransport;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::error::Error;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

/// Transport for Anthropic's messages API.
pub struct ClaudeTransport {
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeTransport {
    /// Create a transport against the public Anthropic endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the transport at a Claude-compatible base URL (no trailing slash).
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmTransport for ClaudeTransport {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = get_shared_http_client()
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(format!("Claude API returned {}: {}", status, text).into());
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Claude reply: {} bytes", text.len());
        }

        let parsed: Value = serde_json::from_str(&text)?;
        parsed["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "Claude response carried no content[0].text".into())
    }

    fn provider_name(&self) -> &str {
        "claude"
    }
}
