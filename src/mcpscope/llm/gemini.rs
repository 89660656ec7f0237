//! Google Gemini transport for the agent's LLM operations.
//!
//! Uses the generateContent endpoint with the API key passed as a query
//! parameter (Gemini does not use bearer auth here). The generation config
//! pins a low temperature and requests `application/json` so the three
//! JSON-contract operations get machine-readable replies; the text lives at
//! `candidates[0].content.parts[0].text`.

use crate::mcpscope::llm::common::get_shared_http_client;
use crate::mcpscope::llm::LlmTransport;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::error::Error;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Transport for Google's Generative Language API.
pub struct GeminiTransport {
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiTransport {
    /// Create a transport against the public Gemini endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the transport at a custom base URL (no trailing slash).
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmTransport for GeminiTransport {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": 8192,
                "responseMimeType": "application/json",
            },
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = get_shared_http_client().post(&url).json(&body).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(format!("Gemini API returned {}: {}", status, text).into());
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Gemini reply: {} bytes", text.len());
        }

        let parsed: Value = serde_json::from_str(&text)?;
        if let Some(error) = parsed.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(format!("Gemini API error: {}", message).into());
        }

        parsed["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "Gemini response carried no candidates[0].content.parts[0].text".into())
    }

    fn provider_name(&self) -> &str {
        "gemini"
    }
}
