//! Shared plumbing for the provider transports.
//!
//! Keeps a single pooled [`reqwest::Client`] for every LLM round-trip and the
//! reply-cleaning helper all providers need before JSON parsing.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// One client instance keeps TLS sessions and DNS lookups warm across the
    /// three LLM operations the agent issues per iteration.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Strip leading/trailing markdown code fences from an LLM reply.
///
/// Models regularly wrap JSON in ```` ``` ```` or ```` ```json ```` fences
/// despite being told not to; parsing must tolerate both.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_open = if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the fence line itself ("```json", "```", ...).
        match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        }
    } else {
        trimmed
    };
    let without_close = without_open
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(without_open);
    without_close.trim().to_string()
}
