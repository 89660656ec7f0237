//! LLM capability layer: three operations, pluggable provider transports.
//!
//! The agent needs exactly three things from a model — a dependency analysis
//! of the tool catalog, parameter extraction for one tool against the current
//! context, and the choice of the next tool to run. [`LlmClient`] owns those
//! operations, the canonical prompts that drive them, and the fallback
//! policies that keep the agent alive when a model misbehaves. Providers
//! ([`ClaudeTransport`], [`GeminiTransport`], [`OpenAiTransport`]) differ
//! only in how a prompt becomes a string of text.
//!
//! # Robustness contract
//!
//! No transport or parse failure ever escapes this module. Replies are
//! stripped of markdown fences before parsing; a reply that still fails to
//! parse (or a non-2xx transport error) produces a deterministic,
//! schema-derived fallback instead:
//!
//! - analysis → one entry per tool straight from its input schema,
//! - extraction → empty parameters, confidence 0, `missingParams = required`,
//! - selection → the first runnable-looking unexecuted tool, or `None`.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcpscope::llm::{create_transport, LlmCapability, LlmClient, Provider};
//!
//! # async {
//! let transport = create_transport(Provider::Claude, "sk-ant-...", None);
//! let llm = LlmClient::new(transport);
//! let analysis = llm.analyze_tool_dependencies(&[]).await;
//! assert!(analysis.is_empty());
//! # };
//! ```

pub mod claude;
pub mod common;
pub mod gemini;
pub mod openai;
pub mod prompts;

pub use claude::ClaudeTransport;
pub use gemini::GeminiTransport;
pub use openai::OpenAiTransport;

use crate::mcpscope::llm::common::strip_code_fences;
use crate::mcpscope::protocol::ToolInfo;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// Confidence threshold below which unresolved required parameters flag a
/// tool instead of executing it.
pub const CONFIDENCE_FLAG_THRESHOLD: f64 = 0.5;

/// One inferred parameter-provenance link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolDependency {
    pub param_name: String,
    pub source_tool: String,
    pub source_field: String,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Default for ToolDependency {
    fn default() -> Self {
        Self {
            param_name: String::new(),
            source_tool: String::new(),
            source_field: String::new(),
            confidence: 0.0,
        }
    }
}

/// Per-tool result of the dependency analysis pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DependencyAnalysis {
    pub tool: String,
    pub required_params: Vec<String>,
    pub can_execute_without_context: bool,
    pub suggested_order: usize,
    pub dependencies: Vec<ToolDependency>,
}

/// Best-effort parameter mapping for one tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParameterExtraction {
    pub params: Map<String, Value>,
    /// Parameter name → `"toolName.fieldPath"` provenance label.
    pub sources: HashMap<String, String>,
    pub confidence: f64,
    pub missing_params: Vec<String>,
}

/// Outcome of next-tool selection; `tool == None` ends the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NextToolSelection {
    pub tool: Option<String>,
    pub reason: String,
}

/// Provider transport: turns a prompt into reply text.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Provider identifier (e.g. `"claude"`, `"gemini"`).
    fn provider_name(&self) -> &str;
}

/// Supported provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gemini,
    OpenAi,
}

impl Provider {
    /// Model used when the caller does not name one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Claude => "claude-sonnet-4-0",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::OpenAi => "gpt-4o-mini",
        }
    }
}

/// Build a transport for the given provider.
pub fn create_transport(
    provider: Provider,
    api_key: &str,
    model: Option<&str>,
) -> Arc<dyn LlmTransport> {
    let model = model.unwrap_or_else(|| provider.default_model());
    match provider {
        Provider::Claude => Arc::new(ClaudeTransport::new(api_key, model)),
        Provider::Gemini => Arc::new(GeminiTransport::new(api_key, model)),
        Provider::OpenAi => Arc::new(OpenAiTransport::new(api_key, model)),
    }
}

/// The capability the agent orchestrator programs against.
///
/// [`LlmClient`] is the production implementation; tests and embedders can
/// substitute their own (e.g. a deterministic scripted one). Implementations
/// must never fail — bad model output degrades to a usable answer.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Analyze which tool outputs can feed which tool parameters.
    async fn analyze_tool_dependencies(&self, tools: &[ToolInfo]) -> Vec<DependencyAnalysis>;

    /// Resolve parameters for `tool` from the accumulated context.
    async fn extract_parameters(
        &self,
        tool: &ToolInfo,
        context: &HashMap<String, Value>,
    ) -> ParameterExtraction;

    /// Pick the next tool from the unexecuted subset, or `None` with a
    /// reason.
    async fn select_next_tool(
        &self,
        tools: &[ToolInfo],
        executed: &[String],
        context: &HashMap<String, Value>,
        current_depth: u32,
        max_depth: u32,
    ) -> NextToolSelection;
}

/// The agent's view of a model: three operations, shared prompts, safe
/// fallbacks.
pub struct LlmClient {
    transport: Arc<dyn LlmTransport>,
}

impl LlmClient {
    pub fn new(transport: Arc<dyn LlmTransport>) -> Self {
        Self { transport }
    }

    pub fn provider_name(&self) -> &str {
        self.transport.provider_name()
    }

    /// One round-trip: prompt → text → fence-stripped JSON value.
    async fn complete_json(&self, prompt: &str) -> Option<Value> {
        let raw = match self.transport.complete(prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("{} transport error: {}", self.transport.provider_name(), err);
                return None;
            }
        };
        let cleaned = strip_code_fences(&raw);
        match serde_json::from_str(&cleaned) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    "{} reply was not valid JSON ({}); falling back",
                    self.transport.provider_name(),
                    err
                );
                None
            }
        }
    }
}

#[async_trait]
impl LlmCapability for LlmClient {
    /// Never fails: transport or parse trouble degrades to a schema-derived
    /// analysis.
    async fn analyze_tool_dependencies(&self, tools: &[ToolInfo]) -> Vec<DependencyAnalysis> {
        if tools.is_empty() {
            return Vec::new();
        }
        let prompt = prompts::dependency_analysis_prompt(tools);
        match self.complete_json(&prompt).await {
            Some(value) => match serde_json::from_value::<Vec<DependencyAnalysis>>(value) {
                Ok(analysis) if !analysis.is_empty() => analysis,
                Ok(_) => fallback_analysis(tools),
                Err(err) => {
                    warn!("dependency analysis reply did not match schema: {}", err);
                    fallback_analysis(tools)
                }
            },
            None => fallback_analysis(tools),
        }
    }

    /// Partial replies are normalized (missing fields become empty/zero);
    /// unusable replies degrade to the empty extraction with
    /// `missing_params = schema.required`.
    async fn extract_parameters(
        &self,
        tool: &ToolInfo,
        context: &HashMap<String, Value>,
    ) -> ParameterExtraction {
        let prompt = prompts::parameter_extraction_prompt(tool, context);
        match self.complete_json(&prompt).await {
            Some(value) => match serde_json::from_value::<ParameterExtraction>(value) {
                Ok(extraction) => extraction,
                Err(err) => {
                    warn!(
                        "parameter extraction reply for {} did not match schema: {}",
                        tool.name, err
                    );
                    fallback_extraction(tool)
                }
            },
            None => fallback_extraction(tool),
        }
    }

    /// Short-circuits without a network call when the depth budget is spent
    /// or nothing is left to execute.
    async fn select_next_tool(
        &self,
        tools: &[ToolInfo],
        executed: &[String],
        context: &HashMap<String, Value>,
        current_depth: u32,
        max_depth: u32,
    ) -> NextToolSelection {
        if current_depth >= max_depth {
            return NextToolSelection {
                tool: None,
                reason: "Maximum depth reached".to_string(),
            };
        }
        if !tools.iter().any(|t| !executed.contains(&t.name)) {
            return NextToolSelection {
                tool: None,
                reason: "All tools have been executed".to_string(),
            };
        }

        let prompt = prompts::tool_selection_prompt(tools, executed, context, current_depth, max_depth);
        match self.complete_json(&prompt).await {
            Some(value) => match parse_selection(value) {
                Some(selection) => selection,
                None => fallback_selection(tools, executed, context),
            },
            None => fallback_selection(tools, executed, context),
        }
    }
}

/// Some models answer the selection prompt with a one-element array; accept
/// the first element when it actually names a tool.
fn parse_selection(value: Value) -> Option<NextToolSelection> {
    let candidate = match value {
        Value::Array(items) => items.into_iter().find(|item| {
            item.get("tool").map(|t| !t.is_null()).unwrap_or(false)
        })?,
        other => other,
    };
    serde_json::from_value(candidate).ok()
}

/// Schema-derived analysis used when the model gives nothing usable.
pub fn fallback_analysis(tools: &[ToolInfo]) -> Vec<DependencyAnalysis> {
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| DependencyAnalysis {
            tool: tool.name.clone(),
            required_params: tool.input_schema.required.clone(),
            can_execute_without_context: tool.input_schema.required.is_empty(),
            suggested_order: i + 1,
            dependencies: Vec::new(),
        })
        .collect()
}

/// Empty extraction: nothing resolved, every required parameter missing.
pub fn fallback_extraction(tool: &ToolInfo) -> ParameterExtraction {
    ParameterExtraction {
        params: Map::new(),
        sources: HashMap::new(),
        confidence: 0.0,
        missing_params: tool.input_schema.required.clone(),
    }
}

/// Deterministic selection used when the model gives nothing usable.
///
/// Prefers an unexecuted tool with no required parameters; failing that, one
/// whose required parameter names all appear as substrings of some context
/// value; failing that, ends the run.
pub fn fallback_selection(
    tools: &[ToolInfo],
    executed: &[String],
    context: &HashMap<String, Value>,
) -> NextToolSelection {
    let unexecuted: Vec<&ToolInfo> = tools
        .iter()
        .filter(|t| !executed.contains(&t.name))
        .collect();

    if let Some(tool) = unexecuted
        .iter()
        .find(|t| t.input_schema.required.is_empty())
    {
        return NextToolSelection {
            tool: Some(tool.name.clone()),
            reason: "Fallback selection: tool requires no parameters".to_string(),
        };
    }

    let context_text: Vec<String> = context
        .values()
        .map(|v| serde_json::to_string(v).unwrap_or_default())
        .collect();
    if let Some(tool) = unexecuted.iter().find(|t| {
        t.input_schema
            .required
            .iter()
            .all(|param| context_text.iter().any(|text| text.contains(param)))
    }) {
        return NextToolSelection {
            tool: Some(tool.name.clone()),
            reason: "Fallback selection: required parameters appear in context".to_string(),
        };
    }

    NextToolSelection {
        tool: None,
        reason: "No executable tool remains without model guidance".to_string(),
    }
}
