//! Agent orchestrator: lifecycle state machine and execution loop.
//!
//! The [`AgentOrchestrator`] autonomously explores a tool server. It
//! discovers the catalog, asks the LLM how the tools depend on one another,
//! then repeatedly selects a tool, extracts its parameters from the results
//! accumulated in the [`ResourceGraph`], executes it, and feeds the outcome
//! back — all while streaming lifecycle events to subscribers.
//!
//! # State machine
//!
//! ```text
//!           configure()           start()
//!   (unconfigured) ────► idle ────────────► running ───► completed
//!                          ▲                  │  ▲           │
//!                          │                  │  │           │
//!                       stop()             pause│resume()    │
//!                          │                  ▼  │           │
//!                          └──────────── paused ─┘           │
//!                                             │              │
//!                                             └──► error ◄───┘ (on fatal)
//! ```
//!
//! Tool failures are never fatal: a failed call is recorded on its step and
//! the loop moves on. The run ends when the LLM returns no next tool, the
//! depth budget is exhausted, every tool has executed, or the operator stops
//! the agent. Only errors in the orchestrator's own control path (e.g. the
//! initial `tools/list`) move the machine to `error`.
//!
//! # Safety valves
//!
//! Two guards keep a confused model from thrashing the downstream server:
//! a tool whose required parameters cannot be resolved with confidence is
//! **flagged and skipped** instead of called with garbage, and a tool whose
//! parameter provenance chain would exceed `max_depth` is skipped with the
//! depth recorded in the reason.

use crate::mcpscope::event::{AgentEvent, AgentEventKind, EventBus, EventStream};
use crate::mcpscope::llm::{
    DependencyAnalysis, LlmCapability, LlmClient, LlmTransport, CONFIDENCE_FLAG_THRESHOLD,
};
use crate::mcpscope::protocol::ToolInfo;
use crate::mcpscope::resource_graph::ResourceGraph;
use chrono::Utc;
use futures_util::future::BoxFuture;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Default dependency-chain budget.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// How often a paused loop re-checks its status.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Callback that lists the downstream server's tools.
pub type ListToolsFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<ToolInfo>, BoxError>> + Send + Sync>;

/// Callback that invokes one tool with resolved parameters.
pub type ToolCallFn =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Lifecycle status of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

/// Status of one recorded execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One tool invocation in the agent's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub tool_name: String,
    /// Graph node backing this step.
    pub node_id: String,
    pub parameters: Map<String, Value>,
    /// Parameter name → source graph node id.
    pub parameter_sources: HashMap<String, String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step creation time, epoch milliseconds.
    pub timestamp: i64,
    /// Dependency depth, `1..=max_depth`.
    pub depth: u32,
}

/// A tool the agent refused to run, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaggedTool {
    pub tool: String,
    pub reason: String,
}

/// Snapshot of everything the orchestrator knows about the current run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub status: AgentStatus,
    pub tools: Vec<ToolInfo>,
    pub analysis: Vec<DependencyAnalysis>,
    pub execution_history: Vec<ExecutionStep>,
    pub current_step: usize,
    pub current_depth: u32,
    pub max_depth: u32,
    pub flagged_tools: Vec<FlaggedTool>,
    /// Serialized `{nodes, edges}` snapshot of the resource graph.
    pub graph: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            tools: Vec::new(),
            analysis: Vec::new(),
            execution_history: Vec::new(),
            current_step: 0,
            current_depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            flagged_tools: Vec::new(),
            graph: json!({ "nodes": [], "edges": [] }),
            start_time: None,
            end_time: None,
            error: None,
        }
    }
}

/// Everything a run needs: the model capability and the two tool callbacks.
#[derive(Clone)]
pub struct AgentConfig {
    pub llm: Arc<dyn LlmCapability>,
    pub list_tools: ListToolsFn,
    pub tool_call: ToolCallFn,
    pub max_depth: u32,
}

impl AgentConfig {
    /// Configure with a provider transport, wrapped in the production
    /// [`LlmClient`] (prompts + fallbacks).
    pub fn new(
        transport: Arc<dyn LlmTransport>,
        list_tools: ListToolsFn,
        tool_call: ToolCallFn,
    ) -> Self {
        Self::with_capability(Arc::new(LlmClient::new(transport)), list_tools, tool_call)
    }

    /// Configure from a provider variant and API key, using the provider's
    /// default model unless one is named.
    pub fn for_provider(
        provider: crate::mcpscope::llm::Provider,
        api_key: &str,
        model: Option<&str>,
        list_tools: ListToolsFn,
        tool_call: ToolCallFn,
    ) -> Self {
        let transport = crate::mcpscope::llm::create_transport(provider, api_key, model);
        Self::new(transport, list_tools, tool_call)
    }

    /// Configure with an arbitrary [`LlmCapability`] implementation.
    pub fn with_capability(
        llm: Arc<dyn LlmCapability>,
        list_tools: ListToolsFn,
        tool_call: ToolCallFn,
    ) -> Self {
        Self {
            llm,
            list_tools,
            tool_call,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Override the dependency-chain budget (builder pattern).
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}

struct Inner {
    state: RwLock<AgentState>,
    graph: RwLock<ResourceGraph>,
    config: RwLock<Option<AgentConfig>>,
    cancel: Mutex<CancellationToken>,
    bus: EventBus,
}

/// Depth-bounded, dependency-driven tool scheduler.
///
/// The orchestrator exclusively owns its [`AgentState`] and its
/// [`ResourceGraph`]; multiple orchestrators can coexist independently.
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

impl AgentOrchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(AgentState::default()),
                graph: RwLock::new(ResourceGraph::new()),
                config: RwLock::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                bus: EventBus::new(),
            }),
        }
    }

    /// Install or replace the run configuration.
    ///
    /// Idempotent; may be called any number of times before a run, but not
    /// while one is active.
    pub async fn configure(&self, config: AgentConfig) -> Result<(), BoxError> {
        let state = self.inner.state.read().await;
        if matches!(state.status, AgentStatus::Running | AgentStatus::Paused) {
            return Err("cannot reconfigure a running agent".into());
        }
        drop(state);
        *self.inner.config.write().await = Some(config);
        Ok(())
    }

    /// Reset state and launch the execution loop.
    ///
    /// Rejects when unconfigured or when a run is already active.
    pub async fn start(&self) -> Result<(), BoxError> {
        let config = {
            let state = self.inner.state.read().await;
            if matches!(state.status, AgentStatus::Running | AgentStatus::Paused) {
                return Err("agent is already running".into());
            }
            drop(state);
            self.inner
                .config
                .read()
                .await
                .clone()
                .ok_or("agent is not configured")?
        };

        {
            let mut state = self.inner.state.write().await;
            *state = AgentState::default();
            state.max_depth = config.max_depth;
            state.status = AgentStatus::Running;
            state.start_time = Some(Utc::now().timestamp_millis());
        }
        *self.inner.graph.write().await = ResourceGraph::new();

        let token = CancellationToken::new();
        *self.inner.cancel.lock().await = token.clone();

        self.inner
            .bus
            .publish(AgentEvent::new(
                AgentEventKind::StatusChange,
                json!({ "status": AgentStatus::Running }),
            ));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::run(inner, config, token).await;
        });
        Ok(())
    }

    /// Pause after the current step. The in-flight tool call completes; the
    /// loop halts before selecting the next tool.
    pub async fn pause(&self) -> bool {
        let mut state = self.inner.state.write().await;
        if state.status != AgentStatus::Running {
            return false;
        }
        state.status = AgentStatus::Paused;
        drop(state);
        self.inner.bus.publish(AgentEvent::new(
            AgentEventKind::StatusChange,
            json!({ "status": AgentStatus::Paused }),
        ));
        true
    }

    /// Resume a paused run.
    pub async fn resume(&self) -> bool {
        let mut state = self.inner.state.write().await;
        if state.status != AgentStatus::Paused {
            return false;
        }
        state.status = AgentStatus::Running;
        drop(state);
        self.inner.bus.publish(AgentEvent::new(
            AgentEventKind::StatusChange,
            json!({ "status": AgentStatus::Running }),
        ));
        true
    }

    /// Abort the run. Any in-flight LLM or tool call is abandoned; its
    /// result, if it ever arrives, is discarded without further events.
    pub async fn stop(&self) {
        self.inner.cancel.lock().await.cancel();
        let mut state = self.inner.state.write().await;
        if matches!(state.status, AgentStatus::Running | AgentStatus::Paused) {
            state.status = AgentStatus::Idle;
            state.end_time = Some(Utc::now().timestamp_millis());
        }
    }

    /// Current state with a fresh graph snapshot folded in.
    pub async fn get_state(&self) -> AgentState {
        let mut state = self.inner.state.read().await.clone();
        state.graph = self.inner.graph.read().await.to_value();
        state
    }

    /// Live event stream from this point on.
    pub fn subscribe(&self) -> EventStream {
        self.inner.bus.subscribe()
    }

    /// Live event stream preceded by a synthetic `state` snapshot event.
    pub async fn subscribe_with_snapshot(&self) -> EventStream {
        let snapshot = self.get_state().await;
        let data = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
        self.inner
            .bus
            .subscribe_with_initial(AgentEvent::new(AgentEventKind::State, data))
    }
}

impl Default for AgentOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one pass through the execution loop.
enum RunOutcome {
    Completed,
    Cancelled,
}

impl Inner {
    async fn run(inner: Arc<Inner>, config: AgentConfig, cancel: CancellationToken) {
        match Self::execute(&inner, &config, &cancel).await {
            Ok(RunOutcome::Completed) => {
                if cancel.is_cancelled() {
                    return;
                }
                let data = {
                    let mut state = inner.state.write().await;
                    state.status = AgentStatus::Completed;
                    state.end_time = Some(Utc::now().timestamp_millis());
                    let executed = state
                        .execution_history
                        .iter()
                        .filter(|s| s.status == StepStatus::Completed)
                        .count();
                    let failed = state
                        .execution_history
                        .iter()
                        .filter(|s| s.status == StepStatus::Failed)
                        .count();
                    json!({
                        "toolsExecuted": executed,
                        "toolsFailed": failed,
                        "toolsFlagged": state.flagged_tools.len(),
                        "maxDepthReached": state.current_depth,
                    })
                };
                inner
                    .bus
                    .publish(AgentEvent::new(AgentEventKind::AgentComplete, data));
                info!("agent run completed");
            }
            Ok(RunOutcome::Cancelled) => {
                debug!("agent run cancelled");
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                let message = err.to_string();
                error!("agent run failed: {}", message);
                {
                    let mut state = inner.state.write().await;
                    state.status = AgentStatus::Error;
                    state.error = Some(message.clone());
                    state.end_time = Some(Utc::now().timestamp_millis());
                }
                inner.bus.publish(AgentEvent::new(
                    AgentEventKind::Error,
                    json!({ "error": message }),
                ));
            }
        }
    }

    async fn execute(
        inner: &Arc<Inner>,
        config: &AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, BoxError> {
        // 1. Discover the catalog. Failure here is fatal to the run.
        let tools = (config.list_tools)().await?;
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        {
            let mut state = inner.state.write().await;
            state.tools = tools.clone();
        }

        // 2. Analyze dependencies. The LLM layer never fails, only degrades.
        let llm = &config.llm;
        let analysis = llm.analyze_tool_dependencies(&tools).await;
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        let analysis_data = serde_json::to_value(&analysis).unwrap_or(Value::Null);
        {
            let mut state = inner.state.write().await;
            state.analysis = analysis;
        }
        inner.bus.publish(AgentEvent::new(
            AgentEventKind::AnalysisComplete,
            json!({ "analysis": analysis_data }),
        ));

        // 3. Main loop.
        let mut executed: Vec<String> = Vec::new();
        let mut tool_depths: HashMap<String, u32> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if !Self::wait_while_paused(inner, cancel).await {
                return Ok(RunOutcome::Cancelled);
            }

            let context = inner.graph.read().await.get_available_context();
            let (current_depth, max_depth) = {
                let state = inner.state.read().await;
                (state.current_depth, state.max_depth)
            };

            let pick = llm
                .select_next_tool(&tools, &executed, &context, current_depth, max_depth)
                .await;
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let tool_name = match pick.tool {
                Some(name) => name,
                None => {
                    info!("selection ended the run: {}", pick.reason);
                    break;
                }
            };
            // The model may repeat itself despite the prompt.
            if executed.contains(&tool_name) {
                debug!("model re-selected {}; skipping", tool_name);
                continue;
            }
            executed.push(tool_name.clone());

            let tool = match tools.iter().find(|t| t.name == tool_name) {
                Some(tool) => tool.clone(),
                None => {
                    debug!("model selected unknown tool {}", tool_name);
                    continue;
                }
            };

            let node_id = inner.graph.write().await.add_pending_tool(&tool_name);

            let extraction = llm.extract_parameters(&tool, &context).await;
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            // Confidence guard: unresolved required parameters plus a shaky
            // extraction means flag, not execute.
            if !extraction.missing_params.is_empty()
                && extraction.confidence < CONFIDENCE_FLAG_THRESHOLD
            {
                let reason = "Could not resolve required parameters from available context";
                Self::flag_and_skip(
                    inner,
                    &tool_name,
                    &node_id,
                    reason,
                    &extraction.missing_params,
                )
                .await;
                continue;
            }

            // Depth: one past the deepest tool that supplied a parameter.
            // Only the token before the first '.' of a source label names the
            // source tool; depths are recorded once per tool name and reused.
            let source_depth = extraction
                .sources
                .values()
                .filter_map(|label| {
                    let source_tool = label.split('.').next().unwrap_or(label);
                    tool_depths.get(source_tool).copied()
                })
                .max()
                .unwrap_or(0);
            let tool_depth = source_depth + 1;
            tool_depths.entry(tool_name.clone()).or_insert(tool_depth);

            if tool_depth > max_depth {
                let reason = format!("Exceeds max depth ({} > {})", tool_depth, max_depth);
                Self::flag_and_skip(inner, &tool_name, &node_id, &reason, &[]).await;
                continue;
            }

            // Resolve source labels to concrete graph nodes; parameters whose
            // source tool never ran contribute no provenance edge.
            let resolved_sources: HashMap<String, String> = {
                let graph = inner.graph.read().await;
                extraction
                    .sources
                    .iter()
                    .filter_map(|(param, label)| {
                        let source_tool = label.split('.').next().unwrap_or(label);
                        graph
                            .node_id_for_tool(source_tool)
                            .map(|node| (param.clone(), node))
                    })
                    .collect()
            };

            {
                let mut state = inner.state.write().await;
                state.current_depth = state.current_depth.max(tool_depth);
                state.execution_history.push(ExecutionStep {
                    tool_name: tool_name.clone(),
                    node_id: node_id.clone(),
                    parameters: extraction.params.clone(),
                    parameter_sources: resolved_sources.clone(),
                    status: StepStatus::Running,
                    result: None,
                    error: None,
                    timestamp: Utc::now().timestamp_millis(),
                    depth: tool_depth,
                });
                state.current_step = state.execution_history.len();
            }
            let params_value = Value::Object(extraction.params.clone());
            inner.graph.write().await.mark_tool_running(&node_id, &params_value);
            inner.bus.publish(AgentEvent::new(
                AgentEventKind::ToolStart,
                json!({
                    "tool": tool_name,
                    "parameters": params_value,
                    "depth": tool_depth,
                }),
            ));

            let call_result = (config.tool_call)(tool_name.clone(), params_value.clone()).await;
            if cancel.is_cancelled() {
                // Late result after stop(): discard without events.
                return Ok(RunOutcome::Cancelled);
            }

            match call_result {
                Ok(result) => {
                    {
                        let mut state = inner.state.write().await;
                        if let Some(step) = state.execution_history.last_mut() {
                            step.status = StepStatus::Completed;
                            step.result = Some(result.clone());
                        }
                    }
                    inner
                        .graph
                        .write()
                        .await
                        .record_tool_execution(&node_id, &result, &resolved_sources);
                    inner.bus.publish(AgentEvent::new(
                        AgentEventKind::ToolComplete,
                        json!({ "tool": tool_name, "depth": tool_depth }),
                    ));
                }
                Err(err) => {
                    // Tool failures are non-fatal; record and move on.
                    let message = err.to_string();
                    {
                        let mut state = inner.state.write().await;
                        if let Some(step) = state.execution_history.last_mut() {
                            step.status = StepStatus::Failed;
                            step.error = Some(message.clone());
                        }
                    }
                    inner.graph.write().await.mark_tool_failed(&node_id, &message);
                    inner.bus.publish(AgentEvent::new(
                        AgentEventKind::ToolFailed,
                        json!({ "tool": tool_name, "error": message }),
                    ));
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Block while paused. Returns false when the run should end instead.
    async fn wait_while_paused(inner: &Arc<Inner>, cancel: &CancellationToken) -> bool {
        loop {
            let status = inner.state.read().await.status;
            match status {
                AgentStatus::Running => return true,
                AgentStatus::Paused => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                    }
                }
                // stop() or an external transition ended the run.
                _ => return false,
            }
        }
    }

    async fn flag_and_skip(
        inner: &Arc<Inner>,
        tool_name: &str,
        node_id: &str,
        reason: &str,
        missing_params: &[String],
    ) {
        {
            let mut state = inner.state.write().await;
            state.flagged_tools.push(FlaggedTool {
                tool: tool_name.to_string(),
                reason: reason.to_string(),
            });
        }
        inner
            .graph
            .write()
            .await
            .mark_tool_skipped(node_id, reason, missing_params);
        inner.bus.publish(AgentEvent::new(
            AgentEventKind::ToolSkipped,
            json!({
                "tool": tool_name,
                "reason": reason,
                "missingParams": missing_params,
            }),
        ));
    }
}
