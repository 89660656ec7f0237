//! Agent event envelope and subscriber fan-out.
//!
//! Every state transition and per-tool milestone of an
//! [`AgentOrchestrator`](crate::agent::AgentOrchestrator) is published as an
//! [`AgentEvent`] to all subscribers of its [`EventBus`]. Subscribers receive
//! events in publication order; a slow subscriber falls behind rather than
//! blocking the agent, losing its oldest buffered events first (each loss is
//! logged).
//!
//! # Event Flow (one successful run)
//!
//! ```text
//! status_change { running }
//!   └─ analysis_complete
//!   └─ tool_start        { tool: "listProjects", depth: 1 }
//!   └─ tool_complete     { tool: "listProjects" }
//!   └─ tool_start        { tool: "getProject", depth: 2 }
//!   └─ tool_failed       { tool: "getProject", error: "..." }
//!   └─ tool_skipped      { tool: "updateProject", reason: "..." }
//! agent_complete { toolsExecuted: 2, toolsFlagged: 1 }
//! ```
//!
//! A fresh subscriber can ask the orchestrator for a synthetic `state` event
//! carrying the current snapshot before the live stream begins
//! (`subscribe_with_snapshot`).

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Default ring capacity per bus; beyond it the slowest subscriber starts
/// losing its oldest events.
const DEFAULT_CAPACITY: usize = 256;

/// Category of an [`AgentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    StatusChange,
    AnalysisComplete,
    ToolStart,
    ToolComplete,
    ToolFailed,
    ToolSkipped,
    AgentComplete,
    Error,
    /// Synthetic snapshot delivered to new subscribers on request.
    State,
}

/// One lifecycle notification: what happened, its payload, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: AgentEventKind,
    pub data: Value,
    /// Publication time, epoch milliseconds.
    pub timestamp: i64,
}

impl AgentEvent {
    /// Build an event stamped with the current time.
    pub fn new(kind: AgentEventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Fan-out of agent events to any number of subscribers.
///
/// Cloning is cheap; the orchestrator and its spawned loop task share one
/// bus. Publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus with an explicit per-subscriber buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current subscriber.
    pub fn publish(&self, event: AgentEvent) {
        // send() only errors when nobody is listening, which is fine.
        let _ = self.sender.send(event);
    }

    /// Open a live stream of events from this point on.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            initial: VecDeque::new(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Open a stream that yields `initial` before any live events.
    pub fn subscribe_with_initial(&self, initial: AgentEvent) -> EventStream {
        let mut stream = self.subscribe();
        stream.initial.push_back(initial);
        stream
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's ordered view of the event stream.
pub struct EventStream {
    initial: VecDeque<AgentEvent>,
    receiver: broadcast::Receiver<AgentEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone.
    ///
    /// When this subscriber has fallen behind, its oldest buffered events are
    /// discarded (logged) and delivery resumes with what is still retained.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event subscriber lagged; dropped {} oldest events", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and polling consumers.
    pub fn try_next(&mut self) -> Option<AgentEvent> {
        if let Some(event) = self.initial.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("event subscriber lagged; dropped {} oldest events", missed);
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
