//! In-memory provenance graph of tool executions and discovered identifiers.
//!
//! Each orchestrator run owns one [`ResourceGraph`]: a DAG whose nodes are
//! tool invocations and extracted identifiers and whose edges record where a
//! parameter came from (`provided_<param>`) or which call surfaced an
//! identifier (`discovered`). The graph doubles as the LLM's working memory:
//! [`ResourceGraph::get_available_context`] renders every completed tool's
//! flattened result into the context map fed to parameter extraction and
//! next-tool selection.
//!
//! ```text
//! tool_listProjects_…  ──discovered──►  resource_projectId_1042
//!        │
//!        └─(flatten)──► tool_results["listProjects"]
//!                              │
//! tool_getProject_…  ◄─provided_projectId─┘   (edge from listProjects node)
//! ```
//!
//! Nodes are only ever created as children of the currently-completing tool,
//! so the graph stays acyclic by construction. All lookups against unknown
//! node ids are silent no-ops; the orchestrator never has to guard its
//! transitions.

use crate::mcpscope::protocol::parse_tool_payload;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Word count past which a context string is redacted wholesale.
const REDACT_WORD_LIMIT: usize = 100;
/// Arrays in context and in resource extraction are capped at this length.
const ARRAY_SCAN_LIMIT: usize = 10;

/// Lifecycle status of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses never transition again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Tool,
    Resource,
}

/// A tool invocation or a discovered identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    pub data: Value,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
    pub status: NodeStatus,
}

/// Directed provenance edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// `provided_<param>` or `discovered`.
    pub relation: String,
    #[serde(rename = "paramName")]
    pub param_name: String,
}

/// Adjacency-list DAG owned by a single orchestrator.
pub struct ResourceGraph {
    nodes: HashMap<String, GraphNode>,
    /// Insertion order, for stable serialization and lookup tie-breaking.
    node_order: Vec<String>,
    edges: Vec<GraphEdge>,
    /// Flattened result per tool name; most recent call wins.
    tool_results: HashMap<String, Value>,
    node_counter: u64,
    edge_counter: u64,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            tool_results: HashMap::new(),
            node_counter: 0,
            edge_counter: 0,
        }
    }

    /// Register a tool invocation about to be scheduled; returns its node id.
    pub fn add_pending_tool(&mut self, tool_name: &str) -> String {
        self.node_counter += 1;
        let id = format!(
            "tool_{}_{}_{}",
            tool_name,
            Utc::now().timestamp_millis(),
            self.node_counter
        );
        let node = GraphNode {
            id: id.clone(),
            node_type: NodeType::Tool,
            name: tool_name.to_string(),
            data: Value::Null,
            timestamp: Utc::now().timestamp_millis(),
            status: NodeStatus::Pending,
        };
        self.nodes.insert(id.clone(), node);
        self.node_order.push(id.clone());
        id
    }

    /// Move a pending tool node to running, recording its parameters.
    pub fn mark_tool_running(&mut self, node_id: &str, parameters: &Value) {
        if let Some(node) = self.transitionable(node_id) {
            node.status = NodeStatus::Running;
            node.data = json!({ "parameters": parameters });
        }
    }

    /// Record a failed execution. Unknown node ids are ignored.
    pub fn mark_tool_failed(&mut self, node_id: &str, error: &str) {
        if let Some(node) = self.transitionable(node_id) {
            node.status = NodeStatus::Failed;
            node.data = json!({ "error": error });
        }
    }

    /// Record a skipped execution with the reason and missing parameters.
    pub fn mark_tool_skipped(&mut self, node_id: &str, reason: &str, missing_params: &[String]) {
        if let Some(node) = self.transitionable(node_id) {
            node.status = NodeStatus::Skipped;
            node.data = json!({ "reason": reason, "missingParams": missing_params });
        }
    }

    /// Record a completed execution.
    ///
    /// In order: status + result, flattened result published under the tool
    /// name, one `provided_<param>` edge per resolvable source, then resource
    /// extraction over the result. `param_sources` maps parameter names to
    /// the node ids whose output supplied them.
    pub fn record_tool_execution(
        &mut self,
        node_id: &str,
        result: &Value,
        param_sources: &HashMap<String, String>,
    ) {
        let tool_name = match self.transitionable(node_id) {
            Some(node) => {
                node.status = NodeStatus::Completed;
                node.data = result.clone();
                node.name.clone()
            }
            None => return,
        };

        self.tool_results
            .insert(tool_name, flatten_result(result));

        for (param, source_id) in param_sources {
            if self.nodes.contains_key(source_id) {
                self.add_edge(
                    source_id.clone(),
                    node_id.to_string(),
                    format!("provided_{}", param),
                    param.clone(),
                );
            }
        }

        self.extract_resources(node_id, result);
    }

    /// Flattened results keyed by tool name, sanitized for LLM consumption.
    pub fn get_available_context(&self) -> HashMap<String, Value> {
        self.tool_results
            .iter()
            .map(|(tool, flat)| (tool.clone(), sanitize_for_llm(flat)))
            .collect()
    }

    /// Most recent tool node with the given name (max timestamp, later
    /// insertion breaking ties).
    pub fn node_id_for_tool(&self, tool_name: &str) -> Option<String> {
        let mut best: Option<&GraphNode> = None;
        for id in &self.node_order {
            let node = match self.nodes.get(id) {
                Some(node) => node,
                None => continue,
            };
            if node.node_type != NodeType::Tool || node.name != tool_name {
                continue;
            }
            let better = match best {
                Some(current) => node.timestamp >= current.timestamp,
                None => true,
            };
            if better {
                best = Some(node);
            }
        }
        best.map(|node| node.id.clone())
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Snapshot as `{nodes, edges}` in insertion order.
    pub fn to_value(&self) -> Value {
        let nodes: Vec<Value> = self
            .node_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter_map(|node| serde_json::to_value(node).ok())
            .collect();
        let edges: Vec<Value> = self
            .edges
            .iter()
            .filter_map(|edge| serde_json::to_value(edge).ok())
            .collect();
        json!({ "nodes": nodes, "edges": edges })
    }

    /// Mutable access to a node that may still transition; terminal nodes
    /// and unknown ids yield `None`.
    fn transitionable(&mut self, node_id: &str) -> Option<&mut GraphNode> {
        match self.nodes.get_mut(node_id) {
            Some(node) if !node.status.is_terminal() => Some(node),
            Some(_) => {
                debug!("ignoring transition on terminal node {}", node_id);
                None
            }
            None => None,
        }
    }

    fn add_edge(&mut self, source: String, target: String, relation: String, param_name: String) {
        self.edge_counter += 1;
        self.edges.push(GraphEdge {
            id: format!("edge_{}", self.edge_counter),
            source,
            target,
            relation,
            param_name,
        });
    }

    /// Mine identifier-looking strings out of a completed result and attach
    /// them as resource nodes.
    fn extract_resources(&mut self, tool_node_id: &str, result: &Value) {
        let payload = parse_tool_payload(result);
        let mut found: Vec<(String, String)> = Vec::new();
        collect_graph_resources(&payload, &mut found);

        for (field, value) in found {
            let resource_id = format!("resource_{}_{}", field, value);
            if self.nodes.contains_key(&resource_id) {
                continue;
            }
            let node = GraphNode {
                id: resource_id.clone(),
                node_type: NodeType::Resource,
                name: value.clone(),
                data: json!({ "fieldName": field, "value": value }),
                timestamp: Utc::now().timestamp_millis(),
                status: NodeStatus::Completed,
            };
            self.nodes.insert(resource_id.clone(), node);
            self.node_order.push(resource_id.clone());
            self.add_edge(
                tool_node_id.to_string(),
                resource_id,
                "discovered".to_string(),
                field,
            );
        }
    }
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Flatten a tool result into a single-level map.
///
/// Object leaves are recorded twice, under the bare key and under the full
/// dotted path, so both `projectId` and `project.projectId` resolve. Arrays
/// of length ≥ 1 recurse into their first element only; the full array is
/// kept under `<prefix>_array`.
pub fn flatten_result(result: &Value) -> Value {
    let payload = parse_tool_payload(result);
    let mut flat = Map::new();
    flatten_into(&payload, "", &mut flat);
    Value::Object(flat)
}

fn flatten_into(value: &Value, prefix: &str, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let full = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, &full, out);
            }
        }
        Value::Array(items) => {
            out.insert(format!("{}_array", prefix), value.clone());
            if let Some(first) = items.first() {
                flatten_into(first, prefix, out);
            }
        }
        leaf => {
            if prefix.is_empty() {
                return;
            }
            let bare = prefix.rsplit('.').next().unwrap_or(prefix);
            out.insert(bare.to_string(), leaf.clone());
            if bare != prefix {
                out.insert(prefix.to_string(), leaf.clone());
            }
        }
    }
}

/// Sanitize a flattened result before handing it to the LLM.
///
/// Strings over 100 whitespace-separated words are replaced wholesale,
/// arrays are cut to their first 10 elements, objects recurse.
pub fn sanitize_for_llm(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            if s.split_whitespace().count() > REDACT_WORD_LIMIT {
                Value::String("[REDACTED - long content]".to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(ARRAY_SCAN_LIMIT)
                .map(sanitize_for_llm)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_for_llm(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Field names the graph treats as identifier carriers.
///
/// Looser than the indexer's list on purpose: the graph wants coverage for
/// parameter resolution, not a clean persistent index.
fn is_graph_id_field(field_name: &str) -> bool {
    let lowered = field_name.to_lowercase();
    if lowered.ends_with("id") {
        return true;
    }
    if lowered.ends_with("key") && !lowered.contains("api") && !lowered.contains("secret") {
        return true;
    }
    matches!(
        lowered.as_str(),
        "uuid" | "slug" | "name" | "code" | "handle" | "identifier"
    )
}

/// Whether a string plausibly denotes an identifier.
fn is_graph_id_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 100
        && !value.contains("  ")
        && value.split_whitespace().count() <= 3
        && !value.starts_with("http://")
        && !value.starts_with("https://")
}

fn collect_graph_resources(value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match child {
                    Value::String(s) => {
                        if is_graph_id_field(key) && is_graph_id_value(s) {
                            out.push((key.clone(), s.clone()));
                        }
                    }
                    _ => collect_graph_resources(child, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter().take(ARRAY_SCAN_LIMIT) {
                collect_graph_resources(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_records_bare_key_and_dotted_path() {
        let flat = flatten_result(&json!({"project": {"projectId": "1042"}}));
        assert_eq!(flat["projectId"], "1042");
        assert_eq!(flat["project.projectId"], "1042");
    }

    #[test]
    fn flatten_keeps_arrays_and_first_element() {
        let flat = flatten_result(&json!({
            "results": [{"id": "a"}, {"id": "b"}]
        }));
        assert_eq!(flat["results_array"], json!([{"id": "a"}, {"id": "b"}]));
        // First element only.
        assert_eq!(flat["results.id"], "a");
        assert_eq!(flat["id"], "a");
    }

    #[test]
    fn flatten_unwraps_the_tool_envelope() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"spaceId\": \"DEV\"}"}]
        });
        let flat = flatten_result(&result);
        assert_eq!(flat["spaceId"], "DEV");
    }

    #[test]
    fn pending_running_completed_lifecycle() {
        let mut graph = ResourceGraph::new();
        let node_id = graph.add_pending_tool("listProjects");
        assert_eq!(graph.node(&node_id).unwrap().status, NodeStatus::Pending);

        graph.mark_tool_running(&node_id, &json!({}));
        assert_eq!(graph.node(&node_id).unwrap().status, NodeStatus::Running);

        graph.record_tool_execution(&node_id, &json!({"projectId": "1042"}), &HashMap::new());
        assert_eq!(graph.node(&node_id).unwrap().status, NodeStatus::Completed);

        // Terminal nodes never move again.
        graph.mark_tool_failed(&node_id, "late failure");
        assert_eq!(graph.node(&node_id).unwrap().status, NodeStatus::Completed);
    }

    #[test]
    fn unknown_node_ids_are_silently_ignored() {
        let mut graph = ResourceGraph::new();
        graph.mark_tool_running("missing", &json!({}));
        graph.mark_tool_failed("missing", "nope");
        graph.mark_tool_skipped("missing", "nope", &[]);
        graph.record_tool_execution("missing", &json!({}), &HashMap::new());
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn completion_adds_provenance_and_discovery_edges() {
        let mut graph = ResourceGraph::new();
        let first = graph.add_pending_tool("listProjects");
        graph.record_tool_execution(&first, &json!({"projectId": "1042"}), &HashMap::new());

        let second = graph.add_pending_tool("getProject");
        let mut sources = HashMap::new();
        sources.insert("projectId".to_string(), first.clone());
        sources.insert("ghost".to_string(), "no_such_node".to_string());
        graph.record_tool_execution(&second, &json!({"name": "Apollo"}), &sources);

        let provided: Vec<_> = graph
            .edges()
            .iter()
            .filter(|e| e.relation == "provided_projectId")
            .collect();
        assert_eq!(provided.len(), 1);
        assert_eq!(provided[0].source, first);
        assert_eq!(provided[0].target, second);

        // The unresolvable source contributed nothing.
        assert!(!graph.edges().iter().any(|e| e.param_name == "ghost"));

        // Every edge endpoint exists.
        for edge in graph.edges() {
            assert!(graph.node(&edge.source).is_some());
            assert!(graph.node(&edge.target).is_some());
        }
    }

    #[test]
    fn resource_nodes_are_created_once_per_graph() {
        let mut graph = ResourceGraph::new();
        let a = graph.add_pending_tool("a");
        graph.record_tool_execution(&a, &json!({"projectId": "1042"}), &HashMap::new());
        let b = graph.add_pending_tool("b");
        graph.record_tool_execution(&b, &json!({"projectId": "1042"}), &HashMap::new());

        let discovered: Vec<_> = graph
            .edges()
            .iter()
            .filter(|e| e.relation == "discovered")
            .collect();
        assert_eq!(discovered.len(), 1);
        assert!(graph.node("resource_projectId_1042").is_some());
    }

    #[test]
    fn resource_extraction_caps_arrays_at_ten() {
        let mut graph = ResourceGraph::new();
        let node = graph.add_pending_tool("listAll");
        let items: Vec<Value> = (0..25)
            .map(|i| json!({"itemId": format!("item-{}", i)}))
            .collect();
        graph.record_tool_execution(&node, &json!({"items": items}), &HashMap::new());

        let discovered = graph
            .edges()
            .iter()
            .filter(|e| e.relation == "discovered")
            .count();
        assert_eq!(discovered, 10);
    }

    #[test]
    fn graph_field_predicate_excludes_api_and_secret_keys() {
        assert!(is_graph_id_field("projectId"));
        assert!(is_graph_id_field("issueKey"));
        assert!(is_graph_id_field("name"));
        assert!(!is_graph_id_field("apiKey"));
        assert!(!is_graph_id_field("secretKey"));
        assert!(!is_graph_id_field("title"));
    }

    #[test]
    fn graph_value_predicate_rejects_prose_and_urls() {
        assert!(is_graph_id_value("PROJ-42"));
        assert!(is_graph_id_value("two words"));
        assert!(!is_graph_id_value("https://example.com/x"));
        assert!(!is_graph_id_value("a  doubled  space"));
        assert!(!is_graph_id_value("this has four whole tokens"));
        assert!(!is_graph_id_value(&"x".repeat(101)));
    }

    #[test]
    fn context_redacts_long_strings_and_truncates_arrays() {
        let long_text = vec!["word"; 150].join(" ");
        let value = json!({
            "summary": long_text,
            "rows": (0..20).collect::<Vec<i32>>()
        });
        let clean = sanitize_for_llm(&value);
        assert_eq!(clean["summary"], "[REDACTED - long content]");
        assert_eq!(clean["rows"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn latest_tool_node_wins_the_name_lookup() {
        let mut graph = ResourceGraph::new();
        let first = graph.add_pending_tool("search");
        let second = graph.add_pending_tool("search");
        assert_ne!(first, second);
        assert_eq!(graph.node_id_for_tool("search"), Some(second));
        assert_eq!(graph.node_id_for_tool("unknown"), None);
    }

    #[test]
    fn snapshot_serializes_nodes_and_edges() {
        let mut graph = ResourceGraph::new();
        let node = graph.add_pending_tool("t");
        graph.record_tool_execution(&node, &json!({"id": "X-1"}), &HashMap::new());

        let snapshot = graph.to_value();
        assert!(snapshot["nodes"].as_array().unwrap().len() >= 2);
        assert_eq!(snapshot["nodes"][0]["status"], "completed");
        assert_eq!(snapshot["edges"][0]["relation"], "discovered");
    }
}
