//! Canonical prompt templates for the three LLM operations.
//!
//! These templates are part of the behavioral contract: dependency analysis,
//! parameter extraction, and next-tool selection all key off the exact
//! phrasing here (the executed/unexecuted split, the category ranking, the
//! depth indicator). Every template instructs the model to emit raw JSON
//! without markdown; the transports still strip fences defensively.

use crate::mcpscope::protocol::ToolInfo;
use serde_json::Value;
use std::collections::HashMap;

/// Render one tool descriptor for inclusion in a prompt.
fn describe_tool(tool: &ToolInfo) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "- {}: {}",
        tool.name,
        tool.description.as_deref().unwrap_or("(no description)")
    ));
    for (name, prop) in &tool.input_schema.properties {
        let required = if tool.input_schema.required.contains(name) {
            "required"
        } else {
            "optional"
        };
        let enum_note = match &prop.enum_values {
            Some(values) => format!(", one of [{}]", values.join(", ")),
            None => String::new(),
        };
        lines.push(format!(
            "    {} ({}, {}{}): {}",
            name,
            prop.prop_type,
            required,
            enum_note,
            prop.description.as_deref().unwrap_or("")
        ));
    }
    lines.join("\n")
}

fn describe_tools(tools: &[ToolInfo]) -> String {
    tools.iter().map(describe_tool).collect::<Vec<_>>().join("\n")
}

fn render_context(context: &HashMap<String, Value>) -> String {
    if context.is_empty() {
        return "(no tools executed yet)".to_string();
    }
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    keys.iter()
        .map(|tool| {
            let value = serde_json::to_string(&context[*tool]).unwrap_or_default();
            format!("{}: {}", tool, value)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for `analyze_tool_dependencies`.
pub fn dependency_analysis_prompt(tools: &[ToolInfo]) -> String {
    format!(
        "You are analyzing the tools exposed by an MCP server to determine their data \
dependencies.\n\nTools:\n{tools}\n\nFor each tool, determine which parameters it requires, \
whether it can execute with no prior context, a suggested execution order (1 = first), and \
which other tool's output field could supply each required parameter.\n\nRespond with a JSON \
array, one entry per tool:\n[{{\"tool\": \"name\", \"requiredParams\": [\"param\"], \
\"canExecuteWithoutContext\": true, \"suggestedOrder\": 1, \"dependencies\": \
[{{\"paramName\": \"param\", \"sourceTool\": \"otherTool\", \"sourceField\": \"field\", \
\"confidence\": 0.9}}]}}]\n\nReturn raw JSON only. Do not wrap the response in markdown \
code fences.",
        tools = describe_tools(tools)
    )
}

/// Prompt for `extract_parameters`.
pub fn parameter_extraction_prompt(tool: &ToolInfo, context: &HashMap<String, Value>) -> String {
    format!(
        "You are resolving parameters for the tool \"{name}\" from the results of previously \
executed tools.\n\nTool:\n{tool}\n\nAvailable context (tool name -> flattened result):\n\
{context}\n\nProduce the best parameter values you can justify from the context. For every \
parameter you fill in, record its source as \"toolName.fieldPath\". List required parameters \
you could not resolve in missingParams and rate your overall confidence from 0 to 1.\n\n\
Respond with a single JSON object:\n{{\"params\": {{\"param\": \"value\"}}, \"sources\": \
{{\"param\": \"toolName.fieldPath\"}}, \"confidence\": 0.8, \"missingParams\": []}}\n\n\
Return raw JSON only. Do not wrap the response in markdown code fences.",
        name = tool.name,
        tool = describe_tool(tool),
        context = render_context(context)
    )
}

/// Prompt for `select_next_tool`.
pub fn tool_selection_prompt(
    tools: &[ToolInfo],
    executed: &[String],
    context: &HashMap<String, Value>,
    current_depth: u32,
    max_depth: u32,
) -> String {
    let unexecuted: Vec<&ToolInfo> = tools
        .iter()
        .filter(|t| !executed.contains(&t.name))
        .collect();
    let unexecuted_block = unexecuted
        .iter()
        .map(|t| describe_tool(t))
        .collect::<Vec<_>>()
        .join("\n");
    let executed_block = if executed.is_empty() {
        "(none)".to_string()
    } else {
        executed.join(", ")
    };

    format!(
        "You are driving an autonomous exploration of an MCP server, one tool call at a \
time.\n\nAlready executed - do NOT select any of these again: {executed}\n\nCandidate tools \
(unexecuted):\n{candidates}\n\nAvailable context (tool name -> flattened result):\n{context}\n\n\
Depth indicator: {depth} of {max_depth} dependency levels used.\n\nPick the single best next \
tool, preferring in order: tools with no arguments, then search/list tools, then get/read \
tools, and mutating tools last. Only pick a tool whose required parameters are resolvable \
from the context. If nothing sensible remains, return null for the tool.\n\nRespond with a \
single JSON object:\n{{\"tool\": \"name\" or null, \"reason\": \"one sentence\"}}\n\nReturn \
raw JSON only. Do not wrap the response in markdown code fences.",
        executed = executed_block,
        candidates = unexecuted_block,
        context = render_context(context),
        depth = current_depth,
        max_depth = max_depth
    )
}
