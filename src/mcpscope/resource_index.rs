//! Persistent identifier extraction from tool responses.
//!
//! The [`ResourceIndexer`] mines identifiers (UUIDs, numeric ids, path-like
//! and slug-like strings, issue keys) out of arbitrarily nested tool
//! responses, attributes them to the acting [`UserProfile`], deduplicates per
//! `(id, user)` pair, and persists the full list to
//! `~/.mcp-inspector/resources.json` on every insertion.
//!
//! # Extraction pipeline
//!
//! ```text
//! tools/call result
//!     │ parse_tool_payload()          unwrap JSON-in-text envelopes
//!     ▼
//! depth-first walk                    field-name heuristics + type detection
//!     │
//!     ▼
//! (id, user) dedup set ──► persisted resources.json ──► new entries returned
//! ```
//!
//! Two classes of match are emitted during the walk:
//!
//! - a string (or integer > 100) under an **ID-like field name** whose value
//!   passes ordered type detection, and
//! - a value matching a **strong pattern** (UUID v4, `ABC-123` issue keys)
//!   regardless of its field name.
//!
//! Everything else is ignored: prose, URLs, floats, strings longer than 500
//! characters.

use crate::mcpscope::profile_store::{write_json_atomically, ColorTag, UserProfile, CONFIG_DIR_NAME};
use crate::mcpscope::protocol::parse_tool_payload;
use chrono::Utc;
use lazy_static::lazy_static;
use log::{error, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

const RESOURCES_FILE_NAME: &str = "resources.json";

/// Longest string value ever considered an identifier.
const MAX_ID_LENGTH: usize = 500;
/// Parent-context strings longer than this are truncated with `"..."`.
const MAX_CONTEXT_STRING: usize = 200;

/// Field names treated as identifier carriers (exact or suffix match,
/// case-insensitive).
const ID_FIELD_NAMES: &[&str] = &[
    "id",
    "uuid",
    "key",
    "resourceId",
    "objectId",
    "entityId",
    "userId",
    "accountId",
    "projectId",
    "issueId",
    "pageId",
    "spaceId",
    "ari",
    "cloudId",
    "siteId",
    "workspaceId",
    "boardId",
    "ticketId",
    "documentId",
    "fileId",
    "folderId",
    "groupId",
    "teamId",
    "channelId",
    "conversationId",
    "messageId",
    "attachmentId",
    "commentId",
    "self",
];

lazy_static! {
    static ref UUID_RE: Regex = Regex::new(
        r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$"
    )
    .expect("uuid regex");
    static ref ARI_RE: Regex =
        Regex::new(r"^ari:cloud:[a-z]+::[a-z0-9-]+/[a-z0-9-]+$").expect("ari regex");
    static ref ISSUE_KEY_RE: Regex = Regex::new(r"^[A-Z]+-[0-9]+$").expect("issue key regex");
    static ref NUMERIC_RE: Regex = Regex::new(r"^[0-9]{3,}$").expect("numeric regex");
    static ref PATH_RE: Regex = Regex::new(r"^/[\w\-/]+$").expect("path regex");
    static ref SLUG_RE: Regex =
        Regex::new(r"(?i)^[a-z0-9]+[-_][a-z0-9]+[-_a-z0-9]*$").expect("slug regex");
}

/// Classification assigned to an extracted identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Uuid,
    Numeric,
    Path,
    Slug,
    Unknown,
}

/// One identifier mined from a tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedResource {
    /// UUIDv4 of this index entry.
    pub entry_id: String,
    /// The extracted identifier, in string form.
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Field name the value was found under, array indices stripped.
    pub field_name: String,
    /// Dotted path from the response root, with `[i]` for array hops.
    pub field_path: String,
    /// Primitive sibling fields of the value, sanitized.
    pub parent_context: Value,
    pub discovered_by_tool: String,
    /// Profile id, or `"anonymous"` when no profile was active.
    pub discovered_from_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_color: Option<ColorTag>,
    /// Discovery time, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResourcesFile {
    #[serde(default)]
    resources: Vec<IndexedResource>,
}

/// A candidate produced by the traversal, before dedup and attribution.
struct Candidate {
    id: String,
    resource_type: ResourceType,
    field_name: String,
    field_path: String,
    parent_context: Value,
}

/// Deduplicating, persistent identifier index.
pub struct ResourceIndexer {
    resources: Vec<IndexedResource>,
    seen: HashSet<String>,
    file_path: PathBuf,
}

impl ResourceIndexer {
    /// Open the index backed by `resources.json` under `~/.mcp-inspector/`.
    pub fn open_default() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME);
        Self::open(dir.join(RESOURCES_FILE_NAME))
    }

    /// Open the index backed by an explicit file path.
    ///
    /// A missing file is a fresh start; a malformed one is logged and
    /// treated as empty, and is not overwritten until the next successful
    /// insertion.
    pub fn open(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let resources = match fs::read_to_string(&file_path) {
            Ok(raw) => match serde_json::from_str::<ResourcesFile>(&raw) {
                Ok(file) => file.resources,
                Err(err) => {
                    warn!(
                        "resource index {} is malformed ({}); starting empty",
                        file_path.display(),
                        err
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let seen = resources
            .iter()
            .map(|r| dedup_key(&r.id, &r.discovered_from_user))
            .collect();

        Self {
            resources,
            seen,
            file_path,
        }
    }

    /// Extract identifiers from `response`, persist the new ones, and return
    /// them.
    ///
    /// Duplicate `(id, user)` pairs are skipped, so calling this twice with
    /// the same response yields an empty second result. A persistence
    /// failure is logged and the entries stay in memory.
    pub fn index_response(
        &mut self,
        user: Option<&UserProfile>,
        tool_name: &str,
        response: &Value,
    ) -> Vec<IndexedResource> {
        let payload = parse_tool_payload(response);
        let mut candidates = Vec::new();
        walk(&payload, String::new(), None, &mut candidates);

        let user_id = user.map(|u| u.id.as_str()).unwrap_or("anonymous");
        let mut added = Vec::new();
        for candidate in candidates {
            let key = dedup_key(&candidate.id, user_id);
            if !self.seen.insert(key) {
                continue;
            }
            let entry = IndexedResource {
                entry_id: Uuid::new_v4().to_string(),
                id: candidate.id,
                resource_type: candidate.resource_type,
                field_name: candidate.field_name,
                field_path: candidate.field_path,
                parent_context: candidate.parent_context,
                discovered_by_tool: tool_name.to_string(),
                discovered_from_user: user_id.to_string(),
                user_display_name: user.map(|u| u.display_name.clone()),
                user_color: user.map(|u| u.color_tag),
                timestamp: Utc::now().timestamp_millis(),
            };
            self.resources.push(entry.clone());
            added.push(entry);
        }

        if !added.is_empty() {
            if let Err(err) = self.save() {
                error!(
                    "failed to persist resource index to {}: {}",
                    self.file_path.display(),
                    err
                );
            }
        }
        added
    }

    /// All indexed resources, oldest first.
    pub fn resources(&self) -> &[IndexedResource] {
        &self.resources
    }

    pub fn count(&self) -> usize {
        self.resources.len()
    }

    /// Whether a given `(id, user)` pair has already been indexed.
    pub fn contains(&self, id: &str, user_id: Option<&str>) -> bool {
        self.seen
            .contains(&dedup_key(id, user_id.unwrap_or("anonymous")))
    }

    /// Drop every entry and rewrite the backing file.
    pub fn clear(&mut self) {
        self.resources.clear();
        self.seen.clear();
        if let Err(err) = self.save() {
            error!(
                "failed to persist cleared resource index to {}: {}",
                self.file_path.display(),
                err
            );
        }
    }

    fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let file = ResourcesFile {
            resources: self.resources.clone(),
        };
        write_json_atomically(&self.file_path, &file)
    }
}

fn dedup_key(id: &str, user_id: &str) -> String {
    format!("{}::{}", id, user_id)
}

/// Whether a field name is an identifier carrier.
///
/// Case-insensitive: either an exact member of the known list or a name
/// ending with one of its entries (`customerAccountId` matches `accountId`).
pub fn is_id_like_field(field_name: &str) -> bool {
    let lowered = field_name.to_lowercase();
    ID_FIELD_NAMES.iter().any(|known| {
        let known = known.to_lowercase();
        lowered == known || lowered.ends_with(&known)
    })
}

/// Ordered identifier classification; `None` when nothing matches.
///
/// Empty strings and strings longer than 500 characters never classify.
pub fn detect_resource_type(value: &str) -> Option<ResourceType> {
    if value.is_empty() || value.len() > MAX_ID_LENGTH {
        return None;
    }
    if UUID_RE.is_match(value) {
        Some(ResourceType::Uuid)
    } else if ARI_RE.is_match(value) {
        Some(ResourceType::Path)
    } else if ISSUE_KEY_RE.is_match(value) {
        Some(ResourceType::Slug)
    } else if NUMERIC_RE.is_match(value) {
        Some(ResourceType::Numeric)
    } else if PATH_RE.is_match(value) {
        Some(ResourceType::Path)
    } else if SLUG_RE.is_match(value) {
        Some(ResourceType::Slug)
    } else {
        None
    }
}

/// Patterns indexed even when the field name is not ID-like.
fn is_strong_pattern(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_ID_LENGTH {
        return false;
    }
    UUID_RE.is_match(value) || ISSUE_KEY_RE.is_match(value)
}

/// Last path segment with array indices stripped: `results[0].id` → `id`,
/// `ids[3]` → `ids`.
fn field_name_from_path(path: &str) -> String {
    let segment = path.rsplit('.').next().unwrap_or(path);
    match segment.find('[') {
        Some(idx) => segment[..idx].to_string(),
        None => segment.to_string(),
    }
}

fn walk(value: &Value, path: String, parent: Option<&Map<String, Value>>, out: &mut Vec<Candidate>) {
    match value {
        Value::String(s) => {
            let field_name = field_name_from_path(&path);
            let matched = if is_id_like_field(&field_name) {
                detect_resource_type(s)
            } else if is_strong_pattern(s) {
                detect_resource_type(s)
            } else {
                None
            };
            if let Some(resource_type) = matched {
                out.push(Candidate {
                    id: s.clone(),
                    resource_type,
                    field_name: field_name.clone(),
                    field_path: path,
                    parent_context: sanitize_parent_context(parent, &field_name),
                });
            }
        }
        Value::Number(n) => {
            let field_name = field_name_from_path(&path);
            let over_threshold = n.as_f64().map(|v| v > 100.0).unwrap_or(false);
            if over_threshold && is_id_like_field(&field_name) {
                out.push(Candidate {
                    id: n.to_string(),
                    resource_type: ResourceType::Numeric,
                    field_name: field_name.clone(),
                    field_path: path,
                    parent_context: sanitize_parent_context(parent, &field_name),
                });
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let child_path = format!("{}[{}]", path, i);
                // An object element becomes the parent of its own subtree.
                let child_parent = item.as_object().or(parent);
                walk(item, child_path, child_parent, out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                walk(child, child_path, Some(map), out);
            }
        }
        _ => {}
    }
}

/// Keep only primitive siblings; long strings are truncated.
fn sanitize_parent_context(parent: Option<&Map<String, Value>>, exclude_field: &str) -> Value {
    let mut context = Map::new();
    if let Some(parent) = parent {
        for (key, value) in parent {
            if key == exclude_field {
                continue;
            }
            match value {
                Value::String(s) => {
                    let kept = if s.chars().count() > MAX_CONTEXT_STRING {
                        let truncated: String = s.chars().take(MAX_CONTEXT_STRING).collect();
                        format!("{}...", truncated)
                    } else {
                        s.clone()
                    };
                    context.insert(key.clone(), Value::String(kept));
                }
                Value::Number(_) | Value::Bool(_) => {
                    context.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
    }
    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_detection_order() {
        assert_eq!(
            detect_resource_type("550e8400-e29b-41d4-a716-446655440000"),
            Some(ResourceType::Uuid)
        );
        assert_eq!(
            detect_resource_type("ari:cloud:jira::site/1234-abcd"),
            Some(ResourceType::Path)
        );
        assert_eq!(detect_resource_type("PROJ-42"), Some(ResourceType::Slug));
        assert_eq!(detect_resource_type("12345"), Some(ResourceType::Numeric));
        assert_eq!(
            detect_resource_type("/wiki/spaces/DEV"),
            Some(ResourceType::Path)
        );
        assert_eq!(
            detect_resource_type("my-team_handle"),
            Some(ResourceType::Slug)
        );
        assert_eq!(detect_resource_type("just prose"), None);
        assert_eq!(detect_resource_type(""), None);
    }

    #[test]
    fn oversized_strings_never_classify() {
        let long = "a".repeat(501);
        assert_eq!(detect_resource_type(&long), None);
        assert!(!is_strong_pattern(&long));
    }

    #[test]
    fn field_name_heuristics() {
        assert!(is_id_like_field("id"));
        assert!(is_id_like_field("Key"));
        assert!(is_id_like_field("customerAccountId"));
        assert!(is_id_like_field("self"));
        assert!(!is_id_like_field("title"));
        assert!(!is_id_like_field("description"));
    }

    #[test]
    fn field_name_strips_array_indices() {
        assert_eq!(field_name_from_path("results[0].id"), "id");
        assert_eq!(field_name_from_path("ids[3]"), "ids");
        assert_eq!(field_name_from_path("key"), "key");
    }

    #[test]
    fn indexes_envelope_payload_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

        let response = json!({
            "content": [{
                "type": "text",
                "text": "{\"results\":[{\"id\":\"550e8400-e29b-41d4-a716-446655440000\",\"title\":\"hello\"}]}"
            }]
        });
        let added = indexer.index_response(None, "listThings", &response);

        assert_eq!(added.len(), 1);
        let entry = &added[0];
        assert_eq!(entry.id, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(entry.resource_type, ResourceType::Uuid);
        assert_eq!(entry.field_name, "id");
        assert_eq!(entry.field_path, "results[0].id");
        assert_eq!(entry.parent_context, json!({"title": "hello"}));
        assert_eq!(entry.discovered_from_user, "anonymous");
        assert_eq!(entry.discovered_by_tool, "listThings");
    }

    #[test]
    fn duplicate_ids_are_indexed_once_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));
        let response = json!({"issueId": "10042"});

        assert_eq!(indexer.index_response(None, "getIssue", &response).len(), 1);
        assert!(indexer.index_response(None, "getIssue", &response).is_empty());
        assert_eq!(indexer.count(), 1);
    }

    #[test]
    fn small_numbers_under_id_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

        assert!(indexer
            .index_response(None, "t", &json!({"boardId": 100}))
            .is_empty());
        assert_eq!(
            indexer.index_response(None, "t", &json!({"boardId": 101}))[0].id,
            "101"
        );
    }

    #[test]
    fn strong_patterns_index_outside_id_fields_but_slugs_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

        let added = indexer.index_response(
            None,
            "t",
            &json!({
                "reference": "550e8400-e29b-41d4-a716-446655440000",
                "label": "my-nice_slug"
            }),
        );
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].resource_type, ResourceType::Uuid);
    }

    #[test]
    fn parent_context_truncates_long_strings() {
        let dir = tempfile::tempdir().unwrap();
        let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

        let long = "x".repeat(250);
        let added = indexer.index_response(
            None,
            "t",
            &json!({"id": "PROJ-1", "summary": long, "nested": {"skipped": true}}),
        );
        let context = added[0].parent_context.as_object().unwrap();
        let summary = context["summary"].as_str().unwrap();
        assert_eq!(summary.len(), 203);
        assert!(summary.ends_with("..."));
        // Non-primitive siblings are dropped.
        assert!(!context.contains_key("nested"));
    }

    #[test]
    fn reload_rebuilds_the_dedup_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");

        let mut first = ResourceIndexer::open(&path);
        first.index_response(None, "t", &json!({"id": "ABC-9"}));

        let mut second = ResourceIndexer::open(&path);
        assert_eq!(second.count(), 1);
        assert!(second
            .index_response(None, "t", &json!({"id": "ABC-9"}))
            .is_empty());
        assert!(second.contains("ABC-9", None));
    }
}
