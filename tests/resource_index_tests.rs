use mcpscope::profile_store::{ColorTag, ProfileStore};
use mcpscope::resource_index::{ResourceIndexer, ResourceType};
use serde_json::json;

fn sample_envelope() -> serde_json::Value {
    json!({
        "content": [{
            "type": "text",
            "text": "{\"results\":[{\"id\":\"550e8400-e29b-41d4-a716-446655440000\",\"title\":\"hello\"}]}"
        }]
    })
}

#[test]
fn test_envelope_extraction_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut profiles = ProfileStore::open(dir.path().join("auth.json"));
    let user = profiles.create_profile("U One", ColorTag::Green).unwrap();

    let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));
    let added = indexer.index_response(Some(&user), "listThings", &sample_envelope());

    assert_eq!(added.len(), 1);
    let entry = &added[0];
    assert_eq!(entry.id, "550e8400-e29b-41d4-a716-446655440000");
    assert_eq!(entry.resource_type, ResourceType::Uuid);
    assert_eq!(entry.field_name, "id");
    assert_eq!(entry.field_path, "results[0].id");
    assert_eq!(entry.parent_context, json!({"title": "hello"}));
    assert_eq!(entry.discovered_from_user, user.id);
    assert_eq!(entry.user_display_name.as_deref(), Some("U One"));
    assert_eq!(entry.user_color, Some(ColorTag::Green));
}

#[test]
fn test_second_identical_call_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

    let first = indexer.index_response(None, "listThings", &sample_envelope());
    let second = indexer.index_response(None, "listThings", &sample_envelope());

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(indexer.count(), 1);
}

#[test]
fn test_same_id_is_kept_once_per_user() {
    let dir = tempfile::tempdir().unwrap();
    let mut profiles = ProfileStore::open(dir.path().join("auth.json"));
    let alice = profiles.create_profile("Alice", ColorTag::Blue).unwrap();
    let bob = profiles.create_profile("Bob", ColorTag::Red).unwrap();

    let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));
    let payload = json!({"issueId": "PROJ-7"});

    assert_eq!(indexer.index_response(Some(&alice), "t", &payload).len(), 1);
    assert_eq!(indexer.index_response(Some(&bob), "t", &payload).len(), 1);
    assert!(indexer.index_response(Some(&alice), "t", &payload).is_empty());
    assert_eq!(indexer.count(), 2);
}

#[test]
fn test_save_and_reload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resources.json");

    let originals = {
        let mut indexer = ResourceIndexer::open(&path);
        indexer.index_response(
            None,
            "listThings",
            &json!({
                "projectId": 10042,
                "pages": [{"pageId": "ari:cloud:confluence::page/123-abc"}]
            }),
        );
        indexer.resources().to_vec()
    };
    assert_eq!(originals.len(), 2);

    let mut reloaded = ResourceIndexer::open(&path);
    let back: Vec<_> = reloaded.resources().to_vec();
    assert_eq!(back.len(), originals.len());
    for (a, b) in originals.iter().zip(back.iter()) {
        assert_eq!(a.entry_id, b.entry_id);
        assert_eq!(a.id, b.id);
        assert_eq!(a.resource_type, b.resource_type);
        assert_eq!(a.field_path, b.field_path);
        assert_eq!(a.timestamp, b.timestamp);
    }

    // The rebuilt dedup set accepts no previously seen (id, user) pair.
    assert!(reloaded
        .index_response(None, "listThings", &json!({"projectId": 10042}))
        .is_empty());
}

#[test]
fn test_mixed_payload_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let mut indexer = ResourceIndexer::open(dir.path().join("resources.json"));

    let added = indexer.index_response(
        None,
        "search",
        &json!({
            "results": [
                {"id": "PROJ-1", "score": 55},          // slug via strong pattern
                {"accountId": 250},                      // numeric over threshold
                {"accountId": 99},                       // numeric under threshold: dropped
                {"title": "just a plain sentence here"}, // prose: dropped
                {"link": "/wiki/spaces/DEV"}             // path outside id field: dropped
            ]
        }),
    );

    let ids: Vec<&str> = added.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["PROJ-1", "250"]);
    assert_eq!(added[0].resource_type, ResourceType::Slug);
    assert_eq!(added[1].resource_type, ResourceType::Numeric);
}
