use async_trait::async_trait;
use mcpscope::profile_store::{ColorTag, ProfileStore};
use mcpscope::proxy::{ProxyInterceptor, Transport, TransportEvent};
use mcpscope::resource_index::ResourceIndexer;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// In-memory transport: the test feeds inbound events through a channel and
/// inspects everything the proxy sent.
struct MockTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    sent: StdMutex<Vec<Value>>,
    closed: AtomicBool,
    fail_sends: bool,
}

impl MockTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<TransportEvent>) {
        Self::with_failing_sends(false)
    }

    fn with_failing_sends(fail_sends: bool) -> (Arc<Self>, mpsc::UnboundedSender<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inbound: Mutex::new(rx),
                sent: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_sends,
            }),
            tx,
        )
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        message: Value,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_sends {
            return Err("ECONNRESET".into());
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> Option<TransportEvent> {
        self.inbound.lock().await.recv().await
    }
}

struct Harness {
    proxy: Arc<ProxyInterceptor>,
    client: Arc<MockTransport>,
    server: Arc<MockTransport>,
    client_tx: mpsc::UnboundedSender<TransportEvent>,
    server_tx: mpsc::UnboundedSender<TransportEvent>,
    indexer: Arc<Mutex<ResourceIndexer>>,
    profiles: Arc<Mutex<ProfileStore>>,
}

fn build_harness(dir: &std::path::Path, failing_server: bool) -> Harness {
    let (client, client_tx) = MockTransport::new();
    let (server, server_tx) = MockTransport::with_failing_sends(failing_server);
    let indexer = Arc::new(Mutex::new(ResourceIndexer::open(dir.join("resources.json"))));
    let profiles = Arc::new(Mutex::new(ProfileStore::open(dir.join("auth.json"))));
    let proxy = Arc::new(ProxyInterceptor::new(
        client.clone(),
        server.clone(),
        indexer.clone(),
        profiles.clone(),
    ));
    Harness {
        proxy,
        client,
        server,
        client_tx,
        server_tx,
        indexer,
        profiles,
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_requests_and_responses_flow_through() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), false);
    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    let request = json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/list"
    });
    h.client_tx
        .send(TransportEvent::Message(request.clone()))
        .unwrap();
    settle().await;
    assert_eq!(h.server.sent(), vec![request]);
    assert_eq!(h.proxy.pending_count().await, 1);

    let response = json!({
        "jsonrpc": "2.0", "id": 1, "result": { "tools": [] }
    });
    h.server_tx
        .send(TransportEvent::Message(response.clone()))
        .unwrap();
    settle().await;
    assert_eq!(h.client.sent(), vec![response]);
    assert_eq!(h.proxy.pending_count().await, 0);

    h.client_tx.send(TransportEvent::Closed).unwrap();
    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
}

#[tokio::test]
async fn test_tool_call_results_are_indexed_under_active_profile() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), false);

    let profile_id = {
        let mut profiles = h.profiles.lock().await;
        let profile = profiles.create_profile("Alice", ColorTag::Blue).unwrap();
        profiles.set_active(Some(&profile.id)).unwrap();
        profile.id
    };

    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    h.client_tx
        .send(TransportEvent::Message(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": { "name": "listThings", "arguments": {} }
        })))
        .unwrap();
    settle().await;

    h.server_tx
        .send(TransportEvent::Message(json!({
            "jsonrpc": "2.0", "id": 7,
            "result": {
                "content": [{
                    "type": "text",
                    "text": "{\"results\":[{\"id\":\"550e8400-e29b-41d4-a716-446655440000\",\"title\":\"hello\"}]}"
                }]
            }
        })))
        .unwrap();
    settle().await;

    {
        let indexer = h.indexer.lock().await;
        assert_eq!(indexer.count(), 1);
        let entry = &indexer.resources()[0];
        assert_eq!(entry.id, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(entry.field_path, "results[0].id");
        assert_eq!(entry.discovered_by_tool, "listThings");
        assert_eq!(entry.discovered_from_user, profile_id);
        assert_eq!(entry.user_display_name.as_deref(), Some("Alice"));
    }

    // The response itself was still mirrored to the client.
    assert_eq!(h.client.sent().len(), 1);

    h.client_tx.send(TransportEvent::Closed).unwrap();
    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
}

#[tokio::test]
async fn test_send_failure_synthesizes_error_reply() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), true);
    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    h.client_tx
        .send(TransportEvent::Message(json!({
            "jsonrpc": "2.0", "id": 42, "method": "tools/call",
            "params": { "name": "listThings", "arguments": {} }
        })))
        .unwrap();
    settle().await;

    let sent = h.client.sent();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["error"]["message"], "ECONNRESET");
    assert_eq!(reply["error"]["data"], "ECONNRESET");

    // The correlation table does not retain the failed request.
    assert_eq!(h.proxy.pending_count().await, 0);

    h.client_tx.send(TransportEvent::Closed).unwrap();
    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
}

#[tokio::test]
async fn test_half_close_propagates_and_clears_correlation() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), false);
    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    h.client_tx
        .send(TransportEvent::Message(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/list"
        })))
        .unwrap();
    settle().await;
    assert_eq!(h.proxy.pending_count().await, 1);

    // Client goes away; the server side must be closed and the table cleared.
    h.client_tx.send(TransportEvent::Closed).unwrap();
    settle().await;
    assert!(h.server.is_closed());
    assert_eq!(h.proxy.pending_count().await, 0);

    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
    // The client was already the side that closed; no close() call went back.
    assert!(!h.client.is_closed());
}

#[tokio::test]
async fn test_unknown_response_ids_pass_through_without_indexing() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), false);
    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    let response = json!({ "jsonrpc": "2.0", "id": 99, "result": { "id": "PROJ-1" } });
    h.server_tx
        .send(TransportEvent::Message(response.clone()))
        .unwrap();
    settle().await;

    assert_eq!(h.client.sent(), vec![response]);
    assert_eq!(h.indexer.lock().await.count(), 0);

    h.client_tx.send(TransportEvent::Closed).unwrap();
    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
}

#[tokio::test]
async fn test_transport_errors_do_not_stop_the_pump() {
    let dir = tempfile::tempdir().unwrap();
    let h = build_harness(dir.path(), false);
    let proxy = h.proxy.clone();
    let pump = tokio::spawn(async move { proxy.run().await });

    h.client_tx
        .send(TransportEvent::Error("brief hiccup".to_string()))
        .unwrap();
    let request = json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/list" });
    h.client_tx
        .send(TransportEvent::Message(request.clone()))
        .unwrap();
    settle().await;

    assert_eq!(h.server.sent(), vec![request]);

    h.client_tx.send(TransportEvent::Closed).unwrap();
    h.server_tx.send(TransportEvent::Closed).unwrap();
    pump.await.unwrap();
}
