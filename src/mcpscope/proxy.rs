//! Bidirectional proxy between an operator's client and a tool server.
//!
//! The [`ProxyInterceptor`] sits on two [`Transport`]s and pumps JSON-RPC
//! traffic in both directions. It never rewrites messages; its job is
//! observation. Requests flowing client→server populate a correlation table
//! keyed by request id; matching responses flowing back are looked up, and
//! `tools/call` results are handed to the [`ResourceIndexer`] attributed to
//! the active profile.
//!
//! ```text
//! operator client ──► ProxyInterceptor ──► tool server
//!                          │   ▲
//!            (tools/call   │   │ responses mirrored back,
//!             correlation) ▼   │ results indexed
//!                    ResourceIndexer
//! ```
//!
//! # Failure semantics
//!
//! If forwarding a *request* to the server fails and the client is still
//! connected, the proxy synthesizes a `-32001` JSON-RPC error back so the
//! operator's client does not hang on a response that will never come.
//! Failures forwarding a *response* are logged and the pump continues.
//! Closing either side closes the other (unless already closed) and clears
//! the correlation table.

use crate::mcpscope::profile_store::ProfileStore;
use crate::mcpscope::protocol::{
    self, correlation_key, error_response, ERROR_FORWARD_FAILED, METHOD_TOOLS_CALL,
};
use crate::mcpscope::resource_index::ResourceIndexer;
use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// What a transport hands the proxy on each `recv()`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete JSON-RPC message arrived.
    Message(Value),
    /// The peer closed the connection.
    Closed,
    /// A transport-level fault that did not close the connection.
    Error(String),
}

/// One side of the proxied link.
///
/// Concrete implementations (stdio pipes, websockets, SSE) live outside this
/// crate; the proxy only needs these three operations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Value) -> Result<(), BoxError>;
    async fn close(&self) -> Result<(), BoxError>;
    /// Next inbound event; `None` once the stream is exhausted.
    async fn recv(&self) -> Option<TransportEvent>;
}

/// Correlation-table entry for an in-flight request.
#[derive(Debug, Clone)]
struct PendingRequest {
    method: String,
    /// `params.name` for `tools/call` requests.
    tool_name: Option<String>,
}

/// Full-duplex bridge with request/response correlation and indexing.
pub struct ProxyInterceptor {
    client: Arc<dyn Transport>,
    server: Arc<dyn Transport>,
    indexer: Arc<Mutex<ResourceIndexer>>,
    profiles: Arc<Mutex<ProfileStore>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    client_open: AtomicBool,
    server_open: AtomicBool,
}

impl ProxyInterceptor {
    pub fn new(
        client: Arc<dyn Transport>,
        server: Arc<dyn Transport>,
        indexer: Arc<Mutex<ResourceIndexer>>,
        profiles: Arc<Mutex<ProfileStore>>,
    ) -> Self {
        Self {
            client,
            server,
            indexer,
            profiles,
            pending: Mutex::new(HashMap::new()),
            client_open: AtomicBool::new(true),
            server_open: AtomicBool::new(true),
        }
    }

    /// Pump both directions until both sides have closed.
    pub async fn run(&self) {
        tokio::join!(self.pump_client_to_server(), self.pump_server_to_client());
    }

    /// Number of requests awaiting a response (visible for inspection).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn pump_client_to_server(&self) {
        loop {
            let event = match self.client.recv().await {
                Some(event) => event,
                None => TransportEvent::Closed,
            };
            match event {
                TransportEvent::Message(message) => self.forward_request(message).await,
                TransportEvent::Error(err) => {
                    warn!("client transport error: {}", err);
                }
                TransportEvent::Closed => {
                    self.on_side_closed(Side::Client).await;
                    return;
                }
            }
        }
    }

    async fn pump_server_to_client(&self) {
        loop {
            let event = match self.server.recv().await {
                Some(event) => event,
                None => TransportEvent::Closed,
            };
            match event {
                TransportEvent::Message(message) => self.forward_response(message).await,
                TransportEvent::Error(err) => {
                    warn!("server transport error: {}", err);
                }
                TransportEvent::Closed => {
                    self.on_side_closed(Side::Server).await;
                    return;
                }
            }
        }
    }

    /// Client → server: correlate requests, then forward.
    async fn forward_request(&self, message: Value) {
        let correlation = if protocol::is_request(&message) {
            let id = protocol::rpc_id(&message).cloned();
            let method = protocol::rpc_method(&message).unwrap_or_default().to_string();
            let tool_name = if method == METHOD_TOOLS_CALL {
                message
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            } else {
                None
            };
            if let Some(id) = id {
                let key = correlation_key(&id);
                self.pending
                    .lock()
                    .await
                    .insert(key.clone(), PendingRequest { method, tool_name });
                Some((id, key))
            } else {
                None
            }
        } else {
            None
        };

        if let Err(err) = self.server.send(message).await {
            let message_text = err.to_string();
            warn!("failed to forward request to server: {}", message_text);
            if let Some((id, key)) = correlation {
                self.pending.lock().await.remove(&key);
                if self.client_open.load(Ordering::SeqCst) {
                    let reply = error_response(
                        &id,
                        ERROR_FORWARD_FAILED,
                        &message_text,
                        Some(json!(message_text)),
                    );
                    if let Err(err) = self.client.send(reply).await {
                        error!("failed to deliver synthesized error to client: {}", err);
                    }
                }
            }
        }
    }

    /// Server → client: resolve correlation, index tool results, forward.
    async fn forward_response(&self, message: Value) {
        if protocol::is_response(&message) {
            if let Some(id) = protocol::rpc_id(&message) {
                let entry = self.pending.lock().await.remove(&correlation_key(id));
                if let Some(entry) = entry {
                    if entry.method == METHOD_TOOLS_CALL {
                        self.index_tool_result(&entry, &message).await;
                    }
                }
            }
        }

        if let Err(err) = self.client.send(message).await {
            error!("failed to forward response to client: {}", err);
        }
    }

    async fn index_tool_result(&self, entry: &PendingRequest, message: &Value) {
        let result = match message.get("result") {
            Some(result) => result,
            None => return,
        };
        let tool_name = entry.tool_name.as_deref().unwrap_or("unknown");
        let active = self.profiles.lock().await.active_profile().cloned();
        let added = self
            .indexer
            .lock()
            .await
            .index_response(active.as_ref(), tool_name, result);
        if !added.is_empty() {
            debug!("indexed {} new resources from {}", added.len(), tool_name);
        }
    }

    /// Half-close: one side down brings the other down, once.
    async fn on_side_closed(&self, side: Side) {
        self.pending.lock().await.clear();
        match side {
            Side::Client => {
                self.client_open.store(false, Ordering::SeqCst);
                if self.server_open.swap(false, Ordering::SeqCst) {
                    if let Err(err) = self.server.close().await {
                        warn!("error closing server transport: {}", err);
                    }
                }
            }
            Side::Server => {
                self.server_open.store(false, Ordering::SeqCst);
                if self.client_open.swap(false, Ordering::SeqCst) {
                    if let Err(err) = self.client.close().await {
                        warn!("error closing client transport: {}", err);
                    }
                }
            }
        }
    }
}

enum Side {
    Client,
    Server,
}
