//! MCP Transport Layer
//!
//! Provides the transport abstraction for MCP communication: a common
//! contract over physically different byte-stream models (subprocess
//! pipes, single-shot HTTP bodies, persistent WebSocket frames, and the
//! split GET-stream/POST-send SSE model), plus the correlation machinery
//! that pairs responses with outstanding requests.

pub mod http;
pub mod mock;
pub mod sse;
pub mod stdio;
pub mod ws;

use crate::config::{TransportConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::traffic::{Direction, TrafficLog};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock};

/// Per-request timeout. A request with no response after this long is
/// rejected and its id released.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events broadcast by a transport instance to its subscribers.
///
/// Each transport owns its own channel; there is no process-wide bus.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Emitted with the payload before transmission.
    Sent(Value),
    /// Every parsed inbound payload, before classification.
    Received(Value),
    /// Inbound payload with `method` and no `id`.
    Notification(Value),
    /// Server-initiated request (`method` and `id`). Surfaced only;
    /// this client never answers them.
    ServerRequest(Value),
    /// Subprocess stderr line, verbatim.
    Stderr(String),
    /// Subprocess exit with its exit code.
    Exited(Option<i32>),
    Error(String),
}

/// Correlation helper composed into every concrete transport: request-id
/// allocation, the pending-request table, and the event channel.
pub struct Dispatcher {
    kind: TransportKind,
    next_id: AtomicU64,
    pending: RwLock<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    events: broadcast::Sender<TransportEvent>,
    traffic: OnceLock<Arc<Mutex<TrafficLog>>>,
}

impl Dispatcher {
    pub fn new(kind: TransportKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind,
            next_id: AtomicU64::new(1),
            pending: RwLock::new(HashMap::new()),
            events,
            traffic: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Allocate the next request id. Strictly increasing per instance,
    /// starting at 1; an id is never reused while a prior request with
    /// the same value is still pending.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Attach a session-owned traffic ring; sent/received events are
    /// appended synchronously from then on. Set once per transport.
    pub fn attach_traffic(&self, log: Arc<Mutex<TrafficLog>>) {
        let _ = self.traffic.set(log);
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(log) = self.traffic.get() {
            let recorded = match &event {
                TransportEvent::Sent(data) => Some((Direction::Sent, data)),
                TransportEvent::Received(data) => Some((Direction::Received, data)),
                _ => None,
            };
            if let Some((direction, data)) = recorded {
                if let Ok(mut log) = log.lock() {
                    log.record(direction, self.kind, data);
                }
            }
        }
        let _ = self.events.send(event);
    }

    /// Register a pending entry for `id` and hand back the receiving end.
    pub async fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);
        rx
    }

    /// Drop a pending entry, releasing its id.
    pub async fn discard(&self, id: u64) {
        self.pending.write().await.remove(&id);
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Route a response to its waiting request. A response for an id that
    /// is no longer pending is dropped silently.
    pub async fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id_u64() else {
            tracing::debug!("response without a routable id: {:?}", response.id);
            return;
        };
        let sender = self.pending.write().await.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!("dropping response for unknown or expired id {id}"),
        }
    }

    /// Classify and route one parsed inbound payload.
    pub async fn dispatch(&self, value: Value) {
        self.emit(TransportEvent::Received(value.clone()));

        if value.get("result").is_some() || value.get("error").is_some() {
            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(response) => self.complete(response).await,
                Err(e) => self.emit(TransportEvent::Error(format!(
                    "Malformed JSON-RPC response: {e}"
                ))),
            }
            return;
        }

        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some();
        match (has_method, has_id) {
            (true, false) => self.emit(TransportEvent::Notification(value)),
            (true, true) => self.emit(TransportEvent::ServerRequest(value)),
            _ => tracing::warn!("unroutable MCP message: {value}"),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// MCP transport contract.
///
/// Concrete transports implement `connect`/`disconnect`/`send` over their
/// own channel; the correlated `request` and fire-and-forget `notify`
/// are derived from `send` plus the composed [`Dispatcher`].
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish the underlying channel. Failures surface as `Err`,
    /// never a panic.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release the channel and any proxy/TLS resources. Safe to call
    /// when not connected.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Transmit a single request or notification, emitting a `Sent`
    /// event with the payload before transmission.
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError>;

    /// The correlation helper owned by this instance.
    fn dispatcher(&self) -> &Dispatcher;

    /// Send a request and wait for the matching response or the
    /// 30-second timeout, whichever comes first. On send failure the
    /// pending entry is removed and the failure propagates immediately.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let dispatcher = self.dispatcher();
        let id = dispatcher.next_id();
        let rx = dispatcher.register(id).await;

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(err) = self.send(&JsonRpcMessage::Request(request)).await {
            dispatcher.discard(id).await;
            return Err(err);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    Err(TransportError::Rpc {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    })
                } else {
                    Ok(response.result.unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => {
                dispatcher.discard(id).await;
                Err(TransportError::RequestTimeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Send a notification; nothing is awaited beyond transmission.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notification = JsonRpcNotification::new(method, params);
        self.send(&JsonRpcMessage::Notification(notification)).await
    }
}

/// Construct the transport for a configuration, failing fast with a
/// descriptive error when a required field is missing.
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Arc<dyn McpTransport>, TransportError> {
    match config {
        TransportConfig::Stdio { command, args, env } => {
            if command.trim().is_empty() {
                return Err(TransportError::Config(
                    "Command required for stdio transport".to_string(),
                ));
            }
            Ok(Arc::new(stdio::StdioTransport::new(
                command.clone(),
                args.clone(),
                env.clone(),
            )))
        }
        TransportConfig::Http(endpoint) | TransportConfig::Https(endpoint) => Ok(Arc::new(
            http::HttpTransport::new(config.kind(), endpoint)?,
        )),
        TransportConfig::Ws(endpoint) | TransportConfig::Wss(endpoint) => {
            Ok(Arc::new(ws::WsTransport::new(config.kind(), endpoint)?))
        }
        TransportConfig::Sse(endpoint) => Ok(Arc::new(sse::SseTransport::new(endpoint)?)),
    }
}
