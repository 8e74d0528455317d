//! MCP Client
//!
//! The protocol session: owns exactly one transport, drives the MCP
//! initialize handshake, exposes the capability enumeration and
//! invocation operations, and maintains the bounded traffic log. Servers
//! that do not implement every optional listing endpoint are tolerated
//! by resolving the missing lists to empty.

use crate::config::TransportConfig;
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, McpPrompt, McpResource, McpTool, RootsCapability,
    SamplingCapability, ServerCapabilities, ServerInfo, PROTOCOL_VERSION,
};
use crate::traffic::{Direction, Exchange, TrafficLog, TrafficLogEntry};
use crate::transport::{create_transport, McpTransport, TransportEvent};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};

const CLIENT_EVENT_CAPACITY: usize = 256;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events re-emitted at session level for external observers such as a
/// dashboard.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected(InitializeResult),
    Disconnected,
    Error(String),
    Notification(Value),
    /// Server-initiated request, surfaced without being answered.
    Request(Value),
    Traffic { direction: Direction, data: Value },
}

/// Snapshot of the session state.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub connected: bool,
    pub server_info: Option<ServerInfo>,
    pub capabilities: Option<ServerCapabilities>,
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
}

/// MCP client session bound to exactly one transport.
pub struct McpClient {
    config: TransportConfig,
    transport: RwLock<Option<Arc<dyn McpTransport>>>,
    status: RwLock<ConnectionStatus>,
    server_info: RwLock<Option<ServerInfo>>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    tools: RwLock<Vec<McpTool>>,
    resources: RwLock<Vec<McpResource>>,
    prompts: RwLock<Vec<McpPrompt>>,
    traffic: Arc<Mutex<TrafficLog>>,
    events: broadcast::Sender<ClientEvent>,
    forward_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpClient {
    /// Create a session for the given configuration. No I/O happens
    /// until `connect()`.
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Self {
            config,
            transport: RwLock::new(None),
            status: RwLock::new(ConnectionStatus::Disconnected),
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            traffic: Arc::new(Mutex::new(TrafficLog::new())),
            events,
            forward_task: Mutex::new(None),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Construct the configured transport, connect it, and perform the
    /// MCP handshake followed by the initial capability refresh.
    pub async fn connect(&self) -> Result<InitializeResult> {
        let transport = create_transport(&self.config)?;
        self.connect_with_transport(transport).await
    }

    /// Connect through a caller-supplied transport. Useful for tests and
    /// for custom channel implementations.
    pub async fn connect_with_transport(
        &self,
        transport: Arc<dyn McpTransport>,
    ) -> Result<InitializeResult> {
        *self.status.write().await = ConnectionStatus::Connecting;

        transport.dispatcher().attach_traffic(self.traffic.clone());
        let receiver = transport.dispatcher().subscribe();
        let forward = tokio::spawn(forward_events(receiver, self.events.clone()));
        if let Ok(mut slot) = self.forward_task.lock() {
            if let Some(previous) = slot.replace(forward) {
                previous.abort();
            }
        }
        *self.transport.write().await = Some(transport.clone());

        let result = async {
            transport.connect().await?;
            self.initialize(transport.as_ref()).await
        }
        .await;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                *self.status.write().await = ConnectionStatus::Disconnected;
                return Err(e);
            }
        };

        *self.status.write().await = ConnectionStatus::Connected;
        *self.server_info.write().await = Some(result.server_info.clone());
        *self.capabilities.write().await = Some(result.capabilities.clone());
        let _ = self.events.send(ClientEvent::Connected(result.clone()));

        tracing::info!(
            "MCP session established with '{}' v{} over {}",
            result.server_info.name,
            result.server_info.version,
            self.config.kind()
        );

        self.refresh_all().await;
        Ok(result)
    }

    async fn initialize(&self, transport: &dyn McpTransport) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {
                roots: Some(RootsCapability { list_changed: true }),
                sampling: Some(SamplingCapability {}),
            },
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let result = transport
            .request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).context("Malformed initialize result")?;

        transport.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Tear down the transport and flip the session state.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(transport) = self.transport.write().await.take() {
            transport.disconnect().await?;
            *self.status.write().await = ConnectionStatus::Disconnected;
            let _ = self.events.send(ClientEvent::Disconnected);
        }
        Ok(())
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.status.read().await == ConnectionStatus::Connected
    }

    async fn transport(&self) -> Result<Arc<dyn McpTransport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("Client not connected"))
    }

    /// List the server's tools. A server without the endpoint yields an
    /// empty list instead of an error.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let transport = self.transport().await?;
        match transport.request("tools/list", None).await {
            Ok(result) => {
                let result: ListToolsResult =
                    serde_json::from_value(result).context("Malformed tools/list result")?;
                *self.tools.write().await = result.tools.clone();
                Ok(result.tools)
            }
            Err(err) if err.is_method_not_supported() => {
                self.tools.write().await.clear();
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Invoke a tool; the raw result is returned for inspection.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let transport = self.transport().await?;
        let result = transport
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        Ok(result)
    }

    /// List the server's resources, tolerating a missing endpoint.
    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        let transport = self.transport().await?;
        match transport.request("resources/list", None).await {
            Ok(result) => {
                let result: ListResourcesResult =
                    serde_json::from_value(result).context("Malformed resources/list result")?;
                *self.resources.write().await = result.resources.clone();
                Ok(result.resources)
            }
            Err(err) if err.is_method_not_supported() => {
                self.resources.write().await.clear();
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read a resource by URI; the raw result is returned for inspection.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let transport = self.transport().await?;
        let result = transport
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        Ok(result)
    }

    /// List the server's prompts, tolerating a missing endpoint.
    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        let transport = self.transport().await?;
        match transport.request("prompts/list", None).await {
            Ok(result) => {
                let result: ListPromptsResult =
                    serde_json::from_value(result).context("Malformed prompts/list result")?;
                *self.prompts.write().await = result.prompts.clone();
                Ok(result.prompts)
            }
            Err(err) if err.is_method_not_supported() => {
                self.prompts.write().await.clear();
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Render a prompt; the raw result is returned for inspection.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value> {
        let transport = self.transport().await?;
        let result = transport
            .request(
                "prompts/get",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        Ok(result)
    }

    /// Refresh all three capability lists concurrently. Failures are
    /// isolated per list and logged, never propagated.
    pub async fn refresh_all(&self) {
        let (tools, resources, prompts) =
            tokio::join!(self.list_tools(), self.list_resources(), self.list_prompts());
        if let Err(e) = tools {
            tracing::warn!("tools/list refresh failed: {e:#}");
        }
        if let Err(e) = resources {
            tracing::warn!("resources/list refresh failed: {e:#}");
        }
        if let Err(e) = prompts {
            tracing::warn!("prompts/list refresh failed: {e:#}");
        }
    }

    /// Snapshot of the session state.
    pub async fn state(&self) -> ClientState {
        ClientState {
            connected: self.is_connected().await,
            server_info: self.server_info.read().await.clone(),
            capabilities: self.capabilities.read().await.clone(),
            tools: self.tools.read().await.clone(),
            resources: self.resources.read().await.clone(),
            prompts: self.prompts.read().await.clone(),
        }
    }

    /// Copy of the traffic log, oldest first.
    pub fn traffic_log(&self) -> Vec<TrafficLogEntry> {
        self.traffic
            .lock()
            .map(|log| log.snapshot())
            .unwrap_or_default()
    }

    /// Correlated request/response feed over the current traffic log.
    pub fn exchanges(&self) -> Vec<Exchange> {
        crate::traffic::correlate(&self.traffic_log())
    }

    pub fn clear_traffic_log(&self) {
        if let Ok(mut log) = self.traffic.lock() {
            log.clear();
        }
    }
}

/// Map transport events into session events for external observers.
async fn forward_events(
    mut receiver: broadcast::Receiver<TransportEvent>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                let mapped = match event {
                    TransportEvent::Sent(data) => Some(ClientEvent::Traffic {
                        direction: Direction::Sent,
                        data,
                    }),
                    TransportEvent::Received(data) => Some(ClientEvent::Traffic {
                        direction: Direction::Received,
                        data,
                    }),
                    TransportEvent::Error(message) => Some(ClientEvent::Error(message)),
                    TransportEvent::Notification(value) => {
                        Some(ClientEvent::Notification(value))
                    }
                    TransportEvent::ServerRequest(value) => Some(ClientEvent::Request(value)),
                    TransportEvent::Disconnected => Some(ClientEvent::Disconnected),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let _ = events.send(mapped);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("session event forwarder lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
