//! Security-testing MCP client
//!
//! A single-session client for the Model Context Protocol (MCP), built
//! for penetration testing: it connects to an MCP server over one of
//! several transports, performs the protocol handshake, enumerates the
//! server's tools/resources/prompts, and records every wire-level
//! message in a correlated traffic log — including through intercepting
//! proxies and with adversarial headers and certificates.
//!
//! ## Overview
//!
//! - **Configuration**: transport selection plus proxy, auth, and TLS
//!   shapes ([`TransportConfig`], [`ProxyConfig`], [`AuthConfig`],
//!   [`CertificateConfig`])
//! - **Protocol types**: JSON-RPC 2.0 envelopes and MCP descriptors
//! - **Transport layer**: stdio, HTTP/HTTPS, WebSocket, and SSE
//!   implementations of one contract, sharing the correlation machinery
//! - **Client**: the session driving the handshake and capability calls
//! - **Traffic**: the bounded log and the request/response pairing feed
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mcp_pentester::{McpClient, TransportConfig, EndpointConfig};
//!
//! let config = TransportConfig::Sse(EndpointConfig::new("http://target:8080/sse"));
//! let client = McpClient::new(config);
//! let handshake = client.connect().await?;
//! println!("server: {} v{}", handshake.server_info.name, handshake.server_info.version);
//!
//! for tool in client.list_tools().await? {
//!     println!("tool: {}", tool.name);
//! }
//! let result = client.call_tool("echo", serde_json::json!({"msg": "hi"})).await?;
//!
//! for exchange in client.exchanges() {
//!     println!("{:?} -> {:?}", exchange.request.data, exchange.status);
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod traffic;
pub mod transport;

pub use client::{ClientEvent, ClientState, ConnectionStatus, McpClient};
pub use config::{
    AuthConfig, CertificateConfig, EndpointConfig, ProxyConfig, ProxyProtocol, TransportConfig,
    TransportKind,
};
pub use error::TransportError;
pub use protocol::{
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpPrompt, McpResource, McpTool, ServerCapabilities, ServerInfo,
    PROTOCOL_VERSION,
};
pub use traffic::{
    correlate, Direction, Exchange, ExchangeStatus, TrafficLog, TrafficLogEntry,
    TRAFFIC_LOG_CAPACITY,
};
pub use transport::{
    create_transport, mock::MockTransport, Dispatcher, McpTransport, TransportEvent,
    REQUEST_TIMEOUT,
};
