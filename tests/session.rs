//! End-to-end session tests
//!
//! Full client lifecycle over a real HTTP transport: handshake,
//! capability refresh with graceful degradation, invocation, and the
//! correlated traffic feed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use mcp_pentester::{
    ClientEvent, Direction, EndpointConfig, ExchangeStatus, McpClient, TransportConfig,
};
use serde_json::{json, Value};
use std::net::SocketAddr;

async fn mcp_handler(Json(request): Json<Value>) -> Response {
    let Some(id) = request.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = request["method"].as_str().unwrap_or_default();
    let body = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {"listChanged": true},
                    "logging": {}
                },
                "serverInfo": {"name": "victim-server", "version": "2.3.1"}
            }
        }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [
                {
                    "name": "run_query",
                    "description": "Run a query",
                    "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
                }
            ]}
        }),
        "tools/call" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": "42 rows"}], "isError": false}
        }),
        // No resources or prompts endpoints on this server.
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }),
    };
    Json(body).into_response()
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new().route("/mcp", post(mcp_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> McpClient {
    McpClient::new(TransportConfig::Http(EndpointConfig::new(format!(
        "http://{addr}/mcp"
    ))))
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let addr = spawn_server().await;
    let client = client_for(addr);

    let handshake = client.connect().await.unwrap();
    assert_eq!(handshake.server_info.name, "victim-server");
    assert_eq!(handshake.protocol_version, "2024-11-05");
    assert!(client.is_connected().await);

    let state = client.state().await;
    assert_eq!(state.tools.len(), 1);
    assert_eq!(state.tools[0].name, "run_query");
    assert!(state.resources.is_empty(), "missing endpoint degrades to empty");
    assert!(state.prompts.is_empty(), "missing endpoint degrades to empty");
    assert_eq!(state.server_info.unwrap().version, "2.3.1");

    let result = client
        .call_tool("run_query", json!({"q": "select 1"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "42 rows");

    client.disconnect().await.unwrap();
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_traffic_feed_over_live_session() {
    let addr = spawn_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    client.call_tool("run_query", json!({})).await.unwrap();

    let log = client.traffic_log();
    assert!(log.iter().any(|entry| entry.direction == Direction::Sent
        && entry.data["method"] == "initialize"));
    assert!(log
        .iter()
        .any(|entry| entry.direction == Direction::Received));

    // initialize, tools/list, tools/call pair up as ok; the two
    // unsupported listing calls are suppressed noise.
    let exchanges = client.exchanges();
    assert_eq!(exchanges.len(), 3);
    assert!(exchanges
        .iter()
        .all(|exchange| exchange.status == ExchangeStatus::Ok));
}

#[tokio::test]
async fn test_connected_event_carries_handshake_result() {
    let addr = spawn_server().await;
    let client = client_for(addr);
    let mut events = client.subscribe();
    client.connect().await.unwrap();

    loop {
        match events.recv().await.unwrap() {
            ClientEvent::Connected(result) => {
                assert_eq!(result.server_info.name, "victim-server");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_connect_failure_against_dead_server() {
    // Nothing listens here; connect must fail without panicking and
    // leave the session disconnected.
    let client = McpClient::new(TransportConfig::Http(EndpointConfig::new(
        "http://127.0.0.1:1/mcp",
    )));
    assert!(client.connect().await.is_err());
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn test_config_error_surfaces_before_io() {
    let client = McpClient::new(TransportConfig::Stdio {
        command: String::new(),
        args: vec![],
        env: Default::default(),
    });
    let err = client.connect().await.unwrap_err();
    assert!(err.to_string().contains("Command required"));
}
