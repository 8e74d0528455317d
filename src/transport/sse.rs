//! SSE Transport
//!
//! Dual-channel: a long-lived GET opens a `text/event-stream` response
//! carrying the server's frames, while outbound messages are separate
//! POSTs to the same endpoint path. A dropped stream is reopened after a
//! fixed 1-second backoff, replaying the last seen event id via
//! `Last-Event-ID` so the server can resume.

use super::{Dispatcher, McpTransport, TransportEvent};
use crate::config::{EndpointConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// SSE transport for remote MCP servers.
pub struct SseTransport {
    channel: Arc<SseChannel>,
    reader_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

/// State shared with the stream-reader task.
struct SseChannel {
    url: reqwest::Url,
    client: reqwest::Client,
    custom_headers: Vec<(String, String)>,
    auth_headers: Vec<(String, String)>,
    /// Session cursor for resumption across reconnects.
    last_event_id: Mutex<Option<String>>,
    /// Guards against overlapping reconnect attempts; latched true by
    /// `disconnect()` to stop the loop.
    reconnecting: AtomicBool,
    dispatcher: Dispatcher,
}

impl SseTransport {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self, TransportError> {
        let url = super::http::parse_endpoint_url(endpoint, &["http", "https"])?;
        Ok(Self {
            channel: Arc::new(SseChannel {
                url,
                client: super::http::build_client(endpoint)?,
                custom_headers: super::http::header_vec(&endpoint.headers),
                auth_headers: endpoint
                    .auth
                    .as_ref()
                    .map(|auth| auth.headers())
                    .unwrap_or_default(),
                last_event_id: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                dispatcher: Dispatcher::new(TransportKind::Sse),
            }),
            reader_task: RwLock::new(None),
        })
    }

    /// Last seen event id, if any frame carried one.
    pub fn last_event_id(&self) -> Option<String> {
        self.channel
            .last_event_id
            .lock()
            .ok()
            .and_then(|id| id.clone())
    }
}

impl SseChannel {
    /// Open the inbound GET stream, replaying the session cursor.
    async fn open(&self) -> Result<reqwest::Response, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        super::http::insert_all(&mut headers, &self.custom_headers)?;
        super::http::insert_all(&mut headers, &self.auth_headers)?;
        let cursor = self.last_event_id.lock().ok().and_then(|id| id.clone());
        if let Some(id) = cursor {
            let id = HeaderValue::from_str(&id)
                .map_err(|e| TransportError::Config(format!("Invalid event id: {e}")))?;
            headers.insert("Last-Event-ID", id);
        }

        let request = self.client.get(self.url.clone()).headers(headers);
        let response = request.send().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("SSE connection failed: {e}"))
        })?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TransportError::ConnectionFailed(format!(
                "SSE connection failed: HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error")
            )));
        }
        Ok(response)
    }

    /// Read one GET stream to completion, dispatching its frames.
    async fn consume(&self, response: reqwest::Response) {
        let mut stream = response.bytes_stream();
        let mut buffer = SseFrameBuffer::default();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in buffer.push(&String::from_utf8_lossy(&bytes)) {
                        self.handle_frame(frame).await;
                    }
                }
                Err(e) => {
                    self.dispatcher
                        .emit(TransportEvent::Error(format!("SSE stream error: {e}")));
                    break;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: SseFrame) {
        if let Some(id) = frame.id {
            if let Ok(mut cursor) = self.last_event_id.lock() {
                *cursor = Some(id);
            }
        }
        if frame.data.is_empty() {
            return;
        }
        // Non-JSON data is dropped silently: SSE streams routinely carry
        // comments and heartbeats.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&frame.data) {
            self.dispatcher.dispatch(value).await;
        }
    }

    /// Reader loop: consume the stream, then keep reopening it after the
    /// fixed backoff until `disconnect()` latches the flag.
    async fn run(self: Arc<Self>, mut response: reqwest::Response) {
        loop {
            self.consume(response).await;
            self.dispatcher.emit(TransportEvent::Disconnected);

            if self.reconnecting.swap(true, Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
            self.reconnecting.store(false, Ordering::SeqCst);

            match self.open().await {
                Ok(next) => {
                    tracing::debug!("SSE stream reopened");
                    response = next;
                }
                Err(e) => {
                    self.dispatcher.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let response = self.channel.open().await?;
        self.channel.dispatcher.emit(TransportEvent::Connected);
        let channel = self.channel.clone();
        let task = tokio::spawn(channel.run(response));
        if let Some(previous) = self.reader_task.write().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.channel.reconnecting.store(true, Ordering::SeqCst);
        if let Some(task) = self.reader_task.write().await.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let value = serde_json::to_value(message)?;
        let body = serde_json::to_string(message)?;
        self.channel.dispatcher.emit(TransportEvent::Sent(value));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        super::http::insert_all(&mut headers, &self.channel.custom_headers)?;
        super::http::insert_all(&mut headers, &self.channel.auth_headers)?;

        let request = self
            .channel
            .client
            .post(self.channel.url.clone())
            .headers(headers);
        let response = request.body(body).send().await.map_err(|e| {
            self.channel
                .dispatcher
                .emit(TransportEvent::Error(e.to_string()));
            TransportError::HttpTransport(e)
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // The payload for an event-stream response arrives on the GET
        // channel instead; the POST body is ignored.
        if content_type.contains("text/event-stream") {
            return Ok(());
        }

        let body = response.text().await?;
        if content_type.contains("application/json") {
            if body.trim().is_empty() {
                return Ok(());
            }
            return match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) => {
                    self.channel.dispatcher.dispatch(value).await;
                    Ok(())
                }
                Err(_) => Err(TransportError::NonJsonResponse {
                    status: status.as_u16(),
                    preview: super::http::excerpt(body.trim(), 200),
                }),
            };
        }

        if body.trim().is_empty() {
            return Ok(());
        }

        if content_type.contains("text/plain") {
            // Some servers answer POSTs with JSON mislabeled as plain
            // text; anything else is accepted as-is.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                self.channel.dispatcher.dispatch(value).await;
            }
            return Ok(());
        }

        Err(TransportError::UnexpectedContentType(content_type))
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.channel.dispatcher
    }
}

/// One parsed SSE frame.
#[derive(Debug, Default, PartialEq, Eq)]
struct SseFrame {
    id: Option<String>,
    event: Option<String>,
    data: String,
}

impl SseFrame {
    fn parse(text: &str) -> Self {
        let mut frame = SseFrame::default();
        for line in text.split('\n') {
            if let Some(rest) = line.strip_prefix("id:") {
                frame.id = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("event:") {
                frame.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                frame.data.push_str(rest.trim());
            }
        }
        frame
    }
}

/// Reassembles frames from arbitrary chunk boundaries. Frames are
/// delimited by a blank line; an incomplete trailing frame is retained
/// until more bytes arrive.
#[derive(Debug, Default)]
struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..pos + 2).collect();
            let raw = raw.trim_end_matches('\n');
            if !raw.trim().is_empty() {
                frames.push(SseFrame::parse(raw));
            }
        }
        frames
    }
}
