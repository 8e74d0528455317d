//! In-memory transport for testing.
//!
//! Lets the session and correlation machinery be exercised without a
//! live socket: every `send` is recorded, and an optional handler can
//! synthesize the server's reply, which is fed straight back through the
//! shared dispatch path.

use super::{Dispatcher, McpTransport, TransportEvent};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type ResponseHandler = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// In-memory transport double.
pub struct MockTransport {
    dispatcher: Dispatcher,
    connected: AtomicBool,
    sent: Mutex<Vec<Value>>,
    handler: Option<ResponseHandler>,
}

impl MockTransport {
    /// Create a disconnected mock with no auto-responses.
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(TransportKind::Stdio),
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            handler: None,
        }
    }

    /// Create a mock with an auto-response handler. Every `send` invokes
    /// the handler with the outbound payload; a `Some` return value is
    /// dispatched as the inbound reply.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            dispatcher: Dispatcher::new(TransportKind::Stdio),
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            handler: Some(Box::new(handler)),
        }
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Feed an unsolicited inbound payload, as if the server pushed it.
    pub async fn push_incoming(&self, value: Value) {
        self.dispatcher.dispatch(value).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        self.dispatcher.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.dispatcher.emit(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let value = serde_json::to_value(message)?;
        self.dispatcher.emit(TransportEvent::Sent(value.clone()));
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(value.clone());
        }
        if let Some(handler) = &self.handler {
            if let Some(response) = handler(&value) {
                self.dispatcher.dispatch(response).await;
            }
        }
        Ok(())
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
