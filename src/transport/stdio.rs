//! Stdio Transport
//!
//! Spawns the configured command and speaks newline-delimited JSON over
//! its pipes: stdout carries the server's JSON-RPC traffic, stderr is
//! surfaced verbatim as diagnostics, and process exit is reported with
//! its exit code.

use super::{Dispatcher, McpTransport, TransportEvent};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Stdio transport for local MCP servers.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin_tx: RwLock<Option<mpsc::Sender<String>>>,
    kill_tx: RwLock<Option<oneshot::Sender<()>>>,
    connected: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            command,
            args,
            env,
            stdin_tx: RwLock::new(None),
            kill_tx: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            dispatcher: Arc::new(Dispatcher::new(TransportKind::Stdio)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to spawn MCP server: {} {:?}: {e}",
                self.command, self.args
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("No stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("No stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("No stderr".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(100);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        // Stdin writer task
        let mut stdin_writer = stdin;
        tokio::spawn(async move {
            while let Some(msg) = stdin_rx.recv().await {
                if let Err(e) = stdin_writer.write_all(msg.as_bytes()).await {
                    tracing::error!("Failed to write to MCP stdin: {e}");
                    break;
                }
                if let Err(e) = stdin_writer.flush().await {
                    tracing::error!("Failed to flush MCP stdin: {e}");
                    break;
                }
            }
        });

        // Stdout reader task
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            pump_lines(stdout, dispatcher).await;
        });

        // Stderr reader task, surfaced verbatim
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                dispatcher.emit(TransportEvent::Stderr(line));
            }
        });

        // Exit watcher: owns the child, reports the exit code, and
        // honors disconnect() kills.
        let dispatcher = self.dispatcher.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    connected.store(false, Ordering::SeqCst);
                }
                status = child.wait() => {
                    connected.store(false, Ordering::SeqCst);
                    let code = status.ok().and_then(|s| s.code());
                    tracing::debug!("MCP server exited with code {code:?}");
                    dispatcher.emit(TransportEvent::Exited(code));
                }
            }
        });

        *self.stdin_tx.write().await = Some(stdin_tx);
        *self.kill_tx.write().await = Some(kill_tx);
        self.connected.store(true, Ordering::SeqCst);
        self.dispatcher.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(kill) = self.kill_tx.write().await.take() {
            let _ = kill.send(());
        }
        self.stdin_tx.write().await.take();
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let value = serde_json::to_value(message)?;
        let line = serde_json::to_string(message)? + "\n";
        self.dispatcher.emit(TransportEvent::Sent(value));

        let guard = self.stdin_tx.read().await;
        let stdin_tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        stdin_tx
            .send(line)
            .await
            .map_err(|_| TransportError::SendFailed("stdin channel closed".to_string()))
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Read newline-delimited JSON from `reader` and feed each line through
/// the dispatcher. Incomplete trailing fragments are retained across
/// reads by the line codec; a line that fails to parse emits an error
/// event without terminating the stream.
async fn pump_lines<R>(reader: R, dispatcher: Arc<Dispatcher>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    while let Some(next) = lines.next().await {
        match next {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => dispatcher.dispatch(value).await,
                    Err(_) => dispatcher.emit(TransportEvent::Error(format!(
                        "Failed to parse JSON: {trimmed}"
                    ))),
                }
            }
            Err(e) => {
                dispatcher.emit(TransportEvent::Error(format!(
                    "Failed to read MCP stdout: {e}"
                )));
                break;
            }
        }
    }
    tracing::debug!("MCP stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    const STREAM: &str =
        "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n{\"jsonrpc\":\"2.0\",\"method\":\"notif\"}\n";

    /// Feed the stream in two chunks split at `split`, return
    /// (resolved-response ids, notification count, error count).
    async fn run_split(split: usize) -> (Vec<u64>, usize, usize) {
        let dispatcher = Arc::new(Dispatcher::new(TransportKind::Stdio));
        let id = dispatcher.next_id();
        let rx = dispatcher.register(id).await;
        let mut events = dispatcher.subscribe();

        let (mut writer, reader) = tokio::io::duplex(256);
        let pump = tokio::spawn(pump_lines(reader, dispatcher.clone()));

        writer.write_all(&STREAM.as_bytes()[..split]).await.unwrap();
        // Force two separate reads around the split point.
        tokio::task::yield_now().await;
        writer.write_all(&STREAM.as_bytes()[split..]).await.unwrap();
        drop(writer);
        pump.await.unwrap();

        let response = rx.await.expect("response for id 1 should resolve");
        assert_eq!(response.id_u64(), Some(1));

        let mut notifications = 0;
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                TransportEvent::Notification(_) => notifications += 1,
                TransportEvent::Error(_) => errors += 1,
                _ => {}
            }
        }
        (vec![1], notifications, errors)
    }

    #[tokio::test]
    async fn test_line_reassembly_is_split_point_independent() {
        for split in 1..STREAM.len() {
            let (resolved, notifications, errors) = run_split(split).await;
            assert_eq!(resolved, vec![1], "split at {split}");
            assert_eq!(notifications, 1, "split at {split}");
            assert_eq!(errors, 0, "split at {split}");
        }
    }

    #[tokio::test]
    async fn test_bad_line_emits_error_and_stream_continues() {
        let dispatcher = Arc::new(Dispatcher::new(TransportKind::Stdio));
        let mut events = dispatcher.subscribe();
        let (mut writer, reader) = tokio::io::duplex(256);
        let pump = tokio::spawn(pump_lines(reader, dispatcher.clone()));

        writer.write_all(b"this is not json\n").await.unwrap();
        writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"still/alive\"}\n")
            .await
            .unwrap();
        drop(writer);
        pump.await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Error(message) => assert!(message.contains("this is not json")),
            other => panic!("expected error event, got {other:?}"),
        }
        let _received = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Notification(_)
        ));
    }

    #[tokio::test]
    async fn test_send_fails_when_not_running() {
        let transport = StdioTransport::new("cat".to_string(), vec![], HashMap::new());
        let message = JsonRpcMessage::Notification(crate::protocol::JsonRpcNotification::new(
            "notifications/initialized",
            None,
        ));
        assert!(matches!(
            transport.send(&message).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_spawn_invalid_command_fails_without_panic() {
        let transport =
            StdioTransport::new("nonexistent_command_12345".to_string(), vec![], HashMap::new());
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
        // disconnect after a failed connect must stay safe
        transport.disconnect().await.unwrap();
    }
}
