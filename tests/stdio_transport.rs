//! Stdio transport integration tests
//!
//! Spawns real subprocesses via /bin/sh, so these run on unix only.

#![cfg(unix)]

use mcp_pentester::{create_transport, TransportConfig, TransportEvent};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

/// Write an executable shell script acting as a one-shot MCP server.
fn write_script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("server.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn stdio_config(script: &PathBuf, env: HashMap<String, String>) -> TransportConfig {
    TransportConfig::Stdio {
        command: script.to_string_lossy().into_owned(),
        args: vec![],
        env,
    }
}

#[tokio::test]
async fn test_request_round_trip_with_env_merge() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"read line
echo "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"flag\":\"$PROBE_FLAG\"}}"
"#,
    );
    let mut env = HashMap::new();
    env.insert("PROBE_FLAG".to_string(), "xyzzy".to_string());

    let transport = create_transport(&stdio_config(&script, env)).unwrap();
    transport.connect().await.unwrap();

    let result = transport.request("initialize", None).await.unwrap();
    assert_eq!(result["flag"], "xyzzy");

    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stderr_and_exit_are_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"echo "booting up" >&2
exit 3
"#,
    );
    let transport = create_transport(&stdio_config(&script, HashMap::new())).unwrap();
    let mut events = transport.dispatcher().subscribe();
    transport.connect().await.unwrap();

    let mut stderr_line = None;
    let mut exit_code = None;
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while stderr_line.is_none() || exit_code.is_none() {
            match events.recv().await.unwrap() {
                TransportEvent::Stderr(line) => stderr_line = Some(line),
                TransportEvent::Exited(code) => exit_code = Some(code),
                _ => {}
            }
        }
    });
    deadline.await.expect("stderr and exit events should arrive");
    assert_eq!(stderr_line.as_deref(), Some("booting up"));
    assert_eq!(exit_code, Some(Some(3)));

    // Process is gone: sends must fail.
    assert!(transport.notify("n", None).await.is_err());
}

#[tokio::test]
async fn test_garbage_line_does_not_kill_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"read line
echo "log: starting worker"
echo "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}"
"#,
    );
    let transport = create_transport(&stdio_config(&script, HashMap::new())).unwrap();
    let mut events = transport.dispatcher().subscribe();
    transport.connect().await.unwrap();

    // The non-JSON log line precedes the real response; the request must
    // still resolve.
    let result = transport.request("initialize", None).await.unwrap();
    assert_eq!(result["ok"], true);

    let mut parse_error = false;
    while let Ok(event) = events.try_recv() {
        if let TransportEvent::Error(message) = event {
            assert!(message.contains("log: starting worker"));
            parse_error = true;
        }
    }
    assert!(parse_error);
}

#[tokio::test]
async fn test_disconnect_kills_process() {
    let transport = create_transport(&TransportConfig::Stdio {
        command: "cat".to_string(),
        args: vec![],
        env: HashMap::new(),
    })
    .unwrap();
    transport.connect().await.unwrap();
    transport.disconnect().await.unwrap();
    assert!(transport.notify("n", None).await.is_err());
    // Second disconnect stays safe.
    transport.disconnect().await.unwrap();
}
