//! Traffic Log and Correlation
//!
//! Every message sent or received over a transport is appended to a
//! bounded, time-ordered ring. The correlation feed pairs sent requests
//! with their eventual responses by JSON-RPC id so a dashboard can render
//! request/response units with an ok/error/pending outcome.

use crate::config::TransportKind;
use crate::error::{unsupported_method_message, METHOD_NOT_FOUND};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

/// Maximum number of retained traffic entries; oldest are evicted first.
pub const TRAFFIC_LOG_CAPACITY: usize = 1000;

/// Message direction relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One logged wire-level message.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficLogEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub transport: TransportKind,
    pub data: Value,
    /// Pretty-printed serialized form, for detail views.
    pub raw: String,
}

/// Fixed-capacity ring of the last [`TRAFFIC_LOG_CAPACITY`] entries.
#[derive(Debug, Default)]
pub struct TrafficLog {
    entries: VecDeque<TrafficLogEntry>,
}

impl TrafficLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(TRAFFIC_LOG_CAPACITY),
        }
    }

    pub fn record(&mut self, direction: Direction, transport: TransportKind, data: &Value) {
        let entry = TrafficLogEntry {
            timestamp: Utc::now(),
            direction,
            transport,
            data: data.clone(),
            raw: serde_json::to_string_pretty(data).unwrap_or_default(),
        };
        self.entries.push_back(entry);
        while self.entries.len() > TRAFFIC_LOG_CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<TrafficLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a correlated request/response unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Ok,
    Error,
    Pending,
}

/// A sent request paired with its response, if one has arrived.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: TrafficLogEntry,
    pub response: Option<TrafficLogEntry>,
    pub status: ExchangeStatus,
}

const LIST_METHODS: [&str; 3] = ["tools/list", "resources/list", "prompts/list"];

fn is_list_method(method: &str) -> bool {
    LIST_METHODS.contains(&method)
}

fn indicates_unsupported_method(error: &Value) -> bool {
    if error.get("code").and_then(Value::as_i64) == Some(METHOD_NOT_FOUND as i64) {
        return true;
    }
    error
        .get("message")
        .and_then(Value::as_str)
        .is_some_and(unsupported_method_message)
}

/// Pair every sent request with the first later-appearing received entry
/// carrying the same id. Unresolved requests surface as `Pending`.
///
/// "Method not found" errors on the optional listing endpoints are
/// suppressed entirely: the session layer already degraded them to empty
/// lists, so they are expected noise rather than failures.
pub fn correlate(entries: &[TrafficLogEntry]) -> Vec<Exchange> {
    let mut exchanges = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.direction != Direction::Sent {
            continue;
        }
        let Some(method) = entry.data.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = entry.data.get("id") else {
            continue; // notification, nothing to pair
        };
        let response = entries[index + 1..]
            .iter()
            .find(|later| later.direction == Direction::Received && later.data.get("id") == Some(id));
        match response {
            Some(response) => {
                if let Some(error) = response.data.get("error") {
                    if is_list_method(method) && indicates_unsupported_method(error) {
                        continue;
                    }
                    exchanges.push(Exchange {
                        request: entry.clone(),
                        response: Some(response.clone()),
                        status: ExchangeStatus::Error,
                    });
                } else {
                    exchanges.push(Exchange {
                        request: entry.clone(),
                        response: Some(response.clone()),
                        status: ExchangeStatus::Ok,
                    });
                }
            }
            None => exchanges.push(Exchange {
                request: entry.clone(),
                response: None,
                status: ExchangeStatus::Pending,
            }),
        }
    }
    exchanges
}

/// Backward scan: given a received entry, find the sent request it
/// answers. Used by detail views opened from the response side.
pub fn request_for<'a>(
    entries: &'a [TrafficLogEntry],
    response: &TrafficLogEntry,
) -> Option<&'a TrafficLogEntry> {
    let id = response.data.get("id")?;
    if id.is_null() {
        return None;
    }
    entries
        .iter()
        .rev()
        .find(|entry| entry.direction == Direction::Sent && entry.data.get("id") == Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(direction: Direction, data: Value) -> TrafficLogEntry {
        TrafficLogEntry {
            timestamp: Utc::now(),
            direction,
            transport: TransportKind::Stdio,
            raw: serde_json::to_string_pretty(&data).unwrap(),
            data,
        }
    }

    #[test]
    fn test_ring_evicts_oldest_beyond_capacity() {
        let mut log = TrafficLog::new();
        for i in 0..(TRAFFIC_LOG_CAPACITY + 5) {
            log.record(Direction::Sent, TransportKind::Http, &json!({"id": i}));
        }
        assert_eq!(log.len(), TRAFFIC_LOG_CAPACITY);
        let entries = log.snapshot();
        assert_eq!(entries[0].data["id"], 5);
        assert_eq!(
            entries[TRAFFIC_LOG_CAPACITY - 1].data["id"],
            TRAFFIC_LOG_CAPACITY + 4
        );
    }

    #[test]
    fn test_record_keeps_pretty_raw_form() {
        let mut log = TrafficLog::new();
        log.record(
            Direction::Sent,
            TransportKind::Ws,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        );
        let raw = &log.snapshot()[0].raw;
        assert!(raw.contains('\n'));
        assert!(raw.contains("tools/list"));
    }

    #[test]
    fn test_correlate_pairs_request_with_response() {
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}),
            ),
        ];
        let exchanges = correlate(&entries);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].status, ExchangeStatus::Ok);
        assert_eq!(exchanges[0].response.as_ref().unwrap().data["id"], 7);
    }

    #[test]
    fn test_correlate_unresolved_request_is_pending() {
        let entries = vec![entry(
            Direction::Sent,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call"}),
        )];
        let exchanges = correlate(&entries);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].status, ExchangeStatus::Pending);
        assert!(exchanges[0].response.is_none());
    }

    #[test]
    fn test_correlate_error_response() {
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32000, "message": "boom"}}),
            ),
        ];
        let exchanges = correlate(&entries);
        assert_eq!(exchanges[0].status, ExchangeStatus::Error);
    }

    #[test]
    fn test_correlate_suppresses_unsupported_list_methods() {
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 3, "method": "prompts/list"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "Method not found"}}),
            ),
        ];
        assert!(correlate(&entries).is_empty());
    }

    #[test]
    fn test_correlate_does_not_suppress_unsupported_invocations() {
        // Only the three listing methods are expected noise.
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -32601, "message": "Method not found"}}),
            ),
        ];
        let exchanges = correlate(&entries);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].status, ExchangeStatus::Error);
    }

    #[test]
    fn test_correlate_skips_notifications() {
        let entries = vec![entry(
            Direction::Sent,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )];
        assert!(correlate(&entries).is_empty());
    }

    #[test]
    fn test_correlate_matches_first_later_response() {
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 1, "method": "a"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 1, "result": "first"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 1, "result": "second"}),
            ),
        ];
        let exchanges = correlate(&entries);
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].response.as_ref().unwrap().data["result"], "first");
    }

    #[test]
    fn test_request_for_scans_backward() {
        let entries = vec![
            entry(
                Direction::Sent,
                json!({"jsonrpc": "2.0", "id": 9, "method": "resources/read"}),
            ),
            entry(
                Direction::Received,
                json!({"jsonrpc": "2.0", "id": 9, "result": {}}),
            ),
        ];
        let request = request_for(&entries, &entries[1]).unwrap();
        assert_eq!(request.data["method"], "resources/read");
        let orphan = entry(
            Direction::Received,
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}),
        );
        assert!(request_for(&entries, &orphan).is_none());
    }
}
