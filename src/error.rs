//! Error types for the transport layer.

use serde_json::Value;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Transport not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Request timeout for method: {method}")]
    RequestTimeout { method: String },
    /// JSON-RPC error response, resolved as a rejection.
    #[error("{message} ({code})")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
    /// HTTP 4xx/5xx translated into a descriptive message
    /// (status line, body excerpt, contextual hints).
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("Server returned non-JSON response (HTTP {status}): {preview}")]
    NonJsonResponse { status: u16, preview: String },
    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),
    #[error("Response channel closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP transport error: {0}")]
    HttpTransport(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// JSON-RPC method-not-found
pub const METHOD_NOT_FOUND: i32 = -32601;

impl TransportError {
    /// Whether this error means the server simply does not implement the
    /// requested method. The session layer downgrades these to empty
    /// results for the optional listing endpoints.
    pub fn is_method_not_supported(&self) -> bool {
        match self {
            TransportError::Rpc { code, message, .. } => {
                *code == METHOD_NOT_FOUND || unsupported_method_message(message)
            }
            _ => false,
        }
    }
}

/// Message-substring fallback for servers that report a missing method
/// without the standard -32601 code.
pub(crate) fn unsupported_method_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("not found")
        || lowered.contains("not supported")
        || lowered.contains("not a function")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_method() {
        let err = TransportError::RequestTimeout {
            method: "tools/call".to_string(),
        };
        assert_eq!(err.to_string(), "Request timeout for method: tools/call");
    }

    #[test]
    fn test_rpc_error_display() {
        let err = TransportError::Rpc {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "Invalid Request (-32600)");
    }

    #[test]
    fn test_method_not_supported_by_code() {
        let err = TransportError::Rpc {
            code: METHOD_NOT_FOUND,
            message: "whatever".to_string(),
            data: None,
        };
        assert!(err.is_method_not_supported());
    }

    #[test]
    fn test_method_not_supported_by_message() {
        let err = TransportError::Rpc {
            code: -32000,
            message: "Method not found: tools/list".to_string(),
            data: None,
        };
        assert!(err.is_method_not_supported());
    }

    #[test]
    fn test_other_errors_are_not_downgraded() {
        let err = TransportError::Rpc {
            code: -32000,
            message: "internal error".to_string(),
            data: None,
        };
        assert!(!err.is_method_not_supported());
        assert!(!TransportError::NotConnected.is_method_not_supported());
    }
}
