//! Transport Configuration
//!
//! Defines the configuration shapes a transport is constructed from:
//! transport selection, proxy tunneling, authentication headers, and
//! TLS material. A configuration is immutable once a transport has been
//! built from it.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Transport kind, used for traffic-log attribution and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Https,
    Ws,
    Wss,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Https => "https",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Sse => "sse",
        };
        write!(f, "{name}")
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local process (newline-delimited JSON over stdio)
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Single-shot HTTP POST per message
    Http(EndpointConfig),
    /// Single-shot HTTPS POST per message
    Https(EndpointConfig),
    /// Persistent WebSocket connection
    Ws(EndpointConfig),
    /// Persistent WebSocket connection over TLS
    Wss(EndpointConfig),
    /// Server-Sent-Events stream (GET) + HTTP POST sends
    Sse(EndpointConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Http(_) => TransportKind::Http,
            TransportConfig::Https(_) => TransportKind::Https,
            TransportConfig::Ws(_) => TransportKind::Ws,
            TransportConfig::Wss(_) => TransportKind::Wss,
            TransportConfig::Sse(_) => TransportKind::Sse,
        }
    }
}

/// Shared configuration for the URL-based transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateConfig>,
    /// Custom headers sent on every outbound request, merged below
    /// auth-derived headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            auth: None,
            certificate: None,
            headers: HashMap::new(),
        }
    }
}

/// Proxy protocol for the dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks,
    Socks5,
}

impl ProxyProtocol {
    pub fn is_socks(self) -> bool {
        matches!(self, ProxyProtocol::Socks | ProxyProtocol::Socks5)
    }
}

/// Proxy configuration. Absence means a direct connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Dial string `<protocol>://[user:pass@]host:port`.
    /// `socks` and `socks5` are synonyms and both render as `socks5`.
    pub fn dial_string(&self) -> String {
        let scheme = match self.protocol {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks | ProxyProtocol::Socks5 => "socks5",
        };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            _ => String::new(),
        };
        format!("{scheme}://{auth}{}:{}", self.host, self.port)
    }
}

/// Authentication configuration, rendered into request headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Bearer { token: String },
    Basic { username: String, password: String },
    Custom { headers: HashMap<String, String> },
}

impl AuthConfig {
    /// Derived headers, merged verbatim over custom headers.
    pub fn headers(&self) -> Vec<(String, String)> {
        use base64::Engine as _;
        match self {
            AuthConfig::Bearer { token } => {
                vec![("Authorization".to_string(), format!("Bearer {token}"))]
            }
            AuthConfig::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                vec![("Authorization".to_string(), format!("Basic {credentials}"))]
            }
            AuthConfig::Custom { headers } => headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Client certificate / CA configuration. All paths are read exactly
/// once, at transport construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Peer-certificate validation toggle. `false` accepts any server
    /// certificate, which is routine behind intercepting proxies.
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
}

fn default_true() -> bool {
    true
}

/// TLS material loaded from a [`CertificateConfig`].
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub cert_pem: Option<Vec<u8>>,
    pub key_pem: Option<Vec<u8>>,
    pub ca_pem: Option<Vec<u8>>,
    /// Peer verification disabled (`rejectUnauthorized: false`).
    pub insecure: bool,
}

impl CertificateConfig {
    /// Read the configured PEM files into memory.
    ///
    /// The rustls backends cannot decrypt passphrase-protected private
    /// keys, so a configured passphrase is rejected up front rather than
    /// failing deep inside a handshake.
    pub fn load(&self) -> Result<TlsMaterial, TransportError> {
        if self.passphrase.is_some() {
            return Err(TransportError::Config(
                "Passphrase-protected private keys are not supported; decrypt the key first"
                    .to_string(),
            ));
        }
        let read = |path: &PathBuf| -> Result<Vec<u8>, TransportError> {
            std::fs::read(path).map_err(|e| {
                TransportError::Config(format!("Failed to read {}: {e}", path.display()))
            })
        };
        Ok(TlsMaterial {
            cert_pem: self.cert.as_ref().map(&read).transpose()?,
            key_pem: self.key.as_ref().map(&read).transpose()?,
            ca_pem: self.ca.as_ref().map(&read).transpose()?,
            insecure: !self.reject_unauthorized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_stdio_deserialize() {
        let json = r#"{
            "type": "stdio",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-github"]
        }"#;
        let config: TransportConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), TransportKind::Stdio);
        match config {
            TransportConfig::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert!(env.is_empty());
            }
            _ => panic!("Expected stdio config"),
        }
    }

    #[test]
    fn test_transport_config_sse_deserialize() {
        let json = r#"{
            "type": "sse",
            "url": "https://mcp.example.com/sse",
            "headers": {"X-Api-Key": "k"}
        }"#;
        let config: TransportConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), TransportKind::Sse);
        match config {
            TransportConfig::Sse(endpoint) => {
                assert_eq!(endpoint.url, "https://mcp.example.com/sse");
                assert_eq!(endpoint.headers["X-Api-Key"], "k");
            }
            _ => panic!("Expected sse config"),
        }
    }

    #[test]
    fn test_proxy_dial_string_plain() {
        let proxy = ProxyConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
        };
        assert_eq!(proxy.dial_string(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_proxy_dial_string_socks_synonyms() {
        for protocol in [ProxyProtocol::Socks, ProxyProtocol::Socks5] {
            let proxy = ProxyConfig {
                host: "proxy.local".to_string(),
                port: 1080,
                protocol,
                username: Some("u".to_string()),
                password: Some("p".to_string()),
            };
            assert_eq!(proxy.dial_string(), "socks5://u:p@proxy.local:1080");
        }
    }

    #[test]
    fn test_proxy_protocol_default_is_http() {
        let json = r#"{"host": "h", "port": 3128}"#;
        let proxy: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(proxy.protocol, ProxyProtocol::Http);
    }

    #[test]
    fn test_auth_bearer_header() {
        let auth = AuthConfig::Bearer {
            token: "tok".to_string(),
        };
        assert_eq!(
            auth.headers(),
            vec![("Authorization".to_string(), "Bearer tok".to_string())]
        );
    }

    #[test]
    fn test_auth_basic_header_is_base64() {
        let auth = AuthConfig::Basic {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        // base64("admin:secret")
        assert_eq!(
            auth.headers(),
            vec![(
                "Authorization".to_string(),
                "Basic YWRtaW46c2VjcmV0".to_string()
            )]
        );
    }

    #[test]
    fn test_auth_custom_headers_verbatim() {
        let mut headers = HashMap::new();
        headers.insert("X-Session".to_string(), "abc".to_string());
        let auth = AuthConfig::Custom { headers };
        assert_eq!(
            auth.headers(),
            vec![("X-Session".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn test_certificate_reject_unauthorized_defaults_true() {
        let config: CertificateConfig = serde_json::from_str("{}").unwrap();
        assert!(config.reject_unauthorized);
        let config: CertificateConfig =
            serde_json::from_str(r#"{"rejectUnauthorized": false}"#).unwrap();
        assert!(!config.reject_unauthorized);
    }

    #[test]
    fn test_certificate_load_reads_files_once() {
        use std::io::Write as _;
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let config = CertificateConfig {
            ca: Some(ca.path().to_path_buf()),
            reject_unauthorized: false,
            ..Default::default()
        };
        let material = config.load().unwrap();
        assert!(material.ca_pem.unwrap().starts_with(b"-----BEGIN"));
        assert!(material.insecure);
    }

    #[test]
    fn test_certificate_load_missing_file_is_config_error() {
        let config = CertificateConfig {
            cert: Some(PathBuf::from("/nonexistent/client.pem")),
            ..Default::default()
        };
        assert!(matches!(
            config.load(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_certificate_passphrase_rejected() {
        let config = CertificateConfig {
            passphrase: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.load(), Err(TransportError::Config(_))));
    }
}
