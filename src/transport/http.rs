//! HTTP/HTTPS Transport
//!
//! Stateless request/response: each outbound message is one POST of the
//! JSON body, and at most one JSON-RPC payload is parsed from the
//! response. The underlying client is composed once at construction from
//! the proxy, TLS, and auth configuration, and a minimal per-instance
//! cookie jar accumulates `Set-Cookie` values across calls so
//! session-id schemes can be probed.

use super::{Dispatcher, McpTransport, TransportEvent};
use crate::config::{EndpointConfig, TransportKind};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// HTTP transport for remote MCP servers.
pub struct HttpTransport {
    url: reqwest::Url,
    client: reqwest::Client,
    custom_headers: Vec<(String, String)>,
    auth_headers: Vec<(String, String)>,
    /// Minimal name=value jar, no expiry or domain matching.
    cookies: Mutex<BTreeMap<String, String>>,
    dispatcher: Dispatcher,
}

impl HttpTransport {
    pub fn new(kind: TransportKind, endpoint: &EndpointConfig) -> Result<Self, TransportError> {
        let url = parse_endpoint_url(endpoint, &["http", "https"])?;
        Ok(Self {
            url,
            client: build_client(endpoint)?,
            custom_headers: header_vec(&endpoint.headers),
            auth_headers: endpoint
                .auth
                .as_ref()
                .map(|auth| auth.headers())
                .unwrap_or_default(),
            cookies: Mutex::new(BTreeMap::new()),
            dispatcher: Dispatcher::new(kind),
        })
    }

    async fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.lock().await;
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    async fn capture_cookies(&self, response: &reqwest::Response) {
        let mut cookies = self.cookies.lock().await;
        for header in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            let pair = raw.split(';').next().unwrap_or(raw);
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    async fn describe_status_error(
        &self,
        status: StatusCode,
        content_type: &str,
        body: &str,
    ) -> String {
        let mut message = format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error")
        );
        let body = body.trim();
        if body.is_empty() {
            return message;
        }

        if content_type.contains("application/json") {
            let field = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|parsed| {
                    parsed
                        .get("error")
                        .or_else(|| parsed.get("message"))
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                });
            match field {
                Some(field) => message.push_str(&format!(": {field}")),
                None => message.push_str(&format!(": {}", excerpt(body, 200))),
            }
            return message;
        }

        let text = excerpt(body, 200);
        message.push_str(&format!(": {text}"));
        match status.as_u16() {
            401 => message.push_str(" (Authentication required - check your auth token/credentials)"),
            403 => message.push_str(" (Forbidden - check your permissions)"),
            404 => message.push_str(" (Not found - check the URL path)"),
            400 if text.to_lowercase().contains("sessionid") => {
                message.push_str(
                    "\n\nTip: The server requires a sessionid. This is typically provided by:",
                );
                message.push_str("\n  1. A Set-Cookie header in a previous response (check cookies)");
                message.push_str("\n  2. A separate authentication endpoint");
                message.push_str("\n  3. As a custom header: --header \"sessionid: VALUE\"");
                message.push_str("\n  4. As a query parameter: --url \"http://...?sessionid=VALUE\"");
                let cookies = self.cookies.lock().await;
                if !cookies.is_empty() {
                    message.push_str("\n\nCookies received from server:");
                    for (name, value) in cookies.iter() {
                        message.push_str(&format!("\n  {name}={}", excerpt(value, 20)));
                    }
                }
            }
            _ => {}
        }
        message
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        // No persistent channel to open; each send is one POST.
        self.dispatcher.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let value = serde_json::to_value(message)?;
        let body = serde_json::to_string(message)?;
        self.dispatcher.emit(TransportEvent::Sent(value));

        // Increasing precedence: content headers, custom headers,
        // auth-derived headers, then the accumulated cookie header.
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        insert_all(&mut headers, &self.custom_headers)?;
        insert_all(&mut headers, &self.auth_headers)?;
        if let Some(cookie) = self.cookie_header().await {
            let cookie = HeaderValue::from_str(&cookie)
                .map_err(|e| TransportError::Config(format!("Invalid cookie value: {e}")))?;
            headers.insert(COOKIE, cookie);
        }

        let request = self.client.post(self.url.clone()).headers(headers);
        let response = request.body(body).send().await.map_err(|e| {
            self.dispatcher.emit(TransportEvent::Error(e.to_string()));
            TransportError::HttpTransport(e)
        })?;

        self.capture_cookies(&response).await;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await?;

        if status.as_u16() >= 400 {
            let message = self
                .describe_status_error(status, &content_type, &body)
                .await;
            self.dispatcher
                .emit(TransportEvent::Error(message.clone()));
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        // Empty body: nothing to dispatch (typical for notifications).
        if body.trim().is_empty() {
            return Ok(());
        }

        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => {
                self.dispatcher.dispatch(value).await;
                Ok(())
            }
            Err(_) => Err(TransportError::NonJsonResponse {
                status: status.as_u16(),
                preview: excerpt(body.trim(), 200),
            }),
        }
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Validate and parse an endpoint URL against the accepted schemes.
pub(crate) fn parse_endpoint_url(
    endpoint: &EndpointConfig,
    schemes: &[&str],
) -> Result<reqwest::Url, TransportError> {
    if endpoint.url.trim().is_empty() {
        return Err(TransportError::Config(
            "URL required for this transport".to_string(),
        ));
    }
    let url = reqwest::Url::parse(&endpoint.url)
        .map_err(|e| TransportError::Config(format!("Invalid URL {}: {e}", endpoint.url)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(TransportError::Config(format!(
            "Unsupported URL scheme {} (expected one of {schemes:?})",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Compose the shared HTTP client: base agent, optional proxy wrapper,
/// optional TLS material. Used by both the HTTP and SSE transports.
pub(crate) fn build_client(endpoint: &EndpointConfig) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder();

    if let Some(proxy) = &endpoint.proxy {
        let proxy = reqwest::Proxy::all(proxy.dial_string())
            .map_err(|e| TransportError::Config(format!("Invalid proxy configuration: {e}")))?;
        builder = builder.proxy(proxy);
    }

    if let Some(certificate) = &endpoint.certificate {
        let material = certificate.load()?;
        if let Some(ca) = &material.ca_pem {
            let ca = reqwest::Certificate::from_pem(ca)
                .map_err(|e| TransportError::Config(format!("Invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert), Some(key)) = (&material.cert_pem, &material.key_pem) {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| TransportError::Config(format!("Invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if material.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder
        .build()
        .map_err(|e| TransportError::Config(format!("Failed to build HTTP client: {e}")))
}

pub(crate) fn header_vec(headers: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Insert the pairs into the map, later layers replacing earlier ones.
pub(crate) fn insert_all(
    headers: &mut HeaderMap,
    pairs: &[(String, String)],
) -> Result<(), TransportError> {
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Config(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Config(format!("Invalid header value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(())
}

/// Best-effort excerpt of possibly hostile response bodies.
pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
