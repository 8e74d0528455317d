//! WebSocket Transport
//!
//! One persistent connection opened at `connect()`. The TCP stream is
//! established directly, through an HTTP CONNECT tunnel, or through a
//! SOCKS5 proxy; `wss` wraps it in a hand-built rustls configuration so
//! client certificates and the peer-verification toggle apply to the
//! upgrade handshake, which also carries the custom and auth headers.

use super::{Dispatcher, McpTransport, TransportEvent};
use crate::config::{EndpointConfig, ProxyConfig, TlsMaterial, TransportKind};
use crate::error::TransportError;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use base64::Engine as _;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite>>;
type WsSink = SplitSink<WsStream, Message>;

/// WebSocket transport for remote MCP servers.
pub struct WsTransport {
    url: url::Url,
    secure: bool,
    proxy: Option<ProxyConfig>,
    tls: TlsMaterial,
    custom_headers: Vec<(String, String)>,
    auth_headers: Vec<(String, String)>,
    sink: Mutex<Option<WsSink>>,
    dispatcher: Arc<Dispatcher>,
}

impl WsTransport {
    pub fn new(kind: TransportKind, endpoint: &EndpointConfig) -> Result<Self, TransportError> {
        let url = super::http::parse_endpoint_url(endpoint, &["ws", "wss"])?;
        let secure = url.scheme() == "wss";
        let tls = endpoint
            .certificate
            .as_ref()
            .map(|certificate| certificate.load())
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            url,
            secure,
            proxy: endpoint.proxy.clone(),
            tls,
            custom_headers: super::http::header_vec(&endpoint.headers),
            auth_headers: endpoint
                .auth
                .as_ref()
                .map(|auth| auth.headers())
                .unwrap_or_default(),
            sink: Mutex::new(None),
            dispatcher: Arc::new(Dispatcher::new(kind)),
        })
    }

    /// Open the raw byte stream: direct, CONNECT-tunneled, or SOCKS5.
    async fn open_stream(&self, host: &str, port: u16) -> Result<Box<dyn AsyncReadWrite>, TransportError> {
        match &self.proxy {
            None => {
                let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "Failed to connect to {host}:{port}: {e}"
                    ))
                })?;
                Ok(Box::new(tcp))
            }
            Some(proxy) if proxy.protocol.is_socks() => {
                let stream = match (&proxy.username, &proxy.password) {
                    (Some(user), Some(pass)) => Socks5Stream::connect_with_password(
                        (proxy.host.as_str(), proxy.port),
                        (host, port),
                        user,
                        pass,
                    )
                    .await,
                    _ => Socks5Stream::connect((proxy.host.as_str(), proxy.port), (host, port))
                        .await,
                };
                let stream = stream.map_err(|e| {
                    TransportError::ConnectionFailed(format!("SOCKS5 proxy failed: {e}"))
                })?;
                Ok(Box::new(stream))
            }
            Some(proxy) => {
                let tcp = http_connect_tunnel(proxy, host, port).await?;
                Ok(Box::new(tcp))
            }
        }
    }
}

#[async_trait]
impl McpTransport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| TransportError::Config("URL has no host".to_string()))?
            .to_string();
        let port = self
            .url
            .port_or_known_default()
            .ok_or_else(|| TransportError::Config("URL has no port".to_string()))?;

        let stream = self.open_stream(&host, port).await?;
        let stream: Box<dyn AsyncReadWrite> = if self.secure {
            let config = build_tls_config(&self.tls)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| TransportError::Config(format!("Invalid server name: {host}")))?;
            let tls = connector.connect(server_name, stream).await.map_err(|e| {
                TransportError::ConnectionFailed(format!("TLS handshake failed: {e}"))
            })?;
            Box::new(tls)
        } else {
            stream
        };

        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in self.custom_headers.iter().chain(self.auth_headers.iter()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("Invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response): (WsStream, _) =
            tokio_tungstenite::client_async(request, stream).await?;
        self.dispatcher.emit(TransportEvent::Connected);

        let (sink, mut read) = ws.split();
        *self.sink.lock().await = Some(sink);

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => handle_frame(&dispatcher, &text).await,
                    Ok(Message::Binary(data)) => {
                        let text = String::from_utf8_lossy(&data).to_string();
                        handle_frame(&dispatcher, &text).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // ping/pong frames
                    Err(e) => {
                        dispatcher.emit(TransportEvent::Error(format!(
                            "WebSocket read failed: {e}"
                        )));
                        break;
                    }
                }
            }
            tracing::debug!("WebSocket stream closed");
            dispatcher.emit(TransportEvent::Disconnected);
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let value = serde_json::to_value(message)?;
        let text = serde_json::to_string(message)?;
        self.dispatcher.emit(TransportEvent::Sent(value));
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Parse one inbound frame and feed it through the dispatcher. A frame
/// that is not JSON is reported but never closes the socket.
async fn handle_frame(dispatcher: &Dispatcher, text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => dispatcher.dispatch(value).await,
        Err(_) => dispatcher.emit(TransportEvent::Error(format!(
            "Failed to parse WebSocket message: {text}"
        ))),
    }
}

/// Establish a TCP stream through an HTTP CONNECT proxy.
async fn http_connect_tunnel(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to connect to proxy {}:{}: {e}",
                proxy.host, proxy.port
            ))
        })?;

    let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        connect.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes()).await?;

    // Read the proxy's reply up to the header terminator, nothing more:
    // bytes past it belong to the tunneled connection.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8192 {
            return Err(TransportError::ConnectionFailed(
                "Oversized CONNECT response from proxy".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(
                "Proxy closed connection during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
    }
    let status_line = String::from_utf8_lossy(&response);
    let status_line = status_line.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        return Err(TransportError::ConnectionFailed(format!(
            "Proxy CONNECT failed: {status_line}"
        )));
    }
    Ok(stream)
}

/// rustls client configuration honoring the certificate material: custom
/// CA roots, optional client identity, and the verification toggle.
fn build_tls_config(material: &TlsMaterial) -> Result<rustls::ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Config(format!("TLS configuration failed: {e}")))?;

    let builder = if material.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_pem) = &material.ca_pem {
            for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                let cert = cert
                    .map_err(|e| TransportError::Config(format!("Invalid CA certificate: {e}")))?;
                roots.add(cert).map_err(|e| {
                    TransportError::Config(format!("Invalid CA certificate: {e}"))
                })?;
            }
        }
        builder.with_root_certificates(roots)
    };

    match (&material.cert_pem, &material.key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    TransportError::Config(format!("Invalid client certificate: {e}"))
                })?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| TransportError::Config(format!("Invalid private key: {e}")))?
                .ok_or_else(|| {
                    TransportError::Config("No private key found in key file".to_string())
                })?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                TransportError::Config(format!("Client certificate rejected: {e}"))
            })
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Accepts any server certificate. Used only when the configuration
/// explicitly sets `rejectUnauthorized: false`.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
