//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` implementing [`Transport`] for
//! both ends of a connection. All WebSocket consumers in the crate should
//! use this module rather than `tokio-tungstenite` directly.
//!
//! # Architecture
//!
//! [`connect`] handles URL→request building, header insertion and TLS
//! negotiation for the initiating side; [`accept`] performs the server-side
//! handshake on an accepted TCP stream. Both return a [`WsTransport`], so the
//! client and server runtimes are transport-agnostic.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::transport::{Connector, Transport, TransportEvent};

/// Transport produced by [`connect`].
pub type ClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

/// Transport produced by [`accept`].
pub type ServerTransport = WsTransport<TcpStream>;

/// WebSocket connection over any byte stream.
pub struct WsTransport<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> std::fmt::Debug for WsTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-handshaken WebSocket stream.
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws_stream.split();
        Self { sink, stream }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn send_ping(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Ping(data))
            .await
            .context("WebSocket send_ping failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Raw `Frame` variants are skipped internally.
    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(TransportEvent::Text(text.to_string()));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(TransportEvent::Binary(data.to_vec()));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(TransportEvent::Ping(data.to_vec()));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(TransportEvent::Pong(data.to_vec()));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(TransportEvent::Close { code, reason });
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames, skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(TransportEvent::Error(format!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<ClientTransport> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    Ok(WsTransport::new(ws_stream))
}

/// Perform the server side of the WebSocket handshake on an accepted stream.
///
/// # Errors
///
/// Returns an error if the peer does not complete a valid handshake.
pub async fn accept(stream: TcpStream) -> Result<ServerTransport> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    Ok(WsTransport::new(ws_stream))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

/// [`Connector`] that dials a WebSocket URL on every attempt.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Connector for `url`; `http(s)://` is rewritten to `ws(s)://`.
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: http_to_ws_scheme(url.as_ref()),
            headers: Vec::new(),
        }
    }

    /// Add a header sent with every handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        let transport = connect(&self.url, &headers).await?;
        Ok(Box::new(transport))
    }
}
