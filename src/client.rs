//! Reconnecting client runtime.
//!
//! [`Client::connect`] spawns a background loop that opens a transport via a
//! [`Connector`], drives it until it closes, then waits out a backoff delay and
//! tries again. Subscriptions, handlers and queued frames live in the session
//! and survive reconnects; every new connection starts by re-announcing the
//! full subscription set.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use futures_util::stream::BoxStream;

use crate::backoff::{Backoff, BackoffPolicy, ConnectionState};
use crate::error::SessionError;
use crate::frame::Frame;
use crate::provider::{EventProvider, EventSource, EventStream};
use crate::session::{ConnectionExit, ErrorMode, Handler, Responder, Session, SessionConfig};
use crate::transport::Connector;

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Reconnect policy.
    pub backoff: BackoffPolicy,
    /// Handling of malformed frames and unknown subscriptions.
    pub error_mode: ErrorMode,
    /// Keep-alive pings from the client; the server pings by default.
    #[serde(rename = "ping_interval_ms", with = "crate::config::option_duration_ms")]
    pub ping_interval: Option<Duration>,
}

/// Builder for a [`Client`] that also serves events or requests to the peer.
#[derive(Default)]
pub struct ClientBuilder {
    options: ClientOptions,
    config: SessionConfig,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("options", &self.options)
            .field("has_provider", &self.config.provider.is_some())
            .field("handlers", &self.config.handlers.len())
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve subscriptions from the server out of `provider`.
    #[must_use]
    pub fn event_provider(mut self, provider: impl EventProvider + 'static) -> Self {
        self.config.provider = Some(Arc::new(provider));
        self
    }

    /// Push `source` on every connection regardless of subscriptions.
    #[must_use]
    pub fn register_static_stream(mut self, event_type: impl Into<String>, source: EventSource) -> Self {
        self.config.static_streams.push((event_type.into(), source));
        self
    }

    /// Register a handler for inbound frames of `event_type`.
    #[must_use]
    pub fn handle<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Option<Responder>) + Send + Sync + 'static,
    {
        self.config.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Start connecting. Must be called inside a tokio runtime.
    pub fn connect(self, connector: impl Connector + 'static) -> Client {
        let Self { options, mut config } = self;
        config.error_mode = options.error_mode;
        config.ping_interval = options.ping_interval;
        Client::spawn(Arc::new(connector), options.backoff, config)
    }
}

/// Handle to a reconnecting connection. Dropping it stops the connection.
pub struct Client {
    session: Arc<Session>,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    connected_signal: watch::Receiver<bool>,
    connected: broadcast::Sender<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start connecting with no provider or handlers.
    pub fn connect(connector: impl Connector + 'static, options: ClientOptions) -> Self {
        ClientBuilder::new().options(options).connect(connector)
    }

    /// Builder for a client that also serves the peer.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn spawn(connector: Arc<dyn Connector>, policy: BackoffPolicy, config: SessionConfig) -> Self {
        let (session, outbound_rx) = Session::new("client", config);
        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (signal_tx, connected_signal) = watch::channel(false);
        let (connected, _) = broadcast::channel(16);

        let reconnect = ReconnectLoop {
            session: Arc::clone(&session),
            connector,
            backoff: Backoff::new(policy),
            outbound_rx,
            cancel: cancel.clone(),
            state_tx,
            signal_tx,
            connected: connected.clone(),
        };
        tokio::spawn(reconnect.run());

        Self {
            session,
            cancel,
            state,
            connected_signal,
            connected,
        }
    }

    /// Fire-and-forget event. Queued while disconnected.
    pub fn send(&self, event_type: &str, data: Value) {
        self.session.send(event_type, data);
    }

    /// Request with no timeout.
    pub async fn request(&self, event_type: &str, data: Value) -> Result<Value, SessionError> {
        self.session.request(event_type, data).await
    }

    /// Request bounded by `timeout`.
    pub async fn request_timeout(
        &self,
        event_type: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        self.session.request_timeout(event_type, data, timeout).await
    }

    /// Payloads pushed for `event_type`. Subscribed while the stream lives.
    pub fn receive(&self, event_type: &str) -> EventStream {
        self.session.receive(event_type)
    }

    /// Requests from the server of `event_type`.
    ///
    /// A handler registered for `event_type` takes these instead.
    pub fn receive_requests(&self, event_type: &str) -> BoxStream<'static, (Value, Responder)> {
        self.session.receive_requests(event_type)
    }

    /// Register (or replace) a handler.
    pub fn handle<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(Value, Option<Responder>) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.session.handle(event_type, handler);
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        *self.connected_signal.borrow()
    }

    /// Boolean connected signal.
    pub fn connected_signal(&self) -> watch::Receiver<bool> {
        self.connected_signal.clone()
    }

    /// Fires once per successful open, starting from now.
    pub fn connected(&self) -> broadcast::Receiver<()> {
        self.connected.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Event types currently announced to the server.
    pub fn subscriptions(&self) -> Vec<String> {
        self.session.subscriptions().into_iter().collect()
    }

    /// Stop reconnecting and close the current connection.
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("[Client] Disconnect requested");
        }
        self.cancel.cancel();
    }

    /// Wait until the client has stopped for good.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // Sender dropping also means the loop has ended.
        let _ = state.wait_for(|s| *s == ConnectionState::ClosedPermanently).await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReconnectLoop {
    session: Arc<Session>,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    signal_tx: watch::Sender<bool>,
    connected: broadcast::Sender<()>,
}

impl ReconnectLoop {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                log::info!("[Client] Shutdown requested, exiting connection loop");
                break;
            }

            self.state_tx.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(mut transport) => {
                    log::info!("[Client] Connected");
                    self.backoff.reset();
                    self.state_tx.send_replace(ConnectionState::Open);
                    self.signal_tx.send_replace(true);
                    // No listeners is fine.
                    let _ = self.connected.send(());

                    let exit = self
                        .session
                        .run_connection(transport.as_mut(), &mut self.outbound_rx, &self.cancel)
                        .await;
                    self.signal_tx.send_replace(false);
                    if exit == ConnectionExit::Shutdown {
                        break;
                    }
                    log::info!("[Client] Disconnected");
                }
                Err(e) => {
                    log::warn!("[Client] Connection failed: {:#}", e);
                }
            }

            let Some(delay) = self.backoff.next_delay() else {
                log::warn!(
                    "[Client] Giving up after {} consecutive failures",
                    self.backoff.attempt()
                );
                break;
            };
            let attempt = self.backoff.attempt().saturating_sub(1);
            let next_retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            log::info!("[Client] Reconnecting in {}ms (attempt {})", next_retry_ms, attempt);
            self.state_tx.send_replace(ConnectionState::ClosedRetrying {
                attempt,
                next_retry_ms,
            });

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.signal_tx.send_replace(false);
        self.state_tx.send_replace(ConnectionState::ClosedPermanently);
        // Stop accepting new frames before failing waiters.
        self.outbound_rx.close();
        self.session.fail_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::transport::{MemoryConnector, MemoryTransport, Transport, TransportEvent};
    use serde_json::json;

    async fn next_frame(peer: &mut MemoryTransport) -> Frame {
        loop {
            match peer.recv().await.expect("transport ended") {
                TransportEvent::Text(text) => return frame::decode(&text).expect("valid frame"),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_open_and_announces() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let client = Client::connect(connector, ClientOptions::default());
        let mut peer = acceptor.accept().await.unwrap();

        let announce = next_frame(&mut peer).await;
        assert!(announce.is_subscribe());

        let mut signal = client.connected_signal();
        signal.wait_for(|open| *open).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_enters_retrying() {
        let (connector, acceptor) = MemoryConnector::new();
        acceptor.fail_next(1);
        let client = Client::connect(connector, ClientOptions::default());

        let mut states = client.state_changes();
        let state = states
            .wait_for(|s| matches!(s, ConnectionState::ClosedRetrying { .. }))
            .await
            .unwrap()
            .clone();
        assert_eq!(
            state,
            ConnectionState::ClosedRetrying {
                attempt: 1,
                next_retry_ms: 1000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_closes_permanently() {
        let (connector, acceptor) = MemoryConnector::new();
        acceptor.fail_next(1);
        let options = ClientOptions {
            backoff: BackoffPolicy {
                retry: false,
                ..BackoffPolicy::default()
            },
            ..ClientOptions::default()
        };
        let client = Client::connect(connector, options);
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::ClosedPermanently);
        assert_eq!(acceptor.attempts(), 1);
        assert_eq!(client.request("x", json!(null)).await, Err(SessionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_flushed_after_announce() {
        let (connector, mut acceptor) = MemoryConnector::new();
        acceptor.fail_next(1);
        let client = Client::connect(connector, ClientOptions::default());
        let _events = client.receive("a");
        client.send("hello", json!("queued"));

        let mut peer = acceptor.accept().await.unwrap();
        let announce = next_frame(&mut peer).await;
        assert_eq!(announce.data(), &json!(["a"]));
        let queued = next_frame(&mut peer).await;
        assert_eq!(queued.event_type(), Some("hello"));
        assert_eq!(queued.data(), &json!("queued"));
    }

    #[test]
    fn test_options_deserialize_ms() {
        let options: ClientOptions = serde_json::from_value(json!({
            "backoff": { "base": 2.0, "max_delay_ms": 5000 },
            "ping_interval_ms": 250,
        }))
        .unwrap();
        assert_eq!(options.backoff.base, 2.0);
        assert_eq!(options.backoff.max_delay, Duration::from_secs(5));
        assert!(options.backoff.retry);
        assert_eq!(options.ping_interval, Some(Duration::from_millis(250)));
        assert_eq!(options.error_mode, ErrorMode::Lenient);
    }
}
