//! Server runtime.
//!
//! A [`ServerBuilder`] holds what every connection shares: the event
//! provider, static streams, handlers and [`ServerOptions`]. Each live
//! transport is bound into its own [`ServerConnection`] with a private session,
//! so subscriptions and forwarders never leak between connections while the
//! event sources behind them are shared.
//!
//! [`ServerBuilder::listen`] adds a TCP accept loop that performs the
//! WebSocket handshake and binds every accepted socket. Bound connections
//! wait in a bounded queue for [`SocketServer::accept`]; a connection that
//! ends while waiting leaves the queue, and when the queue is full the
//! oldest handle is dropped. Dropped handles do not close their connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{ACCEPT_QUEUE, DEFAULT_PING_INTERVAL};
use crate::error::SessionError;
use crate::provider::{EventProvider, EventSource, EventStream, StaticEventProvider};
use crate::session::{ErrorMode, Handler, Responder, Session, SessionConfig};
use crate::transport::Transport;

/// Per-connection server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Keep-alive ping cadence; `null` disables pings.
    #[serde(rename = "ping_interval_ms", with = "crate::config::option_duration_ms")]
    pub ping_interval: Option<Duration>,
    /// Handling of malformed frames and unknown subscriptions.
    pub error_mode: ErrorMode,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            error_mode: ErrorMode::default(),
        }
    }
}

/// Shared configuration for server connections.
#[derive(Clone, Default)]
pub struct ServerBuilder {
    options: ServerOptions,
    config: SessionConfig,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("options", &self.options)
            .field("has_provider", &self.config.provider.is_some())
            .field("static_streams", &self.config.static_streams.len())
            .field("handlers", &self.config.handlers.len())
            .finish()
    }
}

impl ServerBuilder {
    /// Builder with default options and nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve subscriptions out of `provider`. Replaces any earlier provider.
    #[must_use]
    pub fn event_provider(mut self, provider: impl EventProvider + 'static) -> Self {
        self.config.provider = Some(Arc::new(provider));
        self
    }

    /// Serve subscriptions out of a fixed table. Replaces any earlier provider.
    #[must_use]
    pub fn register_event_provider<I, S>(self, sources: I) -> Self
    where
        I: IntoIterator<Item = (S, EventSource)>,
        S: Into<String>,
    {
        let provider: StaticEventProvider = sources
            .into_iter()
            .map(|(name, source)| (name.into(), source))
            .collect();
        self.event_provider(provider)
    }

    /// Push `source` on every connection regardless of subscriptions.
    #[must_use]
    pub fn register_static_stream(mut self, event_type: impl Into<String>, source: EventSource) -> Self {
        self.config.static_streams.push((event_type.into(), source));
        self
    }

    /// Register a handler shared by every connection.
    #[must_use]
    pub fn handle<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Option<Responder>) + Send + Sync + 'static,
    {
        self.config.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Bind one live transport. Must be called inside a tokio runtime.
    pub fn bind(&self, transport: impl Transport + 'static) -> ServerConnection {
        let id = generate_connection_id();
        let mut config = self.config.clone();
        config.ping_interval = self.options.ping_interval;
        config.error_mode = self.options.error_mode;

        let (session, mut outbound_rx) = Session::new(format!("server:{id}"), config);
        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let (closed_tx, closed) = watch::channel(false);

        log::info!("[Server] Connection {} bound", id);
        let driver = Arc::clone(&session);
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut transport = transport;
            let exit = driver.run_connection(&mut transport, &mut outbound_rx, &token).await;
            log::info!("[Server] {} ended ({:?})", driver.label(), exit);
            outbound_rx.close();
            driver.fail_pending();
            closed_tx.send_replace(true);
        });

        ServerConnection {
            id: Arc::from(id),
            session,
            cancel,
            closed,
        }
    }

    /// Listen for WebSocket connections on `addr`.
    pub async fn listen(&self, addr: &str) -> Result<SocketServer> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("[Server] Listening on {}", local_addr);

        let queue = Arc::new(AcceptQueue::default());
        let accept_handle = tokio::spawn(accept_loop(listener, self.clone(), Arc::clone(&queue)));
        Ok(SocketServer {
            local_addr,
            accept_handle,
            queue,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    builder: ServerBuilder,
    queue: Arc<AcceptQueue>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let builder = builder.clone();
                let queue = Arc::clone(&queue);
                // Handshake off the accept loop so a slow peer cannot stall it.
                tokio::spawn(async move {
                    let transport = match crate::ws::accept(stream).await {
                        Ok(transport) => transport,
                        Err(e) => {
                            log::warn!("[Server] Handshake with {} failed: {:#}", peer, e);
                            return;
                        }
                    };
                    let conn = builder.bind(transport);
                    log::debug!("[Server] {} is {}", peer, conn.connection_id());
                    queue.push(conn);
                });
            }
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Connections waiting for [`SocketServer::accept`], at most [`ACCEPT_QUEUE`].
#[derive(Debug, Default)]
struct AcceptQueue {
    waiting: Mutex<VecDeque<ServerConnection>>,
    ready: Notify,
}

impl AcceptQueue {
    /// Queue `conn` and forget it again once it closes.
    fn push(self: &Arc<Self>, conn: ServerConnection) {
        {
            let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
            if waiting.len() >= ACCEPT_QUEUE {
                if let Some(oldest) = waiting.pop_front() {
                    log::warn!(
                        "[Server] Accept queue full, dropping handle for {}",
                        oldest.connection_id()
                    );
                }
            }
            waiting.push_back(conn.clone());
        }
        self.ready.notify_one();

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            conn.closed().await;
            if let Some(queue) = queue.upgrade() {
                queue.forget(conn.connection_id());
            }
        });
    }

    fn pop(&self) -> Option<ServerConnection> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn forget(&self, id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|conn| conn.connection_id() != id);
    }

    fn len(&self) -> usize {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Generate a unique connection ID using a monotonic counter + random suffix.
fn generate_connection_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("conn:{seq:x}{rand:04x}")
}

/// One bound connection. Cheap to clone; dropping handles does not close it.
#[derive(Clone)]
pub struct ServerConnection {
    id: Arc<str>,
    session: Arc<Session>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Unique id, also used as log prefix.
    pub fn connection_id(&self) -> &str {
        &self.id
    }

    /// Fire-and-forget event to this peer.
    pub fn send(&self, event_type: &str, data: Value) {
        self.session.send(event_type, data);
    }

    /// Request to this peer, no timeout.
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

    /// Events pushed by this peer. Announces a subscription to it.
    pub fn receive(&self, event_type: &str) -> EventStream {
        self.session.receive(event_type)
    }

    /// Requests from this peer, unless a handler is registered for them.
    pub fn receive_requests(&self, event_type: &str) -> BoxStream<'static, (Value, Responder)> {
        self.session.receive_requests(event_type)
    }

    /// Register (or replace) a handler on this connection only.
    pub fn handle<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(Value, Option<Responder>) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.session.handle(event_type, handler);
    }

    /// Event types the peer has been asked for.
    pub fn subscriptions(&self) -> Vec<String> {
        self.session.subscriptions().into_iter().collect()
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the connection to end.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Close the connection.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// TCP accept loop started by [`ServerBuilder::listen`].
#[derive(Debug)]
pub struct SocketServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    queue: Arc<AcceptQueue>,
}

impl SocketServer {
    /// Next queued connection that completed its handshake.
    ///
    /// `None` once the accept loop has stopped and the queue is empty.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        loop {
            if let Some(conn) = self.queue.pop() {
                return Some(conn);
            }
            if self.accept_handle.is_finished() {
                return None;
            }
            self.queue.ready.notified().await;
        }
    }

    /// Connections waiting for [`Self::accept`].
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Existing connections keep running.
    pub fn shutdown(self) {
        self.accept_handle.abort();
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, Frame};
    use crate::transport::{MemoryTransport, TransportEvent};
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_frame(peer: &mut MemoryTransport) -> Frame {
        loop {
            let event = tokio::time::timeout(WAIT, peer.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("transport ended");
            if let TransportEvent::Text(text) = event {
                return frame::decode(&text).expect("valid frame");
            }
        }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert!(a.starts_with("conn:"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_options_ping_every_30s() {
        let options = ServerOptions::default();
        assert_eq!(options.ping_interval, Some(Duration::from_secs(30)));
        assert_eq!(options.error_mode, ErrorMode::Lenient);
    }

    #[tokio::test]
    async fn test_static_stream_pushed_without_subscription() {
        let (publisher, source) = EventSource::channel();
        let builder = ServerBuilder::new().register_static_stream("clock", source);
        let (local, mut peer) = MemoryTransport::pair();
        let _conn = builder.bind(local);

        let announce = next_frame(&mut peer).await;
        assert!(announce.is_subscribe());

        publisher.publish(json!(1));
        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.event_type(), Some("clock"));
        assert_eq!(frame.data(), &json!(1));
    }

    #[tokio::test]
    async fn test_disconnect_completes_closed() {
        let builder = ServerBuilder::new();
        let (local, mut peer) = MemoryTransport::pair();
        let conn = builder.bind(local);
        next_frame(&mut peer).await;

        conn.disconnect();
        tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.request("x", json!(null)).await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_peer_drop_closes_connection() {
        let builder = ServerBuilder::new();
        let (local, peer) = MemoryTransport::pair();
        let conn = builder.bind(local);
        drop(peer);
        tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_closed_connections_leave_accept_queue() {
        let builder = ServerBuilder::new();
        let queue = Arc::new(AcceptQueue::default());
        let mut sessions = Vec::new();
        for _ in 0..8 {
            let (local, peer) = MemoryTransport::pair();
            let conn = builder.bind(local);
            sessions.push(Arc::downgrade(&conn.session));
            queue.push(conn);
            drop(peer);
        }

        wait_until(|| queue.len() == 0).await;
        wait_until(|| sessions.iter().all(|session| session.upgrade().is_none())).await;
    }

    #[tokio::test]
    async fn test_full_accept_queue_drops_oldest_handle() {
        let builder = ServerBuilder::new();
        let queue = Arc::new(AcceptQueue::default());
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..=ACCEPT_QUEUE {
            let (local, peer) = MemoryTransport::pair();
            let conn = builder.bind(local);
            ids.push(conn.connection_id().to_string());
            queue.push(conn);
            peers.push(peer);
        }

        assert_eq!(queue.len(), ACCEPT_QUEUE);
        let first = queue.pop().unwrap();
        assert_eq!(first.connection_id(), ids[1]);
        // The connection behind the dropped handle keeps running.
        assert!(next_frame(&mut peers[0]).await.is_subscribe());
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let server = ServerBuilder::new().listen("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.shutdown();
    }
}
