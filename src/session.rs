//! Protocol session shared by the client and server runtimes.
//!
//! A [`Session`] owns everything that must survive a single transport
//! connection: the subscription registry, pending requests, registered
//! handlers, the outbound queue and the id counter. [`Session::run_connection`]
//! drives one live transport until it closes.
//!
//! # Connection loop
//!
//! ```text
//!              ┌──────────────── run_connection ────────────────┐
//! transport ──►│ decode ─► response?  ─► resolve pending request │
//!              │        ─► subscribe? ─► bind/release forwarders │──► transport
//!              │        ─► event      ─► handler + receive()     │
//!              │ outbound queue, forwarder pushes, ping tick     │
//!              └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything for one connection runs on one task inside a `tokio::select!`,
//! so inbound frames are handled in arrival order and outbound frames leave
//! in issuance order. Forwarders are the only spawned tasks; they are owned
//! by the connection and aborted when it ends.
//!
//! Every `receive()` and `receive_requests()` stream has its own unbounded
//! queue, so a stream that is not being polled never loses frames. A request
//! reaches exactly one consumer: its handler if one is registered, otherwise
//! the oldest live `receive_requests()` stream for its type.

// Rust guideline compliant 2026-02

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::SUBSCRIBE_EVENT;
use crate::error::SessionError;
use crate::frame::{self, Frame};
use crate::provider::{EventProvider, EventSource, EventStream};
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{Transport, TransportEvent};

/// How to treat malformed frames and unknown subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Drop and log; the peer is never told.
    #[default]
    Lenient,
    /// Log and answer with an `error` frame.
    Strict,
}

/// Callback for inbound frames of one type.
///
/// Receives the payload and, for request frames, a [`Responder`].
pub type Handler = Arc<dyn Fn(Value, Option<Responder>) + Send + Sync>;

/// Reply channel for one inbound request.
#[derive(Debug)]
pub struct Responder {
    request_id: i64,
    ids: Arc<AtomicI64>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Responder {
    /// Id of the request being answered.
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Send the response. Returns `false` if the session is gone.
    pub fn reply(self, data: Value) -> bool {
        let frame = Frame::Response {
            request_id: self.request_id,
            data,
            id: self.ids.fetch_add(1, Ordering::Relaxed),
        };
        self.outbound.send(frame).is_ok()
    }
}

/// Static configuration of a session.
#[derive(Clone, Default)]
pub(crate) struct SessionConfig {
    /// Transport ping cadence; `None` disables keep-alive pings.
    pub ping_interval: Option<Duration>,
    pub error_mode: ErrorMode,
    pub provider: Option<Arc<dyn EventProvider>>,
    /// Forwarded on every connection regardless of subscriptions.
    pub static_streams: Vec<(String, EventSource)>,
    pub handlers: HashMap<String, Handler>,
}

/// Why [`Session::run_connection`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionExit {
    /// Cancellation was requested.
    Shutdown,
    /// The transport closed or failed.
    Disconnected,
}

/// Protocol state that outlives individual connections.
pub(crate) struct Session {
    label: String,
    ping_interval: Option<Duration>,
    error_mode: ErrorMode,
    provider: Option<Arc<dyn EventProvider>>,
    static_streams: Vec<(String, EventSource)>,
    handlers: RwLock<HashMap<String, Handler>>,
    registry: SubscriptionRegistry,
    listeners: Arc<Mutex<Listeners>>,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    ids: Arc<AtomicI64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.label)
            .field("error_mode", &self.error_mode)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(label: impl Into<String>, config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            label: label.into(),
            ping_interval: config.ping_interval,
            error_mode: config.error_mode,
            provider: config.provider,
            static_streams: config.static_streams,
            handlers: RwLock::new(config.handlers),
            registry: SubscriptionRegistry::new(),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            outbound,
            pending: Mutex::new(HashMap::new()),
            ids: Arc::new(AtomicI64::new(1)),
        };
        (session, outbound_rx)
    }

    /// Log prefix, e.g. `client` or `server:1f3a`.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn next_id(&self) -> i64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn responder(&self, request_id: i64) -> Responder {
        Responder {
            request_id,
            ids: Arc::clone(&self.ids),
            outbound: self.outbound.clone(),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_guard(&self, event_type: &str, key: u64) -> ListenerGuard {
        ListenerGuard {
            listeners: Arc::downgrade(&self.listeners),
            event_type: event_type.to_string(),
            key,
        }
    }

    /// Queue a fire-and-forget event.
    pub fn send(&self, event_type: &str, data: Value) {
        let frame = Frame::Event {
            event_type: event_type.to_string(),
            data,
            id: self.next_id(),
        };
        // The receiver lives as long as the session's driver.
        let _ = self.outbound.send(frame);
    }

    /// Queue a request and wait for its response. No timeout.
    pub async fn request(&self, event_type: &str, data: Value) -> Result<Value, SessionError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        // Removes the entry if the caller stops waiting.
        let _pending = PendingGuard { session: self, id };

        let frame = Frame::Request {
            event_type: event_type.to_string(),
            data,
            id,
        };
        if self.outbound.send(frame).is_err() {
            return Err(SessionError::Closed);
        }
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// [`Self::request`] bounded by `timeout`.
    pub async fn request_timeout(
        &self,
        event_type: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        tokio::time::timeout(timeout, self.request(event_type, data))
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    /// Fail every outstanding request with [`SessionError::Closed`].
    pub fn fail_pending(&self) {
        let pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !pending.is_empty() {
            log::debug!("[Session] {}: failing {} pending requests", self.label, pending.len());
        }
    }

    fn forget_request(&self, id: i64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Payloads of inbound frames of `event_type`.
    ///
    /// Holds a subscription for `event_type` until the stream is dropped.
    /// Frames queue without bound until the stream is polled.
    pub fn receive(&self, event_type: &str) -> EventStream {
        let subscription = self.registry.subscribe(event_type);
        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.listeners().add_event(event_type, tx);
        let listener = self.listener_guard(event_type, key);
        stream::unfold((rx, subscription, listener), |(mut rx, subscription, listener)| async move {
            let data = rx.recv().await?;
            Some((data, (rx, subscription, listener)))
        })
        .boxed()
    }

    /// Inbound requests of `event_type`, each with its [`Responder`].
    ///
    /// Requests are point-to-point, so this does not announce a subscription.
    /// A registered handler for `event_type` takes precedence; with several
    /// streams, the oldest live one gets each request.
    pub fn receive_requests(&self, event_type: &str) -> BoxStream<'static, (Value, Responder)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.listeners().add_requests(event_type, tx);
        let listener = self.listener_guard(event_type, key);
        stream::unfold((rx, listener), |(mut rx, listener)| async move {
            let request = rx.recv().await?;
            Some((request, (rx, listener)))
        })
        .boxed()
    }

    /// Register (or replace) the handler for `event_type`.
    ///
    /// Requests of that type then bypass `receive_requests()` streams.
    pub fn handle(&self, event_type: &str, handler: Handler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_string(), handler);
    }

    /// Event types this side currently wants from the peer.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.registry.active()
    }

    /// Drive one live transport until it closes or `cancel` fires.
    ///
    /// Announces the full subscription set first, then multiplexes inbound
    /// frames, queued outbound frames, forwarder pushes and pings.
    pub async fn run_connection(
        &self,
        transport: &mut dyn Transport,
        outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
        cancel: &CancellationToken,
    ) -> ConnectionExit {
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let mut forwarders = Forwarders::new(push_tx.clone(), Arc::clone(&self.ids));
        let mut statics = Forwarders::new(push_tx.clone(), Arc::clone(&self.ids));
        for (name, source) in &self.static_streams {
            statics.bind(name, source);
        }

        let mut subscriptions = self.registry.changes();
        let announce = Frame::subscribe(self.next_id(), subscriptions.borrow_and_update().iter().cloned());
        if !self.write(transport, &announce).await {
            return ConnectionExit::Disconnected;
        }

        let mut ping = self.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    log::info!("[Session] {}: shutdown requested, closing connection", self.label);
                    let _ = transport.close().await;
                    return ConnectionExit::Shutdown;
                }

                event = transport.recv() => {
                    match event {
                        Some(TransportEvent::Text(text)) => {
                            self.handle_text(&text, &mut forwarders, &push_tx);
                        }
                        Some(TransportEvent::Ping(data)) => {
                            if let Err(e) = transport.send_pong(data).await {
                                log::warn!("[Session] {}: failed to answer ping: {}", self.label, e);
                                return ConnectionExit::Disconnected;
                            }
                        }
                        Some(TransportEvent::Pong(_)) => {}
                        Some(TransportEvent::Binary(data)) => {
                            log::debug!("[Session] {}: ignoring {} byte binary frame", self.label, data.len());
                        }
                        Some(TransportEvent::Close { code, reason }) => {
                            log::info!("[Session] {}: connection closed by peer ({} {})", self.label, code, reason);
                            return ConnectionExit::Disconnected;
                        }
                        Some(TransportEvent::Error(e)) => {
                            log::warn!("[Session] {}: transport error: {}", self.label, e);
                            return ConnectionExit::Disconnected;
                        }
                        None => {
                            log::info!("[Session] {}: transport ended", self.label);
                            return ConnectionExit::Disconnected;
                        }
                    }
                }

                Ok(()) = subscriptions.changed() => {
                    let names: Vec<String> = subscriptions.borrow_and_update().iter().cloned().collect();
                    let frame = Frame::subscribe(self.next_id(), names);
                    if !self.write(transport, &frame).await {
                        return ConnectionExit::Disconnected;
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    if !self.write(transport, &frame).await {
                        return ConnectionExit::Disconnected;
                    }
                }

                Some(frame) = push_rx.recv() => {
                    if !self.write(transport, &frame).await {
                        return ConnectionExit::Disconnected;
                    }
                }

                () = next_ping(&mut ping) => {
                    if let Err(e) = transport.send_ping(Vec::new()).await {
                        log::warn!("[Session] {}: ping failed: {}", self.label, e);
                        return ConnectionExit::Disconnected;
                    }
                    log::trace!("[Session] {}: ping", self.label);
                }
            }
        }
    }

    /// Encode and send one frame. Returns `false` if the transport failed.
    async fn write(&self, transport: &mut dyn Transport, frame: &Frame) -> bool {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("[Session] {}: dropping unencodable frame: {}", self.label, e);
                return true;
            }
        };
        match transport.send_text(&text).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Session] {}: send failed: {}", self.label, e);
                false
            }
        }
    }

    fn handle_text(
        &self,
        text: &str,
        forwarders: &mut Forwarders,
        push_tx: &mpsc::UnboundedSender<Frame>,
    ) {
        let frame = match frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                match self.error_mode {
                    ErrorMode::Lenient => {
                        log::debug!("[Session] {}: dropping malformed frame: {}", self.label, e);
                    }
                    ErrorMode::Strict => {
                        log::warn!(
                            "[Session] {}: malformed frame: {} ({})",
                            self.label,
                            e,
                            text.chars().take(100).collect::<String>()
                        );
                        let _ = push_tx.send(Frame::error(self.next_id(), "malformed_frame", &e.to_string(), None));
                    }
                }
                return;
            }
        };

        match frame {
            Frame::Response { request_id, data, .. } => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                match waiter {
                    Some(tx) => {
                        // Requester may have given up; that is fine.
                        let _ = tx.send(data);
                    }
                    None => log::debug!(
                        "[Session] {}: response for unknown request {}",
                        self.label,
                        request_id
                    ),
                }
            }
            Frame::Event { ref event_type, ref data, .. } if event_type == SUBSCRIBE_EVENT => {
                self.apply_subscribe(data, forwarders, push_tx);
            }
            Frame::Event { .. } | Frame::Request { .. } => self.dispatch(frame),
        }
    }

    /// Hand an event or request to `receive()` streams and one consumer.
    fn dispatch(&self, frame: Frame) {
        let (event_type, data, request_id) = match frame {
            Frame::Event { event_type, data, .. } => (event_type, data, None),
            Frame::Request { event_type, data, id } => (event_type, data, Some(id)),
            Frame::Response { .. } => return,
        };
        self.listeners().deliver_event(&event_type, &data);

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned();

        match (request_id, handler) {
            (Some(id), Some(handler)) => handler(data, Some(self.responder(id))),
            (None, Some(handler)) => handler(data, None),
            (Some(id), None) => {
                let request = (data, self.responder(id));
                if !self.listeners().offer_request(&event_type, request) {
                    log::debug!(
                        "[Session] {}: nobody handles request '{}' ({})",
                        self.label,
                        event_type,
                        id
                    );
                }
            }
            (None, None) => {
                log::trace!("[Session] {}: no handler for '{}'", self.label, event_type);
            }
        }
    }

    /// Reconcile forwarders with the peer's complete wanted set.
    fn apply_subscribe(
        &self,
        data: &Value,
        forwarders: &mut Forwarders,
        push_tx: &mpsc::UnboundedSender<Frame>,
    ) {
        let Some(wanted) = parse_subscribe_set(data) else {
            match self.error_mode {
                ErrorMode::Lenient => {
                    log::debug!("[Session] {}: ignoring subscribe with non-string-array data", self.label);
                }
                ErrorMode::Strict => {
                    log::warn!("[Session] {}: subscribe data is not a string array", self.label);
                    let _ = push_tx.send(Frame::error(
                        self.next_id(),
                        "malformed_frame",
                        "subscribe data must be an array of strings",
                        None,
                    ));
                }
            }
            return;
        };

        for name in forwarders.names() {
            if !wanted.contains(&name) {
                log::debug!("[Session] {}: peer no longer wants '{}'", self.label, name);
                forwarders.release(&name);
            }
        }

        for name in &wanted {
            if forwarders.is_bound(name) {
                continue;
            }
            let source = self
                .provider
                .as_ref()
                .filter(|provider| provider.has_event(name))
                .and_then(|provider| provider.observe(name));
            match source {
                Some(source) => {
                    log::debug!("[Session] {}: forwarding '{}'", self.label, name);
                    forwarders.bind(name, &source);
                }
                None => self.reject_unknown(name, push_tx),
            }
        }
    }

    fn reject_unknown(&self, name: &str, push_tx: &mpsc::UnboundedSender<Frame>) {
        if self.provider.is_none() {
            log::warn!(
                "[Session] {}: event '{}' was subscribed to but there is no event provider",
                self.label,
                name
            );
        } else {
            log::warn!("[Session] {}: event '{}' does not exist", self.label, name);
        }
        if self.error_mode == ErrorMode::Strict {
            let _ = push_tx.send(Frame::error(
                self.next_id(),
                "unknown_event",
                &format!("event '{name}' does not exist"),
                Some(name),
            ));
        }
    }
}

/// Local consumers of inbound frames, one unbounded queue each.
#[derive(Default)]
struct Listeners {
    next_key: u64,
    events: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>,
    requests: HashMap<String, Vec<(u64, mpsc::UnboundedSender<(Value, Responder)>)>>,
}

impl Listeners {
    fn add_event(&mut self, event_type: &str, tx: mpsc::UnboundedSender<Value>) -> u64 {
        self.next_key += 1;
        self.events
            .entry(event_type.to_string())
            .or_default()
            .push((self.next_key, tx));
        self.next_key
    }

    fn add_requests(&mut self, event_type: &str, tx: mpsc::UnboundedSender<(Value, Responder)>) -> u64 {
        self.next_key += 1;
        self.requests
            .entry(event_type.to_string())
            .or_default()
            .push((self.next_key, tx));
        self.next_key
    }

    fn deliver_event(&mut self, event_type: &str, data: &Value) {
        if let Some(queues) = self.events.get_mut(event_type) {
            queues.retain(|(_, tx)| tx.send(data.clone()).is_ok());
        }
    }

    /// Give a request to the oldest live stream. `false` if none took it.
    fn offer_request(&mut self, event_type: &str, mut request: (Value, Responder)) -> bool {
        let Some(queues) = self.requests.get_mut(event_type) else {
            return false;
        };
        while let Some((_, tx)) = queues.first() {
            match tx.send(request) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(unsent)) => {
                    request = unsent;
                    queues.remove(0);
                }
            }
        }
        false
    }

    fn remove(&mut self, event_type: &str, key: u64) {
        if let Some(queues) = self.events.get_mut(event_type) {
            queues.retain(|(k, _)| *k != key);
            if queues.is_empty() {
                self.events.remove(event_type);
            }
        }
        if let Some(queues) = self.requests.get_mut(event_type) {
            queues.retain(|(k, _)| *k != key);
            if queues.is_empty() {
                self.requests.remove(event_type);
            }
        }
    }
}

/// Unregisters a stream's queue when the stream is dropped.
struct ListenerGuard {
    listeners: Weak<Mutex<Listeners>>,
    event_type: String,
    key: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.event_type, self.key);
        }
    }
}

struct PendingGuard<'a> {
    session: &'a Session,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.forget_request(self.id);
    }
}

/// Names from a `subscribe` payload, `None` unless it is an array of strings.
fn parse_subscribe_set(data: &Value) -> Option<BTreeSet<String>> {
    data.as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .filter(|name| name.as_deref() != Some(SUBSCRIBE_EVENT))
        .collect()
}

async fn next_ping(ping: &mut Option<tokio::time::Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Per-connection forwarding tasks, aborted on drop.
struct Forwarders {
    tasks: HashMap<String, JoinHandle<()>>,
    push_tx: mpsc::UnboundedSender<Frame>,
    ids: Arc<AtomicI64>,
}

impl Forwarders {
    fn new(push_tx: mpsc::UnboundedSender<Frame>, ids: Arc<AtomicI64>) -> Self {
        Self {
            tasks: HashMap::new(),
            push_tx,
            ids,
        }
    }

    fn bind(&mut self, name: &str, source: &EventSource) {
        // Subscribe before spawning so shared upstreams attach synchronously.
        let mut values = source.subscribe();
        let push_tx = self.push_tx.clone();
        let ids = Arc::clone(&self.ids);
        let event_type = name.to_string();
        let task = tokio::spawn(async move {
            while let Some(data) = values.next().await {
                let frame = Frame::Event {
                    event_type: event_type.clone(),
                    data,
                    id: ids.fetch_add(1, Ordering::Relaxed),
                };
                if push_tx.send(frame).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.tasks.insert(name.to_string(), task) {
            previous.abort();
        }
    }

    fn release(&mut self, name: &str) {
        if let Some(task) = self.tasks.remove(name) {
            task.abort();
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticEventProvider;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(2);

    async fn recv_frame(peer: &mut MemoryTransport) -> Frame {
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

    fn start(config: SessionConfig) -> (Arc<Session>, MemoryTransport, CancellationToken) {
        let (session, mut outbound_rx) = Session::new("test", config);
        let session = Arc::new(session);
        let (mut local, peer) = MemoryTransport::pair();
        let cancel = CancellationToken::new();
        let driver = Arc::clone(&session);
        let token = cancel.clone();
        tokio::spawn(async move {
            driver.run_connection(&mut local, &mut outbound_rx, &token).await;
        });
        (session, peer, cancel)
    }

    #[test]
    fn test_parse_subscribe_set() {
        assert_eq!(
            parse_subscribe_set(&json!(["a", "b", "subscribe"])),
            Some(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
        assert_eq!(parse_subscribe_set(&json!(["a", 1])), None);
        assert_eq!(parse_subscribe_set(&json!("a")), None);
    }

    #[tokio::test]
    async fn test_first_frame_announces_empty_set() {
        let (_session, mut peer, _cancel) = start(SessionConfig::default());
        let frame = recv_frame(&mut peer).await;
        assert!(frame.is_subscribe());
        assert_eq!(frame.data(), &json!([]));
    }

    #[tokio::test]
    async fn test_handler_receives_request_and_replies() {
        let mut config = SessionConfig::default();
        let handler: Handler = Arc::new(|data, responder| {
            if let Some(responder) = responder {
                let n = data.as_i64().unwrap_or(0);
                responder.reply(json!(n * 2));
            }
        });
        config.handlers.insert("double".into(), handler);
        let (_session, mut peer, _cancel) = start(config);
        recv_frame(&mut peer).await;

        peer.send_text(r#"{"type":"double","data":21,"id":7,"kind":"request"}"#)
            .await
            .unwrap();
        let reply = recv_frame(&mut peer).await;
        assert!(matches!(reply, Frame::Response { request_id: 7, .. }));
        assert_eq!(reply.data(), &json!(42));
    }

    #[tokio::test]
    async fn test_unpolled_receive_stream_keeps_every_frame() {
        let (session, mut peer, _cancel) = start(SessionConfig::default());
        recv_frame(&mut peer).await;
        let mut stream = session.receive("x");

        for n in 0..3000 {
            let text = format!(r#"{{"type":"x","data":{n},"id":{},"kind":"event"}}"#, n + 1);
            peer.send_text(&text).await.unwrap();
        }
        for n in 0..3000 {
            let data = tokio::time::timeout(WAIT, stream.next()).await.unwrap();
            assert_eq!(data, Some(json!(n)));
        }
    }

    #[tokio::test]
    async fn test_request_with_handler_skips_request_streams() {
        let mut config = SessionConfig::default();
        let handler: Handler = Arc::new(|data, responder| {
            if let Some(responder) = responder {
                responder.reply(data);
            }
        });
        config.handlers.insert("echo".into(), handler);
        let (session, mut peer, _cancel) = start(config);
        let mut requests = session.receive_requests("echo");
        recv_frame(&mut peer).await;

        peer.send_text(r#"{"type":"echo","data":"hi","id":4,"kind":"request"}"#)
            .await
            .unwrap();
        let reply = recv_frame(&mut peer).await;
        assert!(matches!(reply, Frame::Response { request_id: 4, .. }));

        let quiet = Duration::from_millis(100);
        assert!(tokio::time::timeout(quiet, requests.next()).await.is_err());
        assert!(tokio::time::timeout(quiet, peer.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_request_goes_to_oldest_live_stream() {
        let (session, mut peer, _cancel) = start(SessionConfig::default());
        let dropped = session.receive_requests("job");
        let mut first = session.receive_requests("job");
        let mut second = session.receive_requests("job");
        drop(dropped);
        recv_frame(&mut peer).await;

        peer.send_text(r#"{"type":"job","data":1,"id":9,"kind":"request"}"#)
            .await
            .unwrap();
        let (data, responder) = tokio::time::timeout(WAIT, first.next()).await.unwrap().unwrap();
        assert_eq!(data, json!(1));
        assert_eq!(responder.request_id(), 9);
        assert!(tokio::time::timeout(Duration::from_millis(100), second.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_receive_stream_ends_with_session() {
        let (session, _outbound_rx) = Session::new("orphan", SessionConfig::default());
        let mut stream = session.receive("x");
        drop(session);
        assert_eq!(tokio::time::timeout(WAIT, stream.next()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_strict_mode_reports_malformed_frame() {
        let config = SessionConfig {
            error_mode: ErrorMode::Strict,
            ..SessionConfig::default()
        };
        let (_session, mut peer, _cancel) = start(config);
        recv_frame(&mut peer).await;

        peer.send_text("{not json").await.unwrap();
        let frame = recv_frame(&mut peer).await;
        assert_eq!(frame.event_type(), Some("error"));
        assert_eq!(frame.data()["code"], "malformed_frame");
    }

    #[tokio::test]
    async fn test_lenient_mode_drops_malformed_frame() {
        let (_publisher, source) = EventSource::state(json!("ready"));
        let config = SessionConfig {
            provider: Some(Arc::new(StaticEventProvider::new().with("status", source))),
            ..SessionConfig::default()
        };
        let (_session, mut peer, _cancel) = start(config);
        recv_frame(&mut peer).await;

        peer.send_text("{not json").await.unwrap();
        peer.send_text(r#"{"type":"subscribe","data":["status"],"id":1}"#)
            .await
            .unwrap();
        // The next frame is the forwarded state, not an error report.
        let frame = recv_frame(&mut peer).await;
        assert_eq!(frame.event_type(), Some("status"));
        assert_eq!(frame.data(), &json!("ready"));
    }

    #[tokio::test]
    async fn test_cancel_closes_transport() {
        let (_session, mut peer, cancel) = start(SessionConfig::default());
        recv_frame(&mut peer).await;
        cancel.cancel();
        let event = tokio::time::timeout(WAIT, peer.recv()).await.unwrap();
        assert!(matches!(event, Some(TransportEvent::Close { .. })));
    }

    #[tokio::test]
    async fn test_fail_pending_resolves_waiters() {
        let (session, _outbound_rx) = Session::new("orphan", SessionConfig::default());
        let session = Arc::new(session);
        let requester = Arc::clone(&session);
        let call = tokio::spawn(async move { requester.request("ping", json!(1)).await });
        tokio::task::yield_now().await;
        session.fail_pending();
        let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
        assert_eq!(result, Err(SessionError::Closed));
    }
}
