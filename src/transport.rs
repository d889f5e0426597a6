//! Transport capability shim.
//!
//! The protocol runtimes only ever talk to a [`Transport`]: send a text
//! frame, send a ping/pong, receive the next [`TransportEvent`], close.
//! Concrete implementations live in [`crate::ws`] (WebSocket, client-initiated
//! or server-accepted) and in this module ([`MemoryTransport`], an in-process
//! duplex pair).
//!
//! A [`Connector`] produces a fresh transport for each connection attempt and
//! is what the reconnecting client is built on.
//!
//! No retry or framing logic lives here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// Transport or protocol error. The connection is unusable afterwards.
    Error(String),
}

/// An open, bidirectional message connection.
///
/// A value of this type only exists once the connection is open, so there is
/// no separate "open" event. `recv` must be cancellation safe: runtimes race
/// it against timers and outbound queues in `tokio::select!`.
#[async_trait]
pub trait Transport: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send a keep-alive ping.
    async fn send_ping(&mut self, data: Vec<u8>) -> Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Receive the next event, `None` once the connection is gone.
    async fn recv(&mut self) -> Option<TransportEvent>;

    /// Initiate a graceful close.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for transports, called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

// =============================================================================
// In-memory transport
// =============================================================================

/// One end of an in-process duplex connection.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    closed: bool,
}

impl MemoryTransport {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: b_rx,
                closed: false,
            },
            Self {
                tx: b_tx,
                rx: a_rx,
                closed: false,
            },
        )
    }

    /// Inject an arbitrary event towards the peer (tests use this to send
    /// malformed text or errors).
    pub fn inject(&self, event: TransportEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| anyhow!("peer transport dropped"))
    }

    fn push(&self, event: TransportEvent) -> Result<()> {
        if self.closed {
            anyhow::bail!("transport closed");
        }
        self.inject(event)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.push(TransportEvent::Text(text.to_string()))
    }

    async fn send_ping(&mut self, data: Vec<u8>) -> Result<()> {
        self.push(TransportEvent::Ping(data))
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.push(TransportEvent::Pong(data))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // Peer may already be gone; closing is still successful locally.
        let _ = self.tx.send(TransportEvent::Close {
            code: 1000,
            reason: String::new(),
        });
        self.closed = true;
        Ok(())
    }
}

/// Connector that hands the far end of every new [`MemoryTransport`] pair to
/// a [`MemoryAcceptor`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryTransport>,
    fail_next: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

/// Receiving side of a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryTransport>,
    fail_next: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector and its acceptor.
    #[must_use]
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let fail_next = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accept_tx,
                fail_next: Arc::clone(&fail_next),
                attempts: Arc::clone(&attempts),
            },
            MemoryAcceptor {
                accept_rx,
                fail_next,
                attempts,
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("connection refused");
        }
        let (local, remote) = MemoryTransport::pair();
        self.accept_tx
            .send(remote)
            .map_err(|_| anyhow!("acceptor dropped"))?;
        Ok(Box::new(local))
    }
}

impl MemoryAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryTransport> {
        self.accept_rx.recv().await
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send_text("hello").await.unwrap();
        b.send_ping(vec![1]).await.unwrap();
        assert_eq!(b.recv().await, Some(TransportEvent::Text("hello".into())));
        assert_eq!(a.recv().await, Some(TransportEvent::Ping(vec![1])));
    }

    #[tokio::test]
    async fn test_close_notifies_peer_and_ends_local_stream() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.close().await.unwrap();
        assert!(matches!(b.recv().await, Some(TransportEvent::Close { code: 1000, .. })));
        assert!(a.recv().await.is_none());
        assert!(a.send_text("late").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_ends_peer_stream() {
        let (a, mut b) = MemoryTransport::pair();
        drop(a);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connector_refuses_then_accepts() {
        let (connector, mut acceptor) = MemoryConnector::new();
        acceptor.fail_next(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        let mut local = connector.connect().await.unwrap();
        let mut remote = acceptor.accept().await.unwrap();
        local.send_text("hi").await.unwrap();
        assert_eq!(remote.recv().await, Some(TransportEvent::Text("hi".into())));
        assert_eq!(acceptor.attempts(), 3);
    }
}
