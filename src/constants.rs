//! Protocol-wide constants for topicwire.
//!
//! Centralizes the defaults for timing, backoff and buffering so the
//! client, server and configuration layers agree on them.
//!
//! # Categories
//!
//! - **Keep-alive**: server ping cadence
//! - **Backoff**: reconnection delay policy
//! - **Buffers**: bounded queue capacities

use std::time::Duration;

// ============================================================================
// Keep-alive
// ============================================================================

/// Interval between transport-level pings sent by the server.
///
/// Keeps idle connections alive through proxies and lets the server notice
/// dead peers. Clients answer at the transport level only.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Backoff
// ============================================================================

/// Base of the exponential reconnection backoff.
pub const DEFAULT_RETRY_BASE: f64 = 1.1;

/// Upper bound for a single reconnection delay.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(60);

/// Unit multiplied by `base^(attempt-1)` to produce a delay.
pub const RETRY_UNIT: Duration = Duration::from_secs(1);

// ============================================================================
// Buffers
// ============================================================================

/// Connections a [`SocketServer`](crate::server::SocketServer) holds for
/// `accept()`; further connections still run but are not handed out.
pub const ACCEPT_QUEUE: usize = 64;

/// Capacity of keyed-map change notifications.
pub const MAP_CHANGE_BUFFER: usize = 256;

// ============================================================================
// Wire
// ============================================================================

/// Event type of the subscription announcement frame.
pub const SUBSCRIBE_EVENT: &str = "subscribe";

/// Event type of strict-mode error reports.
pub const ERROR_EVENT: &str = "error";

/// Default address for `topicwire serve`.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";
