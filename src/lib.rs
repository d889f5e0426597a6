//! topicwire - multiplexed publish/subscribe over one WebSocket connection.
//!
//! Both ends of a connection run the same session: either side may announce
//! the event types it wants, push events, and issue or answer requests. The
//! client side reconnects with exponential backoff and re-announces its
//! subscriptions every time it comes back.
//!
//! # Architecture
//!
//! - **Transport** - [`Transport`] trait over WebSocket ([`ws`]) or an
//!   in-memory pair
//! - **Frame** - JSON envelope codec
//! - **Session** - per-connection demultiplexer shared by client and server
//! - **Client** - reconnect loop around a session
//! - **Server** - binds transports, optional TCP accept loop
//! - **Provider** - named, shared event sources served to subscribers
//! - **Keyed map** - observable dictionary usable as an event source
//!
//! # Modules
//!
//! - [`client`] - reconnecting client runtime
//! - [`server`] - server runtime and accept loop
//! - [`provider`] - event sources and providers
//! - [`keyed_map`] - reactive keyed map
//! - [`config`] - configuration loading

pub mod backoff;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod keyed_map;
pub mod provider;
pub mod server;
pub mod subscriptions;
pub mod transport;
pub mod ws;

mod session;

// Re-export commonly used types
pub use backoff::{BackoffPolicy, ConnectionState};
pub use client::{Client, ClientBuilder, ClientOptions};
pub use config::Config;
pub use error::SessionError;
pub use frame::Frame;
pub use keyed_map::{MapChange, MapReader, Merge, ObservableMap};
pub use provider::{EventProvider, EventPublisher, EventSource, EventStream, StatePublisher, StaticEventProvider};
pub use server::{ServerBuilder, ServerConnection, ServerOptions, SocketServer};
pub use session::{ErrorMode, Handler, Responder};
pub use transport::{Connector, MemoryAcceptor, MemoryConnector, MemoryTransport, Transport, TransportEvent};
pub use ws::WsConnector;
