//! Upstream Provider Adapters
//!
//! Everything that talks to the market-data provider:
//!
//! - **Streaming**: one authenticated WebSocket, shared by every consumer
//!   (`connection`, `transport`, `codec`, `router`, `keepalive`, `reconnect`)
//! - **REST**: reference-data endpoints (`rest`)

pub mod codec;
pub mod connection;
pub mod keepalive;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod router;
pub mod transport;

pub use codec::{CodecError, JsonCodec, UpstreamEvent};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus,
};
pub use messages::{Action, ClientRequest, StatusKind, StatusMessage};
pub use reconnect::{ReconnectConfig, ReconnectScheduler};
pub use rest::{DEFAULT_REST_TIMEOUT, DEFAULT_REST_URL, RestClient};
pub use router::{MessageRouter, RouteOutcome};
pub use transport::{DEFAULT_STREAM_URL, WebSocketConnector};
