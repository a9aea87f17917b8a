//! # relay-transport
//!
//! Connection abstraction layer for the Relay chat hub.
//!
//! A [`Connection`] is split into two halves so that reading and writing
//! never contend with each other:
//!
//! - [`MessageStream`] - read half, owned by the connection's session loop
//! - [`MessageSink`] - write half, owned by the client registry and driven
//!   by the hub's delivery worker
//!
//! Implementations:
//!
//! - **axum** - Upgraded `axum` WebSocket (used by the server binary)
//! - **websocket** - Standalone `tokio-tungstenite` listener
//! - **memory** - In-process channel pair, for tests and embedding
//!
//! ```rust,ignore
//! use relay_transport::{Connection, MessageStream};
//!
//! async fn handle_connection(conn: Connection) {
//!     let (_id, _sink, mut stream) = conn.into_parts();
//!     while let Ok(Some(message)) = stream.recv().await {
//!         // Process message
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod axum_ws;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    Connection, ConnectionId, MessageSink, MessageStream, Received, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
