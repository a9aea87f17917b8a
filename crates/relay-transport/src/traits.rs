//! Transport abstraction traits for Relay.
//!
//! These traits define the interface that all transport implementations must
//! provide, allowing the hub to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{codec, Message, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame arrived that is not a valid message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error concerns a single frame and the connection itself is
    /// still usable.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// Write half of a connection.
///
/// Implementations are not required to support concurrent sends; callers
/// serialize writes per connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Encode and send a message.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let data = codec::encode(message)?;
        self.send_raw(data).await
    }

    /// Send an already encoded message.
    ///
    /// This is used by the hub to encode a broadcast once for all recipients.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A decoded inbound message and the size of the frame that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// The decoded message.
    pub message: Message,
    /// Frame size in bytes.
    pub size: usize,
}

impl Received {
    /// Decode one frame, rejecting frames larger than `max_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or not a valid message.
    pub fn decode(data: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        Ok(Self {
            message: codec::decode_with_limit(data, max_size)?,
            size: data.len(),
        })
    }
}

/// Read half of a connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` if the connection is closed cleanly. A
    /// [`TransportError::Protocol`] error leaves the stream usable.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.recv_frame().await?.map(|received| received.message))
    }

    /// Receive the next message together with its frame size.
    ///
    /// Same semantics as [`MessageStream::recv`].
    async fn recv_frame(&mut self) -> Result<Option<Received>, TransportError>;
}

/// A listener that produces connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Connection, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An accepted connection, before it is handed to the hub.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<String>,
    sink: Box<dyn MessageSink>,
    stream: Box<dyn MessageStream>,
}

impl Connection {
    /// Bundle the two halves of a transport with a fresh connection ID.
    #[must_use]
    pub fn new(sink: Box<dyn MessageSink>, stream: Box<dyn MessageStream>) -> Self {
        Self {
            id: ConnectionId::generate(),
            remote_addr: None,
            sink,
            stream,
        }
    }

    /// Attach the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the remote address of the connection, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Split into ID, write half and read half.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionId, Box<dyn MessageSink>, Box<dyn MessageStream>) {
        (self.id, self.sink, self.stream)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }

    #[test]
    fn test_received_records_frame_size() {
        let frame = br#"{"username":"bob","text":"hey"}"#;
        let received = Received::decode(frame, 1024).unwrap();
        assert_eq!(received.message, Message::chat("bob", "hey"));
        assert_eq!(received.size, frame.len());

        assert!(Received::decode(frame, 8).is_err());
    }

    #[test]
    fn test_protocol_error_is_recoverable() {
        let err: TransportError = relay_protocol::decode(b"nope").unwrap_err().into();
        assert!(err.is_protocol());
        assert!(!TransportError::ConnectionClosed.is_protocol());
    }
}
