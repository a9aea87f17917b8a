//! In-memory transport.
//!
//! Connections are backed by unbounded tokio channels. The server side is a
//! regular [`Connection`]; the other end is a [`MemoryClient`] that can send
//! frames, read what the server wrote, and simulate abrupt failures.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{codec, Message};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::traits::{
    Connection, MessageSink, MessageStream, Received, Transport, TransportError,
};

/// Default inbound frame limit for in-memory connections.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// What the client pushed towards the server.
enum Inbound {
    Frame(Bytes),
    Fail(String),
}

/// Create a connected pair: the server-side connection and its client.
#[must_use]
pub fn pair() -> (Connection, MemoryClient) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let connection = Connection::new(
        Box::new(MemorySink { tx: Some(out_tx) }),
        Box::new(MemoryStream {
            rx: in_rx,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }),
    )
    .with_remote_addr("memory");

    let client = MemoryClient {
        tx: Some(in_tx),
        rx: out_rx,
    };

    (connection, client)
}

/// Server-side write half.
struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

/// Server-side read half.
struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Inbound>,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn recv_frame(&mut self) -> Result<Option<Received>, TransportError> {
        match self.rx.recv().await {
            Some(Inbound::Frame(data)) => Ok(Some(Received::decode(&data, self.max_message_size)?)),
            Some(Inbound::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// Client end of an in-memory connection.
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryClient {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the server stopped reading.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let data = codec::encode(message)?;
        self.send_raw(data)
    }

    /// Send a raw frame to the server, valid or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the server stopped reading.
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.push(Inbound::Frame(data.into()))
    }

    /// Make the server's next read fail, as an abrupt disconnect would.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the server stopped reading.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.push(Inbound::Fail(reason.into()))
    }

    /// Close the client's write direction; the server reads a clean close.
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Receive the next message written by the server.
    ///
    /// Returns `None` once the server closed its write half and everything
    /// buffered has been read.
    pub async fn recv(&mut self) -> Option<Message> {
        let data = self.rx.recv().await?;
        codec::decode(&data).ok()
    }

    /// Receive a message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Message> {
        let data = self.rx.try_recv().ok()?;
        codec::decode(&data).ok()
    }

    fn push(&self, inbound: Inbound) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(inbound).map_err(|_| TransportError::ConnectionClosed)
    }
}

/// A listener whose connections are created by [`MemoryConnector::connect`].
pub struct MemoryTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<Connection>>,
}

/// Handle used to open connections to a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Connection>,
}

impl MemoryTransport {
    /// Create a transport and its connector.
    #[must_use]
    pub fn new() -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                incoming: Mutex::new(rx),
            },
            MemoryConnector { tx },
        )
    }
}

impl MemoryConnector {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport was dropped.
    pub fn connect(&self) -> Result<MemoryClient, TransportError> {
        let (connection, client) = pair();
        debug!(connection = %connection.id(), "In-memory connection opened");
        self.tx
            .send(connection)
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(client)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchange() {
        let (connection, mut client) = pair();
        let (_id, mut sink, mut stream) = connection.into_parts();

        client.send(&Message::chat("alice", "ping")).unwrap();
        let received = stream.recv().await.unwrap();
        assert_eq!(received, Some(Message::chat("alice", "ping")));

        sink.send(&Message::chat("bob", "pong")).await.unwrap();
        assert_eq!(client.recv().await, Some(Message::chat("bob", "pong")));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_stream() {
        let (connection, client) = pair();
        let (_id, _sink, mut stream) = connection.into_parts();

        client.send_raw(&b"{garbage"[..]).unwrap();
        client.send(&Message::chat("alice", "ok")).unwrap();

        let err = stream.recv().await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(
            stream.recv().await.unwrap(),
            Some(Message::chat("alice", "ok"))
        );
    }

    #[tokio::test]
    async fn test_close_and_fail() {
        let (connection, mut client) = pair();
        let (_id, _sink, mut stream) = connection.into_parts();

        client.fail("reset by peer").unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));

        client.close();
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_client_dropped() {
        let (connection, client) = pair();
        let (_id, mut sink, _stream) = connection.into_parts();

        drop(client);
        assert!(matches!(
            sink.send(&Message::chat("a", "b")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_transport_accept() {
        let (transport, connector) = MemoryTransport::new();
        let _client = connector.connect().unwrap();

        let connection = transport.accept().await.unwrap();
        assert_eq!(connection.remote_addr(), Some("memory"));
        assert_eq!(transport.name(), "memory");
    }
}
