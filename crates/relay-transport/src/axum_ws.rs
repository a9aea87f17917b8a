//! Adapter for WebSockets upgraded by axum.

use ::axum::extract::ws::{Message as WsMessage, WebSocket};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::traits::{Connection, MessageSink, MessageStream, Received, TransportError};

/// Wrap an upgraded axum WebSocket as a [`Connection`].
#[must_use]
pub fn into_connection(socket: WebSocket, max_message_size: usize) -> Connection {
    let (sink, stream) = socket.split();
    Connection::new(
        Box::new(AxumSink { inner: sink }),
        Box::new(AxumStream {
            inner: stream,
            max_message_size,
        }),
    )
}

struct AxumSink {
    inner: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl MessageSink for AxumSink {
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

struct AxumStream {
    inner: SplitStream<WebSocket>,
    max_message_size: usize,
}

#[async_trait]
impl MessageStream for AxumStream {
    async fn recv_frame(&mut self) -> Result<Option<Received>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(Received::decode(text.as_bytes(), self.max_message_size)?));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Some(Received::decode(&data, self.max_message_size)?));
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
