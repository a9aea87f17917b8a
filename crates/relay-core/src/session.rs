//! Per-connection session handling.
//!
//! A session owns the read half of one connection. It classifies every
//! inbound message, updates the connection's identity in the registry and
//! publishes the resulting broadcasts. When the transport ends it removes the
//! connection and announces the departure.

use crate::hub::{Hub, HubError};
use crate::registry::{ClientRegistry, Identity, SharedSink};
use relay_protocol::Message;
use relay_transport::{ConnectionId, MessageStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// End the session on a malformed frame instead of skipping it.
    pub close_on_malformed: bool,
    /// Upper bound on closing the connection's sink.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_on_malformed: false,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, no name announced yet.
    Connected,
    /// A non-empty name has been set.
    Identified,
    /// Removed from the registry. Terminal.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    Disconnected,
    /// Reading from the transport failed.
    Transport(String),
    /// A malformed frame arrived and `close_on_malformed` is set.
    Malformed(String),
    /// The hub stopped accepting messages.
    HubClosed,
}

/// The read loop of one connection.
pub struct Session {
    id: ConnectionId,
    stream: Box<dyn MessageStream>,
    sink: SharedSink,
    registry: Arc<ClientRegistry>,
    hub: Hub,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    /// Create a session for a connection that is already registered.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        stream: Box<dyn MessageStream>,
        sink: SharedSink,
        registry: Arc<ClientRegistry>,
        hub: Hub,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            stream,
            sink,
            registry,
            hub,
            config,
            state: SessionState::Connected,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read until the connection ends, then clean up.
    pub async fn run(mut self) -> CloseReason {
        debug!(connection = %self.id, "Session started");

        let reason = loop {
            match self.stream.recv().await {
                Ok(Some(message)) => {
                    if self.handle(message).await.is_err() {
                        break CloseReason::HubClosed;
                    }
                }
                Ok(None) => break CloseReason::Disconnected,
                Err(e) if e.is_protocol() => {
                    warn!(connection = %self.id, error = %e, "Malformed frame");
                    if self.config.close_on_malformed {
                        break CloseReason::Malformed(e.to_string());
                    }
                }
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Read failed");
                    break CloseReason::Transport(e.to_string());
                }
            }
        };

        self.close().await;
        debug!(connection = %self.id, reason = ?reason, "Session ended");
        reason
    }

    /// Apply one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has been shut down.
    pub async fn handle(&mut self, message: Message) -> Result<(), HubError> {
        match message {
            Message::UserInfo {
                username,
                description,
            } => {
                let identified = self.set_identity(Identity::new(username.clone(), description));
                if identified {
                    info!(connection = %self.id, user = %username, "User joined");
                    self.hub.publish(Message::join_notice(&username)).await?;
                }
                self.hub.publish_roster().await?;
            }

            Message::UpdateInfo {
                username,
                description,
            } => {
                debug!(connection = %self.id, user = %username, "Identity updated");
                self.set_identity(Identity::new(username, description));
                self.hub.publish_roster().await?;
            }

            message @ Message::Chat { .. } => {
                self.hub.publish(message).await?;
            }

            Message::UserList { .. } => {
                debug!(connection = %self.id, "Ignoring roster sent by client");
            }
        }

        Ok(())
    }

    /// Store a new identity; returns whether the connection is now named.
    fn set_identity(&mut self, identity: Identity) -> bool {
        let named = !identity.is_anonymous();
        if !self.registry.set_identity(&self.id, identity) {
            return false;
        }
        self.state = if named {
            SessionState::Identified
        } else {
            SessionState::Connected
        };
        named
    }

    async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        // Removal and the roster that follows stay with the owning session
        if let Some(identity) = self.registry.remove(&self.id) {
            info!(connection = %self.id, user = %identity.name, "User left");
            let leave = self.hub.publish(Message::leave_notice(&identity.name)).await;
            let roster = self.hub.publish_roster().await;
            if leave.is_err() || roster.is_err() {
                debug!(connection = %self.id, "Hub closed before departure was announced");
            }
        }

        // The hub may hold this lock during a stalled write
        let close = async { self.sink.lock().await.close().await };
        match timeout(self.config.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = %self.id, error = %e, "Close failed"),
            Err(_) => warn!(connection = %self.id, "Close timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_protocol::UserInfo;
    use relay_transport::memory::{self, MemoryClient};
    use relay_transport::{MessageSink, TransportError};

    /// A sink whose close never completes.
    struct HangingCloseSink;

    #[async_trait]
    impl MessageSink for HangingCloseSink {
        async fn send_raw(&mut self, _data: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    struct Fixture {
        registry: Arc<ClientRegistry>,
        hub: Hub,
        _worker: tokio::task::JoinHandle<u64>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ClientRegistry::new());
            let (hub, worker) = Hub::spawn(Arc::clone(&registry), HubConfig::default());
            Self {
                registry,
                hub,
                _worker: worker,
            }
        }

        fn session(&self, config: SessionConfig) -> (Session, MemoryClient) {
            let (connection, client) = memory::pair();
            let (id, sink, stream) = connection.into_parts();
            let sink = self.registry.add(id.clone(), sink).unwrap();
            let session = Session::new(
                id,
                stream,
                sink,
                Arc::clone(&self.registry),
                self.hub.clone(),
                config,
            );
            (session, client)
        }
    }

    #[tokio::test]
    async fn test_announce_transitions_to_identified() {
        let fixture = Fixture::new();
        let (mut session, mut client) = fixture.session(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Connected);

        session
            .handle(Message::user_info("alice", "hi"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Identified);

        assert_eq!(client.recv().await, Some(Message::join_notice("alice")));
        assert_eq!(
            client.recv().await,
            Some(Message::user_list(vec![UserInfo::new("alice", "hi")]))
        );
    }

    #[tokio::test]
    async fn test_update_sets_identity_without_notice() {
        let fixture = Fixture::new();
        let (mut session, mut client) = fixture.session(SessionConfig::default());

        session
            .handle(Message::update_info("bob", "quiet"))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Identified);
        assert_eq!(
            client.recv().await,
            Some(Message::user_list(vec![UserInfo::new("bob", "quiet")]))
        );
        assert_eq!(
            fixture.registry.identity(session.id()),
            Some(Identity::new("bob", "quiet"))
        );
    }

    #[tokio::test]
    async fn test_empty_announce_stays_anonymous() {
        let fixture = Fixture::new();
        let (mut session, mut client) = fixture.session(SessionConfig::default());

        session.handle(Message::user_info("", "")).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(client.recv().await, Some(Message::user_list(vec![])));
    }

    #[tokio::test]
    async fn test_client_roster_ignored() {
        let fixture = Fixture::new();
        let (mut session, mut client) = fixture.session(SessionConfig::default());

        session
            .handle(Message::user_list(vec![UserInfo::new("fake", "")]))
            .await
            .unwrap();
        session.handle(Message::chat("x", "after")).await.unwrap();

        assert_eq!(client.recv().await, Some(Message::chat("x", "after")));
        assert!(fixture.registry.snapshot_roster().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let fixture = Fixture::new();
        let (session, mut client) = fixture.session(SessionConfig::default());
        let task = tokio::spawn(session.run());

        client.send_raw(&b"not json"[..]).unwrap();
        client.send(&Message::chat("alice", "still on")).unwrap();
        assert_eq!(client.recv().await, Some(Message::chat("alice", "still on")));

        client.close();
        assert_eq!(task.await.unwrap(), CloseReason::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_when_configured() {
        let fixture = Fixture::new();
        let (session, client) = fixture.session(SessionConfig {
            close_on_malformed: true,
            ..Default::default()
        });
        let id = session.id().clone();

        client.send_raw(&b"{\"type\":\"bogus\"}"[..]).unwrap();
        assert!(matches!(session.run().await, CloseReason::Malformed(_)));
        assert!(!fixture.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_session() {
        let fixture = Fixture::new();
        let (session, client) = fixture.session(SessionConfig::default());
        let id = session.id().clone();

        fixture.hub.shutdown();
        client.send(&Message::chat("alice", "anyone?")).unwrap();

        assert_eq!(session.run().await, CloseReason::HubClosed);
        assert!(!fixture.registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_close_is_bounded() {
        let fixture = Fixture::new();
        let (connection, mut client) = memory::pair();
        let (id, _sink, stream) = connection.into_parts();
        let sink = fixture
            .registry
            .add(id.clone(), Box::new(HangingCloseSink))
            .unwrap();
        let session = Session::new(
            id.clone(),
            stream,
            sink,
            Arc::clone(&fixture.registry),
            fixture.hub.clone(),
            SessionConfig {
                close_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        client.close();
        assert_eq!(session.run().await, CloseReason::Disconnected);
        assert!(!fixture.registry.contains(&id));
    }
}
