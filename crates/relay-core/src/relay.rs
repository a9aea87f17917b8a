//! The relay: registry, hub and sessions wired together.
//!
//! This is the boundary the listener talks to. It hands over new connections
//! with [`Relay::accept`] and answers roster queries with [`Relay::roster`].

use crate::hub::{Hub, HubConfig, HubWorker};
use crate::registry::{ClientRegistry, RegistryError, RegistryStats};
use crate::session::{CloseReason, Session, SessionConfig};
use relay_protocol::UserInfo;
use relay_transport::{Connection, Transport, TransportError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Delivery queue settings.
    pub hub: HubConfig,
    /// Per-connection settings.
    pub session: SessionConfig,
}

/// Shared handle to the chat hub. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<ClientRegistry>,
    hub: Hub,
    session_config: SessionConfig,
}

impl Relay {
    /// Create a relay and the hub worker it needs.
    ///
    /// The caller decides where the worker runs.
    #[must_use]
    pub fn new(config: RelayConfig) -> (Self, HubWorker) {
        let registry = Arc::new(ClientRegistry::new());
        let (hub, worker) = Hub::new(Arc::clone(&registry), config.hub);

        let relay = Self {
            registry,
            hub,
            session_config: config.session,
        };

        (relay, worker)
    }

    /// Create a relay and spawn its hub worker on the current runtime.
    #[must_use]
    pub fn start(config: RelayConfig) -> (Self, JoinHandle<u64>) {
        let (relay, worker) = Self::new(config);
        (relay, tokio::spawn(worker.run()))
    }

    /// Register a new connection and spawn its session.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection with the same ID is already registered.
    pub fn accept(&self, connection: Connection) -> Result<JoinHandle<CloseReason>, RegistryError> {
        let remote_addr = connection.remote_addr().map(str::to_owned);
        let (id, sink, stream) = connection.into_parts();
        let sink = self.registry.add(id.clone(), sink)?;

        debug!(
            connection = %id,
            remote = remote_addr.as_deref().unwrap_or("unknown"),
            "Connection accepted"
        );

        let session = Session::new(
            id,
            stream,
            sink,
            Arc::clone(&self.registry),
            self.hub.clone(),
            self.session_config.clone(),
        );

        Ok(tokio::spawn(session.run()))
    }

    /// Accept connections from `transport` until it stops producing them.
    ///
    /// Failed handshakes are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener itself fails.
    pub async fn serve<T>(&self, transport: &T) -> Result<(), TransportError>
    where
        T: Transport + ?Sized,
    {
        info!(transport = transport.name(), "Accepting connections");

        loop {
            match transport.accept().await {
                Ok(connection) => {
                    if let Err(e) = self.accept(connection) {
                        warn!(error = %e, "Rejected connection");
                    }
                }
                Err(TransportError::ConnectionClosed) => {
                    info!(transport = transport.name(), "Transport closed");
                    return Ok(());
                }
                Err(TransportError::Io(e)) => return Err(TransportError::Io(e)),
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }

    /// Current roster of identified users.
    #[must_use]
    pub fn roster(&self) -> Vec<UserInfo> {
        self.registry.snapshot_roster()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Get the client registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Get the hub.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Stop the hub. Running sessions end on their next publish.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}
