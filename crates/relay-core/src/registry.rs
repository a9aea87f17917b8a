//! Client registry.
//!
//! The registry is the single source of truth for which connections are live
//! and which identity each one has announced. Membership and identities live
//! behind one mutex so a roster snapshot always reflects a point-in-time view.
//! The lock is never held across an `.await`.

use parking_lot::Mutex;
use relay_protocol::UserInfo;
use relay_transport::{ConnectionId, MessageSink};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Write half of a connection, shared between the registry and its session.
///
/// The async mutex serializes writes to one connection.
pub type SharedSink = Arc<tokio::sync::Mutex<Box<dyn MessageSink>>>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// The (name, description) pair a client attaches to its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Display name. Empty until the client announces itself.
    pub name: String,
    /// Free-text description.
    pub description: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// Whether no name has been set.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Public roster record for this identity.
    #[must_use]
    pub fn to_user_info(&self) -> UserInfo {
        UserInfo::new(self.name.clone(), self.description.clone())
    }
}

/// A registered connection.
struct ClientEntry {
    sink: SharedSink,
    identity: Identity,
    /// Registration order, used to keep roster snapshots stable.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<ConnectionId, ClientEntry>,
    next_seq: u64,
}

/// The set of live connections.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's write half.
    ///
    /// Returns the shared sink, which the owning session keeps in order to
    /// close the connection once it has been removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered.
    pub fn add(
        &self,
        connection_id: ConnectionId,
        sink: Box<dyn MessageSink>,
    ) -> Result<SharedSink, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.clients.contains_key(&connection_id) {
            return Err(RegistryError::AlreadyRegistered(connection_id));
        }

        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.clients.insert(
            connection_id.clone(),
            ClientEntry {
                sink: Arc::clone(&sink),
                identity: Identity::default(),
                seq,
            },
        );

        debug!(
            connection = %connection_id,
            clients = inner.clients.len(),
            "Client registered"
        );

        Ok(sink)
    }

    /// Remove a connection.
    ///
    /// Idempotent. Returns the identity the connection had at removal time
    /// when it had announced a non-empty name, `None` when it was anonymous
    /// or not registered.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Identity> {
        let mut inner = self.inner.lock();
        let entry = inner.clients.remove(connection_id)?;

        debug!(
            connection = %connection_id,
            clients = inner.clients.len(),
            "Client removed"
        );

        (!entry.identity.is_anonymous()).then_some(entry.identity)
    }

    /// Overwrite a connection's identity.
    ///
    /// Returns `false` if the connection is not registered.
    pub fn set_identity(&self, connection_id: &ConnectionId, identity: Identity) -> bool {
        let mut inner = self.inner.lock();
        match inner.clients.get_mut(connection_id) {
            Some(entry) => {
                entry.identity = identity;
                true
            }
            None => false,
        }
    }

    /// Get a connection's current identity.
    #[must_use]
    pub fn identity(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.inner
            .lock()
            .clients
            .get(connection_id)
            .map(|entry| entry.identity.clone())
    }

    /// Public records of every identified connection, in registration order.
    #[must_use]
    pub fn snapshot_roster(&self) -> Vec<UserInfo> {
        let inner = self.inner.lock();
        let mut identified: Vec<&ClientEntry> = inner
            .clients
            .values()
            .filter(|entry| !entry.identity.is_anonymous())
            .collect();
        identified.sort_by_key(|entry| entry.seq);
        identified
            .into_iter()
            .map(|entry| entry.identity.to_user_info())
            .collect()
    }

    /// Apply `f` to every registered connection while holding the lock.
    ///
    /// `f` must not block; collect what is needed and act after returning.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectionId, &SharedSink, &Identity),
    {
        let inner = self.inner.lock();
        for (id, entry) in &inner.clients {
            f(id, &entry.sink, &entry.identity);
        }
    }

    /// The connections a broadcast should go to right now.
    #[must_use]
    pub fn recipients(&self) -> Vec<(ConnectionId, SharedSink)> {
        let mut recipients = Vec::new();
        self.for_each(|id, sink, _| recipients.push((id.clone(), Arc::clone(sink))));
        recipients
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.inner.lock().clients.contains_key(connection_id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            connection_count: inner.clients.len(),
            identified_count: inner
                .clients
                .values()
                .filter(|entry| !entry.identity.is_anonymous())
                .count(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of connections with a non-empty name.
    pub identified_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transport::memory;
    use std::thread;

    fn sink() -> Box<dyn MessageSink> {
        let (connection, _client) = memory::pair();
        let (_id, sink, _stream) = connection.into_parts();
        sink
    }

    #[test]
    fn test_add_remove() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::from("conn-1");

        registry.add(id.clone(), sink()).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());

        // Removing again is a no-op
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_duplicate_add() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::from("conn-1");

        registry.add(id.clone(), sink()).unwrap();
        assert!(matches!(
            registry.add(id, sink()),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_returns_identity() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::from("conn-1");

        registry.add(id.clone(), sink()).unwrap();
        assert!(registry.set_identity(&id, Identity::new("alice", "hi")));

        assert_eq!(registry.remove(&id), Some(Identity::new("alice", "hi")));
        assert!(!registry.set_identity(&id, Identity::new("alice", "hi")));
    }

    #[test]
    fn test_roster_excludes_anonymous() {
        let registry = ClientRegistry::new();
        let alice = ConnectionId::from("alice");
        let lurker = ConnectionId::from("lurker");
        let bob = ConnectionId::from("bob");

        registry.add(alice.clone(), sink()).unwrap();
        registry.add(lurker.clone(), sink()).unwrap();
        registry.add(bob.clone(), sink()).unwrap();
        registry.set_identity(&bob, Identity::new("bob", ""));
        registry.set_identity(&alice, Identity::new("alice", "first"));

        let roster = registry.snapshot_roster();
        assert_eq!(
            roster,
            vec![UserInfo::new("alice", "first"), UserInfo::new("bob", "")]
        );

        let stats = registry.stats();
        assert_eq!(stats.connection_count, 3);
        assert_eq!(stats.identified_count, 2);

        // Clearing a name hides the connection again
        registry.set_identity(&alice, Identity::default());
        assert_eq!(registry.snapshot_roster(), vec![UserInfo::new("bob", "")]);
        assert_eq!(registry.recipients().len(), 3);
    }

    #[test]
    fn test_for_each_sees_identities() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::from("conn-1");
        registry.add(id.clone(), sink()).unwrap();
        registry.set_identity(&id, Identity::new("alice", ""));

        let mut seen = Vec::new();
        registry.for_each(|id, _, identity| seen.push((id.clone(), identity.name.clone())));
        assert_eq!(seen, vec![(id, "alice".to_string())]);
    }

    #[test]
    fn test_concurrent_add_remove_snapshot() {
        let registry = Arc::new(ClientRegistry::new());
        let stable = ConnectionId::from("stable");
        registry.add(stable.clone(), sink()).unwrap();
        registry.set_identity(&stable, Identity::new("stable", ""));

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for round in 0..200 {
                        let id = ConnectionId::new(format!("w{worker}-{round}"));
                        registry.add(id.clone(), sink()).unwrap();
                        registry.set_identity(&id, Identity::new(id.as_str(), ""));
                        let removed = registry.remove(&id).unwrap();
                        assert_eq!(removed.name, id.as_str());
                        assert!(!registry
                            .snapshot_roster()
                            .iter()
                            .any(|user| user.username == id.as_str()));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let roster = registry.snapshot_roster();
            assert!(roster.iter().any(|user| user.username == "stable"));
        }

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(registry.snapshot_roster(), vec![UserInfo::new("stable", "")]);
        assert_eq!(registry.len(), 1);
    }
}
