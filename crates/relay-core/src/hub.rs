//! Broadcast hub.
//!
//! Every outbound message goes through one bounded queue consumed by a single
//! [`HubWorker`]. The worker delivers messages strictly in publish order to
//! the registry membership at the moment of delivery. Roster snapshots are
//! taken by the worker too, so a later roster never describes an older state.
//! A failed or stalled write only affects the connection it was meant for.

use crate::registry::ClientRegistry;
use parking_lot::RwLock;
use relay_protocol::{codec, Message, MessageType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub has been shut down.
    #[error("Hub is shut down")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the delivery queue. Publishers wait when it is full.
    pub queue_capacity: usize,
    /// Upper bound on a single write to one connection.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Type of the delivered message.
    pub message_type: MessageType,
    /// Encoded size in bytes.
    pub bytes: usize,
    /// Connections the message was written to.
    pub delivered: usize,
    /// Connections whose write failed or timed out.
    pub failed: usize,
}

/// Receives a report for every delivered message.
pub trait DeliveryObserver: Send + Sync {
    /// Called by the worker after each fan-out.
    fn on_delivery(&self, report: &DeliveryReport);
}

/// An entry of the delivery queue.
#[derive(Debug)]
enum Outbound {
    /// Deliver this message as is.
    Message(Message),
    /// Snapshot the roster when dequeued and deliver it.
    Roster,
}

/// Publishing handle of the hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    sender: Arc<RwLock<Option<mpsc::Sender<Outbound>>>>,
    registry: Arc<ClientRegistry>,
}

impl Hub {
    /// Create a hub and the worker that performs its deliveries.
    ///
    /// The worker does nothing until [`HubWorker::run`] is polled.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>, config: HubConfig) -> (Self, HubWorker) {
        info!("Creating hub with config: {:?}", config);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let hub = Self {
            sender: Arc::new(RwLock::new(Some(tx))),
            registry: Arc::clone(&registry),
        };
        let worker = HubWorker {
            receiver: rx,
            registry,
            write_timeout: config.write_timeout,
            observer: None,
        };

        (hub, worker)
    }

    /// Create a hub and spawn its worker on the current runtime.
    ///
    /// The returned handle resolves to the number of messages delivered once
    /// the hub is shut down.
    #[must_use]
    pub fn spawn(registry: Arc<ClientRegistry>, config: HubConfig) -> (Self, JoinHandle<u64>) {
        let (hub, worker) = Self::new(registry, config);
        (hub, tokio::spawn(worker.run()))
    }

    /// Queue a message for delivery to every registered connection.
    ///
    /// Waits while the queue is full; never drops the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has been shut down.
    pub async fn publish(&self, message: Message) -> Result<(), HubError> {
        trace!(message_type = ?message.message_type(), "Publishing message");
        self.enqueue(Outbound::Message(message)).await
    }

    /// Queue a full roster broadcast.
    ///
    /// The snapshot is taken by the worker when the request reaches the front
    /// of the queue, so it reflects every registry change made before any
    /// later roster request was queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has been shut down.
    pub async fn publish_roster(&self) -> Result<(), HubError> {
        trace!("Publishing roster");
        self.enqueue(Outbound::Roster).await
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), HubError> {
        let sender = self.sender.read().clone().ok_or(HubError::Closed)?;
        sender.send(outbound).await.map_err(|_| HubError::Closed)
    }

    /// Stop accepting messages.
    ///
    /// Messages already queued are still delivered; the worker exits after
    /// the last one.
    pub fn shutdown(&self) {
        if self.sender.write().take().is_some() {
            info!("Hub shutting down");
        }
    }

    /// Check if the hub still accepts messages.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.read().is_some()
    }
}

/// The single delivery sequencer of a [`Hub`].
pub struct HubWorker {
    receiver: mpsc::Receiver<Outbound>,
    registry: Arc<ClientRegistry>,
    write_timeout: Duration,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

impl HubWorker {
    /// Report every delivery to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Deliver queued messages until the hub is shut down.
    ///
    /// Returns the number of messages processed.
    pub async fn run(mut self) -> u64 {
        debug!("Hub worker started");
        let mut processed = 0u64;

        while let Some(outbound) = self.receiver.recv().await {
            let message = match outbound {
                Outbound::Message(message) => message,
                Outbound::Roster => Message::user_list(self.registry.snapshot_roster()),
            };
            let report = self.deliver(&message).await;
            processed += 1;

            if let Some(observer) = &self.observer {
                observer.on_delivery(&report);
            }
        }

        info!(messages = processed, "Hub worker stopped");
        processed
    }

    async fn deliver(&self, message: &Message) -> DeliveryReport {
        let mut report = DeliveryReport {
            message_type: message.message_type(),
            bytes: 0,
            delivered: 0,
            failed: 0,
        };

        let data = match codec::encode(message) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Failed to encode broadcast");
                return report;
            }
        };
        report.bytes = data.len();

        // Collected under the registry lock, written to after releasing it
        let recipients = self.registry.recipients();

        for (connection_id, sink) in recipients {
            // Waiting for the sink lock counts against the write timeout
            let write = async { sink.lock().await.send_raw(data.clone()).await };
            match timeout(self.write_timeout, write).await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    debug!(connection = %connection_id, error = %e, "Delivery failed");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(connection = %connection_id, "Delivery timed out");
                    report.failed += 1;
                }
            }
        }

        trace!(
            message_type = ?report.message_type,
            delivered = report.delivered,
            failed = report.failed,
            "Delivered message"
        );

        report
    }
}
