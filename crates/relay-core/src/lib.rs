//! # relay-core
//!
//! Client registry, broadcast hub and per-connection session handling for
//! the Relay chat hub.
//!
//! - **Registry** - The authoritative set of live connections and identities
//! - **Hub** - Single delivery sequencer fanning messages out to every client
//! - **Session** - Per-connection read loop driving registry and hub
//! - **Relay** - Bundles the three and accepts new connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  accept  ┌─────────────┐  publish  ┌─────────────┐
//! │  Listener   │─────────▶│   Session   │──────────▶│     Hub     │
//! └─────────────┘          └─────────────┘           └─────────────┘
//!                                 │                         │
//!                          add/remove/identity        for_each + send
//!                                 ▼                         │
//!                          ┌─────────────┐                  │
//!                          │  Registry   │◀─────────────────┘
//!                          └─────────────┘
//! ```

pub mod hub;
pub mod registry;
pub mod relay;
pub mod session;

pub use hub::{DeliveryObserver, DeliveryReport, Hub, HubConfig, HubError, HubWorker};
pub use registry::{ClientRegistry, Identity, RegistryError, RegistryStats, SharedSink};
pub use relay::{Relay, RelayConfig};
pub use session::{CloseReason, Session, SessionConfig, SessionState};
