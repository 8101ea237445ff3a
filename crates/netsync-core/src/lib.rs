//! netsync-core: serverless LAN peer discovery and key-value replication.
//!
//! This crate provides the core functionality for:
//! - UDP broadcast peer discovery (shout/response handshake)
//! - TCP envelope transport with self-healing membership
//! - An eventually-consistent replicated key-value store
//! - Lifecycle orchestration tying the three together

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod envelope;
pub mod messages;
pub mod peer;
pub mod registry;
pub mod store;
pub mod transport;

pub use config::{NetSyncConfig, DEFAULT_DISCOVERY_PORT};
pub use coordinator::{Coordinator, CoordinatorError};
pub use discovery::{Discovery, DiscoveryError};
pub use envelope::{Envelope, EnvelopeError};
pub use messages::{DataAction, DataMessage, Ping, Response, Shout};
pub use peer::{Peer, PeerId, PeerIdError, PeerList};
pub use registry::{CodecError, TypeRegistry};
pub use store::{Record, StoreError, SyncStore};
pub use transport::{ReachableInfo, Transport, TransportError, TransportEvent};
