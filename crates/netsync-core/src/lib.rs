//! netsync-core: optimistic document synchronization for graph networks.
//!
//! This crate provides:
//! - A revision-tree document store trait and an in-memory implementation
//! - The Document Store Adapter: local/remote replica pairs with continuous
//!   replication and a change feed
//! - JsonSyncher, ElementSyncher and NetworkSyncher, which keep a `Graph`
//!   and its documents in sync in both directions
//! - Network snapshots

pub mod adapter;
pub mod coalesce;
pub mod config;
pub mod document;
pub mod element_syncher;
pub mod error;
pub mod events;
pub mod graph;
pub mod json_syncher;
pub mod network_syncher;
pub mod retry;
pub mod revision;
pub mod secret;
pub mod snapshot;
pub mod store;

pub use adapter::{
    MemoryProvider, RemoteChange, ReplicationReport, ReplicationState, StoreContext, StoreHandle,
    StoreProvider,
};
pub use config::{ConfigError, ConflictPolicy, ReplicationConfig, RetryConfig, SyncConfig};
pub use document::{Document, Fields};
pub use element_syncher::{ElementState, ElementSyncher};
pub use error::{SyncError, SyncFailure};
pub use events::{EventBus, Subscription};
pub use graph::{Element, Graph, GraphError, GraphEvent, Origin, Position};
pub use json_syncher::{JsonSyncher, LocalEvent, RemoteEvent};
pub use network_syncher::{NetworkState, NetworkSyncher};
pub use revision::Revision;
pub use secret::Secret;
pub use snapshot::{SnapshotSummary, Snapshots};
pub use store::{DocumentStore, InMemoryServer, InMemoryStore, StoreDump, StoreError};
