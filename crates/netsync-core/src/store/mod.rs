//! DocumentStore trait abstraction for one replica of a keyed JSON collection.
//!
//! Implementations:
//! - `InMemoryStore` - revision-tree store, used for tests and as the base of
//!   on-disk replicas
//! - `FileStore` (in netsync-cli) - persists an `InMemoryStore` as JSON

mod memory;

pub use memory::{InMemoryServer, InMemoryStore, StoreDump, WriteKind, WriteRecord};

use crate::document::Document;
use crate::revision::Revision;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    /// Errors worth retrying: the store may answer differently later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One entry of a change listing.
#[derive(Debug, Clone)]
pub struct Change {
    /// Update sequence at which the document last changed
    pub seq: u64,
    /// Document id
    pub id: String,
    /// Every leaf revision, each carrying its ancestry
    pub leaves: Vec<Document>,
}

/// One replica of a keyed JSON document collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Winning revision, with `conflicts` filled in.
    async fn get(&self, id: &str) -> Result<Document>;

    /// Write a new edit on top of `doc.rev` and return the new revision.
    async fn put(&self, doc: &Document) -> Result<Revision>;

    /// Tombstone the leaf named by `rev`.
    async fn delete(&self, id: &str, rev: &Revision) -> Result<Revision>;

    /// Insert a revision produced elsewhere, keeping its revision and ancestry.
    ///
    /// Returns the new winner when the winning revision changed.
    async fn put_replicated(&self, doc: &Document) -> Result<Option<Document>>;

    /// Every document changed after `since`, in sequence order.
    async fn changes(&self, since: u64) -> Result<Vec<Change>>;

    /// Live winners of every document.
    async fn all_documents(&self) -> Result<Vec<Document>>;

    /// Current update sequence, notified on every change.
    fn watch_seq(&self) -> watch::Receiver<u64>;
}
