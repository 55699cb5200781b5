//! Errors surfaced by the synchers.

use crate::graph::GraphError;
use crate::revision::Revision;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("Document {doc_id} not found in {collection}")]
    DocumentNotFound { collection: String, doc_id: String },

    #[error("Document {doc_id} in {collection} has conflicting revisions (primary {primary}, {} others)", conflicts.len())]
    LoadConflict {
        collection: String,
        doc_id: String,
        primary: Revision,
        conflicts: Vec<Revision>,
    },

    #[error("Document {doc_id} already exists in {collection}")]
    AlreadyExists { collection: String, doc_id: String },

    #[error("Document {0} has not been created or loaded")]
    NotLoaded(String),

    #[error("Syncher for {0} has been destroyed")]
    Destroyed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

impl SyncError {
    /// Errors a scheduled write should retry.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_transient(),
            SyncError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Terminal failure of a scheduled write, published on the sync-error bus.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub doc_id: String,
    pub error: SyncError,
}
