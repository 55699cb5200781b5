//! Point-in-time copies of a network: `snapshot_<uuid>` documents.
//!
//! Operates directly on one replica (normally the remote one). Restoring
//! rewrites the element documents and the network document; clients pick the
//! result up through replication like any other remote change.

use crate::document::{Document, Fields};
use crate::store::{self, DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

pub const DESIGN_DOC_ID: &str = "_design/doc";
pub const SNAPSHOT_PREFIX: &str = "snapshot_";

const SNAPSHOTS_MAP: &str = "function (doc) { if (doc.snapshot) { emit([doc.network, doc.timestamp], null); } }";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub network: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub elements: usize,
}

impl SnapshotSummary {
    fn from_document(doc: &Document) -> Option<Self> {
        if doc.get("snapshot").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        Some(Self {
            id: doc.id.clone(),
            network: doc.get("network")?.as_str()?.to_string(),
            timestamp: doc.get("timestamp")?.as_u64()?,
            elements: doc.get("elements").and_then(Value::as_array).map_or(0, Vec::len),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Snapshots {
    store: Arc<dyn DocumentStore>,
}

impl Snapshots {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Ensure the design document with the `snapshots` view exists.
    pub async fn install_design_doc(&self) -> store::Result<()> {
        let views = json!({ "snapshots": { "map": SNAPSHOTS_MAP } });
        let mut doc = match self.store.get(DESIGN_DOC_ID).await {
            Ok(doc) if doc.get("views") == Some(&views) => return Ok(()),
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => Document::new(DESIGN_DOC_ID, Fields::new()),
            Err(e) => return Err(e),
        };
        doc.fields.insert("views".into(), views);
        self.store.put(&doc).await?;
        info!("Installed {}", DESIGN_DOC_ID);
        Ok(())
    }

    /// Copy the network's data and full element bodies into a new snapshot.
    pub async fn create(&self, network_id: &str) -> store::Result<SnapshotSummary> {
        let network = self.store.get(network_id).await?;
        let mut elements = Vec::new();
        for id in network.element_ids() {
            match self.store.get(&id).await {
                Ok(element) => {
                    let mut body = element.fields;
                    body.insert("id".into(), Value::String(id));
                    elements.push(Value::Object(body));
                }
                Err(StoreError::NotFound(_)) => debug!("Skipping missing element {} in snapshot", id),
                Err(e) => return Err(e),
            }
        }

        let id = format!("{}{}", SNAPSHOT_PREFIX, Uuid::new_v4());
        let mut fields = Fields::new();
        fields.insert("snapshot".into(), Value::Bool(true));
        fields.insert("network".into(), Value::String(network_id.to_string()));
        fields.insert("timestamp".into(), json!(now_millis()));
        fields.insert(
            "data".into(),
            network.get("data").cloned().unwrap_or_else(|| json!({})),
        );
        fields.insert("elements".into(), Value::Array(elements));

        let doc = Document::new(id.clone(), fields);
        self.store.put(&doc).await?;
        let summary = SnapshotSummary::from_document(&doc)
            .ok_or_else(|| StoreError::InvalidDocument(id.clone()))?;
        info!("Created {} of {} with {} element(s)", id, network_id, summary.elements);
        Ok(summary)
    }

    /// Snapshots of `network_id`, newest first.
    pub async fn list(&self, network_id: &str) -> store::Result<Vec<SnapshotSummary>> {
        let mut snapshots: Vec<SnapshotSummary> = self
            .store
            .all_documents()
            .await?
            .iter()
            .filter(|doc| doc.id.starts_with(SNAPSHOT_PREFIX))
            .filter_map(SnapshotSummary::from_document)
            .filter(|summary| summary.network == network_id)
            .collect();
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Rewrite the element documents and the network document from a snapshot.
    pub async fn restore(&self, network_id: &str, snapshot_id: &str) -> store::Result<Document> {
        let snapshot = self.store.get(snapshot_id).await?;
        let summary = SnapshotSummary::from_document(&snapshot)
            .ok_or_else(|| StoreError::InvalidDocument(format!("{} is not a snapshot", snapshot_id)))?;
        if summary.network != network_id {
            return Err(StoreError::InvalidDocument(format!(
                "{} belongs to network {}",
                snapshot_id, summary.network
            )));
        }

        let bodies = snapshot
            .get("elements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut ids = Vec::new();
        for body in bodies {
            let Value::Object(mut body) = body else { continue };
            let Some(Value::String(id)) = body.remove("id") else { continue };
            self.overwrite(&id, body).await?;
            ids.push(Value::String(id));
        }

        let mut network = Fields::new();
        network.insert("elements".into(), Value::Array(ids));
        network.insert(
            "data".into(),
            snapshot.get("data").cloned().unwrap_or_else(|| json!({})),
        );
        self.overwrite(network_id, network).await?;
        info!("Restored {} from {}", network_id, snapshot_id);
        self.store.get(network_id).await
    }

    /// Replace a document's payload, creating it if missing or deleted.
    async fn overwrite(&self, id: &str, fields: Fields) -> store::Result<()> {
        let mut doc = match self.store.get(id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => Document::new(id, Fields::new()),
            Err(e) => return Err(e),
        };
        doc.replace_fields(&fields);
        self.store.put(&doc).await?;
        Ok(())
    }
}
