//! One CLI invocation against a network: pull, hydrate, edit, flush, push.

use crate::file_store::FileProvider;
use anyhow::{Result, bail};
use netsync_core::snapshot::Snapshots;
use netsync_core::{
    Element, Fields, Graph, NetworkSyncher, Position, ReplicationReport, Secret, StoreContext,
    StoreHandle, SyncConfig, SyncFailure,
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub data_dir: PathBuf,
    pub remote_dir: PathBuf,
    pub network: String,
    pub secret: Secret,
    pub config: SyncConfig,
}

pub struct Session {
    ctx: StoreContext,
    handle: Arc<StoreHandle>,
    network: NetworkSyncher,
    failures: Arc<Mutex<Vec<SyncFailure>>>,
    _errors: netsync_core::Subscription,
}

impl Session {
    /// Pull from the remote replica and enable the network (creating it if needed).
    pub async fn open(options: SessionOptions) -> Result<Self> {
        let mut config = options.config;
        // One-shot process: replicate explicitly instead of in the background
        config.replication.continuous = false;

        let provider = Arc::new(FileProvider::new(&options.data_dir, &options.remote_dir));
        let ctx = StoreContext::new(config, provider);
        let handle = ctx.open(&options.network)?;
        let report = handle.sync_now().await?;
        debug!("Initial pull: {:?}", report);

        let network = NetworkSyncher::new(
            Graph::new(),
            Arc::clone(&handle),
            options.network.clone(),
            options.secret,
            ctx.config(),
        );

        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_clone = Arc::clone(&failures);
        let errors = network.on_sync_error(move |failure| {
            failures_clone
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(failure);
        });

        network.enable().await?;
        info!("Opened network {} ({} element(s))", options.network, network.graph().len());

        Ok(Self {
            ctx,
            handle,
            network,
            failures,
            _errors: errors,
        })
    }

    pub fn network(&self) -> &NetworkSyncher {
        &self.network
    }

    pub fn graph(&self) -> &Arc<Graph> {
        self.network.graph()
    }

    pub fn snapshots(&self) -> Snapshots {
        Snapshots::new(Arc::clone(self.handle.remote()))
    }

    pub fn add_node(&self, id: &str, data: Fields, position: Position) -> Result<()> {
        self.graph().add(Element::node(id, data, position))?;
        Ok(())
    }

    pub fn add_edge(&self, id: &str, source: &str, target: &str, data: Fields) -> Result<()> {
        self.graph().add(Element::edge(id, source, target, data))?;
        Ok(())
    }

    /// Set one data field of an element, or of the network when `id` is the network id.
    pub fn set(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let mut patch = Fields::new();
        patch.insert(key.to_string(), value);
        if id == self.network.id() {
            self.graph().set_network_data(patch);
        } else {
            self.graph().set_data(id, patch)?;
        }
        Ok(())
    }

    pub fn move_to(&self, id: &str, position: Position) -> Result<()> {
        self.graph().set_position(id, position)?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.graph().remove(id)?;
        Ok(())
    }

    /// Write every pending edit locally, then replicate both ways.
    pub async fn commit(&self) -> Result<ReplicationReport> {
        self.network.flush().await;
        let report = self.handle.sync_now().await?;
        // Pulled changes are reconciled by the network worker
        self.network.flush().await;

        let failures = std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(first) = failures.first() {
            bail!(
                "{} write(s) failed, first for {}: {}",
                failures.len(),
                first.doc_id,
                first.error
            );
        }
        Ok(report)
    }

    /// The network as JSON: id, data and every element.
    pub fn show(&self) -> Value {
        let elements: Vec<Value> = self
            .graph()
            .elements()
            .into_iter()
            .map(|element| {
                let mut body = element.to_fields();
                body.insert("id".into(), Value::String(element.id));
                Value::Object(body)
            })
            .collect();
        json!({
            "network": self.network.id(),
            "data": self.graph().network_data(),
            "elements": elements,
        })
    }

    pub fn close(self) {
        self.network.destroy();
        self.ctx.close();
    }
}
