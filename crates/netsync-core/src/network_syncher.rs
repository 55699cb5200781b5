//! NetworkSyncher: orchestrates a network document and its element synchers.
//!
//! The network document holds `{elements: [id, ...], data: {...}}`. Local
//! graph additions create the element's document first and only then append
//! its id to `elements`, so other clients never see an id whose document does
//! not exist yet. Remote changes to the network document reconcile the graph:
//! unexpected elements are removed at once, missing ones are loaded
//! concurrently.
//!
//! Graph and change-feed callbacks only enqueue intents; a single worker task
//! per network processes them in order. A remote change is only a signal: the
//! worker reconciles against the document as it stands when the signal is
//! handled, and leaves alone elements whose local add or removal is still
//! queued.

use crate::adapter::StoreHandle;
use crate::config::SyncConfig;
use crate::document::{Document, Fields};
use crate::element_syncher::ElementSyncher;
use crate::error::{Result, SyncError, SyncFailure};
use crate::events::{EventBus, Subscription};
use crate::graph::{Element, Graph, GraphError, GraphEvent, Origin};
use crate::json_syncher::{JsonSyncher, RemoteEvent};
use crate::retry::{RetryPolicy, with_backoff};
use crate::secret::Secret;
use futures::future::join_all;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Constructed,
    Enabled,
    Disabled,
    Destroyed,
}

enum Intent {
    Added(Element),
    Removed(String),
    Data(Fields),
    /// The network document changed remotely
    Reconcile,
    Flush(oneshot::Sender<()>),
}

/// Local membership edits that are queued but not yet written, by element id.
#[derive(Default)]
struct PendingEdits {
    adds: HashMap<String, usize>,
    removes: HashMap<String, usize>,
}

impl PendingEdits {
    fn begin(&mut self, intent: &Intent) {
        match intent {
            Intent::Added(element) => *self.adds.entry(element.id.clone()).or_default() += 1,
            Intent::Removed(id) => *self.removes.entry(id.clone()).or_default() += 1,
            _ => {}
        }
    }

    fn finish(&mut self, intent: &Intent) {
        match intent {
            Intent::Added(element) => settle(&mut self.adds, &element.id),
            Intent::Removed(id) => settle(&mut self.removes, id),
            _ => {}
        }
    }
}

fn settle(counts: &mut HashMap<String, usize>, id: &str) {
    if let Some(count) = counts.get_mut(id) {
        *count -= 1;
        if *count == 0 {
            counts.remove(id);
        }
    }
}

struct Lifecycle {
    phase: NetworkState,
    listeners: Vec<Subscription>,
    intents: Option<mpsc::UnboundedSender<Intent>>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    graph: Arc<Graph>,
    handle: Arc<StoreHandle>,
    secret: Secret,
    config: SyncConfig,
    retry: RetryPolicy,
    doc: JsonSyncher,
    errors: Arc<EventBus<SyncFailure>>,
    children: Mutex<HashMap<String, ElementSyncher>>,
    pending: Mutex<PendingEdits>,
    lifecycle: Mutex<Lifecycle>,
}

/// Keeps a `Graph` and the documents of one network in sync.
#[derive(Clone)]
pub struct NetworkSyncher {
    inner: Arc<Inner>,
}

impl NetworkSyncher {
    pub fn new(
        graph: Arc<Graph>,
        handle: Arc<StoreHandle>,
        network_id: impl Into<String>,
        secret: Secret,
        config: &SyncConfig,
    ) -> Self {
        let id = network_id.into();
        let doc = JsonSyncher::new(Arc::clone(&handle), id.clone(), secret.clone(), config);
        Self {
            inner: Arc::new(Inner {
                id,
                graph,
                handle,
                secret,
                config: config.clone(),
                retry: config.retry.policy(),
                doc,
                errors: Arc::new(EventBus::new()),
                children: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingEdits::default()),
                lifecycle: Mutex::new(Lifecycle {
                    phase: NetworkState::Constructed,
                    listeners: Vec::new(),
                    intents: None,
                    worker: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> NetworkState {
        self.inner.lifecycle().phase
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.inner.graph
    }

    pub fn document(&self) -> &JsonSyncher {
        &self.inner.doc
    }

    /// The element synchers currently alive, by element id.
    pub fn children(&self) -> HashMap<String, ElementSyncher> {
        self.inner.children().clone()
    }

    /// Subscribe to terminal write failures of this network and its elements.
    pub fn on_sync_error(&self, callback: impl Fn(SyncFailure) + Send + Sync + 'static) -> Subscription {
        self.inner.errors.subscribe(callback)
    }

    /// Create the network document with no elements.
    pub async fn create(&self) -> Result<Document> {
        let mut initial = Fields::new();
        initial.insert("elements".into(), json!([]));
        initial.insert("data".into(), Value::Object(self.inner.graph.network_data()));
        self.inner.doc.create(initial).await
    }

    /// Load the network document, handling conflicts per the configured policy.
    pub async fn load(&self) -> Result<Document> {
        self.inner.doc.load_with(self.inner.config.conflict_policy).await
    }

    /// Load (or create) the network, hydrate the graph, then start listening.
    ///
    /// Enabling an enabled network is a no-op. Re-enabling after `disable`
    /// re-enables every child and reconciles with the latest document.
    pub async fn enable(&self) -> Result<()> {
        let inner = &self.inner;
        let phase = inner.lifecycle().phase;
        match phase {
            NetworkState::Destroyed => return Err(SyncError::Destroyed(inner.id.clone())),
            NetworkState::Enabled => return Ok(()),
            NetworkState::Disabled => {
                // The previous worker finishes its queue before a new one starts
                let previous = {
                    let mut lifecycle = inner.lifecycle();
                    match lifecycle.phase {
                        NetworkState::Enabled => None,
                        _ => lifecycle.worker.take(),
                    }
                };
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                let children: Vec<ElementSyncher> = inner.children().values().cloned().collect();
                for child in children {
                    if let Err(e) = child.enable().await {
                        warn!("Failed to re-enable element {}: {}", child.id(), e);
                    }
                }
                if let Some(doc) = inner.doc.get() {
                    inner.update_from_remote(&doc).await;
                }
            }
            NetworkState::Constructed => match self.load().await {
                Ok(doc) => inner.update_from_remote(&doc).await,
                Err(SyncError::DocumentNotFound { .. }) => {
                    info!("Network {} not found, creating it", inner.id);
                    self.create().await?;
                    inner.publish_existing().await;
                }
                Err(e) => return Err(e),
            },
        }

        let mut lifecycle = inner.lifecycle();
        match lifecycle.phase {
            NetworkState::Destroyed => return Err(SyncError::Destroyed(inner.id.clone())),
            NetworkState::Enabled => return Ok(()),
            _ => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lifecycle.intents = Some(tx);
        lifecycle.worker = Some(tokio::spawn(run_worker(Arc::downgrade(inner), rx)));
        lifecycle.listeners = vec![inner.listen_local(), inner.listen_remote()];
        lifecycle.phase = NetworkState::Enabled;
        info!("Enabled network {} with {} element(s)", inner.id, inner.graph.len());
        Ok(())
    }

    /// Stop listening and disable every child. Queued local intents still run.
    pub fn disable(&self) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.phase != NetworkState::Enabled {
                return;
            }
            lifecycle.listeners.clear();
            lifecycle.intents = None;
            lifecycle.phase = NetworkState::Disabled;
        }
        for child in self.inner.children().values() {
            child.disable();
        }
        debug!("Disabled network {}", self.inner.id);
    }

    /// Destroy every child, detach, and release the network document syncher.
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.phase == NetworkState::Destroyed {
                return;
            }
            lifecycle.listeners.clear();
            lifecycle.intents = None;
            lifecycle.phase = NetworkState::Destroyed;
        }
        let children: Vec<ElementSyncher> = self.inner.children().drain().map(|(_, c)| c).collect();
        for child in children {
            child.destroy();
        }
        self.inner.doc.destroy();
        debug!("Destroyed network {}", self.inner.id);
    }

    /// Wait until every observed intent is processed and every child has flushed.
    pub async fn flush(&self) {
        let (intents, worker) = {
            let mut lifecycle = self.inner.lifecycle();
            match lifecycle.intents.clone() {
                Some(tx) => (Some(tx), None),
                None => (None, lifecycle.worker.take()),
            }
        };

        if let Some(tx) = intents {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Intent::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        } else if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.inner.flush_children().await;
    }

    /// Reconcile the graph with a network document.
    pub async fn update_from_remote(&self, doc: &Document) {
        self.inner.update_from_remote(doc).await;
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, ElementSyncher>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_enabled(&self) -> bool {
        self.lifecycle().phase == NetworkState::Enabled
    }

    fn pending(&self) -> MutexGuard<'_, PendingEdits> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, intent: Intent) {
        let lifecycle = self.lifecycle();
        let Some(tx) = &lifecycle.intents else { return };
        self.pending().begin(&intent);
        if let Err(mpsc::error::SendError(intent)) = tx.send(intent) {
            self.pending().finish(&intent);
        }
    }

    fn new_child(&self, id: &str) -> ElementSyncher {
        ElementSyncher::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.handle),
            id,
            self.secret.clone(),
            &self.config,
            Arc::clone(&self.errors),
        )
    }

    fn report(&self, doc_id: &str, error: SyncError) {
        error!("Sync of {} in network {} failed: {}", doc_id, self.id, error);
        self.errors.emit(SyncFailure {
            doc_id: doc_id.to_string(),
            error,
        });
    }

    fn listen_local(self: &Arc<Self>) -> Subscription {
        let weak = Arc::downgrade(self);
        self.graph.subscribe(move |event| {
            if !event.is_local() {
                return;
            }
            let intent = match event {
                GraphEvent::Added { element, .. } if !element.is_ephemeral() => Intent::Added(element),
                GraphEvent::Removed { element, .. } if !element.is_ephemeral() => Intent::Removed(element.id),
                GraphEvent::NetworkDataChanged { data, .. } => Intent::Data(data),
                _ => return,
            };
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(intent);
            }
        })
    }

    fn listen_remote(self: &Arc<Self>) -> Subscription {
        let weak = Arc::downgrade(self);
        self.doc.on_remote(move |event| {
            let RemoteEvent::Changed(_) = event;
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(Intent::Reconcile);
            }
        })
    }

    /// Write `patch` to the network document, retrying transient failures.
    async fn write(&self, patch: Fields) -> Result<()> {
        let label = format!("Write of network {}", self.id);
        with_backoff(&self.retry, &label, || self.doc.update(patch.clone())).await?;
        Ok(())
    }

    async fn write_elements(&self, update: impl FnOnce(&mut Vec<String>) -> bool) {
        let mut ids = self.doc.get().map(|doc| doc.element_ids()).unwrap_or_default();
        if !update(&mut ids) {
            return;
        }
        let mut patch = Fields::new();
        patch.insert("elements".into(), json!(ids));
        if let Err(e) = self.write(patch).await {
            self.report(&self.id, e);
        }
    }

    /// Element document first, then its id in `elements`.
    async fn add_local(&self, element: Element) {
        let id = element.id.clone();
        if self.children().contains_key(&id) {
            return;
        }
        if !self.graph.contains(&id) {
            debug!("Element {} left the graph before it was synced", id);
            return;
        }

        let child = self.new_child(&id);
        if let Err(e) = child.create().await {
            child.destroy();
            self.report(&id, e);
            return;
        }
        if let Err(e) = child.enable().await {
            child.destroy();
            self.report(&id, e);
            return;
        }
        self.children().insert(id.clone(), child);

        debug!("Adding {} to network {}", id, self.id);
        self.write_elements(|ids| {
            if ids.contains(&id) {
                false
            } else {
                ids.push(id.clone());
                true
            }
        })
        .await;
    }

    async fn remove_local(&self, id: String) {
        if let Some(child) = self.children().remove(&id) {
            child.destroy();
        }
        debug!("Removing {} from network {}", id, self.id);
        self.write_elements(|ids| {
            let before = ids.len();
            ids.retain(|existing| *existing != id);
            ids.len() != before
        })
        .await;
    }

    /// Publish elements that were in the graph before the network document existed.
    async fn publish_existing(&self) {
        let mut elements = self.graph.elements();
        elements.retain(|element| !element.is_ephemeral());
        // Nodes before edges
        elements.sort_by_key(Element::is_edge);
        for element in elements {
            self.add_local(element).await;
        }
    }

    async fn flush_children(&self) {
        let children: Vec<ElementSyncher> = self.children().values().cloned().collect();
        join_all(children.iter().map(|child| child.flush())).await;
    }

    async fn update_from_remote(&self, doc: &Document) {
        let expected_order = doc.element_ids();
        let expected: HashSet<&str> = expected_order.iter().map(String::as_str).collect();
        let (adding, removing): (HashSet<String>, HashSet<String>) = {
            let pending = self.pending();
            (
                pending.adds.keys().cloned().collect(),
                pending.removes.keys().cloned().collect(),
            )
        };

        // Removal only touches local state, so it happens immediately
        for id in self.graph.element_ids() {
            let ephemeral = self.graph.element(&id).is_some_and(|e| e.is_ephemeral());
            if expected.contains(id.as_str()) || ephemeral || adding.contains(&id) {
                continue;
            }
            match self.graph.remove_from(&id, Origin::Remote) {
                Ok(()) | Err(GraphError::UnknownElement(_)) => {}
                Err(e) => warn!("Failed to remove {} from the graph: {}", id, e),
            }
        }
        let orphaned: Vec<ElementSyncher> = {
            let mut children = self.children();
            let gone: Vec<String> = children
                .iter()
                .filter(|(id, child)| {
                    !expected.contains(id.as_str()) || (child.is_loaded() && !self.graph.contains(id))
                })
                .map(|(id, _)| id.clone())
                .collect();
            gone.iter().filter_map(|id| children.remove(id)).collect()
        };
        for child in orphaned {
            debug!("Element {} left network {}", child.id(), self.id);
            child.destroy();
        }

        if let Some(data) = doc.get("data").and_then(Value::as_object) {
            if *data != self.graph.network_data() {
                self.graph.replace_network_data(data.clone(), Origin::Remote);
            }
        }

        let mut pending: Vec<String> = {
            let children = self.children();
            expected_order
                .iter()
                .filter(|id| !children.contains_key(*id))
                .filter(|id| !adding.contains(*id) && !removing.contains(*id))
                .cloned()
                .collect()
        };

        // Edges that load before their nodes are retried once the nodes are in
        while !pending.is_empty() {
            let round: Vec<(String, ElementSyncher)> = pending
                .drain(..)
                .map(|id| {
                    let child = self.new_child(&id);
                    (id, child)
                })
                .collect();
            let results = join_all(round.iter().map(|(_, child)| child.enable())).await;

            let mut progressed = false;
            let mut retry = Vec::new();
            for ((id, child), result) in round.into_iter().zip(results) {
                match result {
                    Ok(()) => {
                        progressed = true;
                        self.children().insert(id, child);
                    }
                    Err(SyncError::Graph(GraphError::DanglingEdge { .. })) => {
                        child.destroy();
                        retry.push(id);
                    }
                    Err(e) => {
                        child.destroy();
                        self.report(&id, e);
                    }
                }
            }

            if !progressed {
                for id in retry {
                    self.report(&id, GraphError::UnknownElement(id.clone()).into());
                }
                break;
            }
            pending = retry;
        }
    }
}

/// Process intents in order; exits once the channel closes and the queue is drained.
async fn run_worker(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Intent>) {
    while let Some(intent) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        match intent {
            Intent::Added(element) => {
                let id = element.id.clone();
                inner.add_local(element).await;
                settle(&mut inner.pending().adds, &id);
            }
            Intent::Removed(id) => {
                inner.remove_local(id.clone()).await;
                settle(&mut inner.pending().removes, &id);
            }
            Intent::Data(data) => {
                let mut patch = Fields::new();
                patch.insert("data".into(), Value::Object(data));
                if let Err(e) = inner.write(patch).await {
                    inner.report(&inner.id, e);
                }
            }
            Intent::Reconcile => {
                let current = inner.doc.get();
                if let Some(doc) = current.filter(|_| inner.is_enabled()) {
                    inner.update_from_remote(&doc).await;
                }
            }
            Intent::Flush(done) => {
                inner.flush_children().await;
                let _ = done.send(());
            }
        }
    }
}
