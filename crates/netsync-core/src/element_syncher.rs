//! ElementSyncher: bridges one graph element to its document.
//!
//! Local `DataChanged` events become immediate `update({data})` writes;
//! `PositionChanged` events are coalesced and written once per debounce
//! window. Writes run on a per-element worker task in the order they were
//! observed. Remote document changes are applied to the graph with
//! `Origin::Remote`, which the local listener ignores.

use crate::adapter::StoreHandle;
use crate::coalesce::CoalescingQueue;
use crate::config::{ConflictPolicy, SyncConfig};
use crate::document::{Document, Fields};
use crate::error::{Result, SyncError, SyncFailure};
use crate::events::{EventBus, Subscription};
use crate::graph::{Element, Graph, GraphError, GraphEvent, Origin, Position, position_value};
use crate::json_syncher::{JsonSyncher, RemoteEvent};
use crate::retry::{RetryPolicy, with_backoff};
use crate::secret::Secret;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Uninitialized,
    Enabled,
    Disabled,
    Destroyed,
}

enum Intent {
    Data(Fields),
    Position(Position),
    Flush(oneshot::Sender<()>),
}

struct Lifecycle {
    phase: ElementState,
    loaded: bool,
    listeners: Vec<Subscription>,
    intents: Option<mpsc::UnboundedSender<Intent>>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    graph: Arc<Graph>,
    doc: JsonSyncher,
    debounce: Duration,
    retry: RetryPolicy,
    conflict_policy: ConflictPolicy,
    errors: Arc<EventBus<SyncFailure>>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Clone)]
pub struct ElementSyncher {
    inner: Arc<Inner>,
}

impl ElementSyncher {
    /// `errors` is shared with the owning network so failures surface in one place.
    pub fn new(
        graph: Arc<Graph>,
        handle: Arc<StoreHandle>,
        id: impl Into<String>,
        secret: Secret,
        config: &SyncConfig,
        errors: Arc<EventBus<SyncFailure>>,
    ) -> Self {
        let id = id.into();
        let doc = JsonSyncher::new(handle, id.clone(), secret, config);
        Self {
            inner: Arc::new(Inner {
                id,
                graph,
                doc,
                debounce: config.position_debounce(),
                retry: config.retry.policy(),
                conflict_policy: config.conflict_policy,
                errors,
                lifecycle: Mutex::new(Lifecycle {
                    phase: ElementState::Uninitialized,
                    loaded: false,
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

    pub fn state(&self) -> ElementState {
        self.inner.lifecycle().phase
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lifecycle().loaded
    }

    pub fn document(&self) -> &JsonSyncher {
        &self.inner.doc
    }

    pub fn on_sync_error(&self, callback: impl Fn(SyncFailure) + Send + Sync + 'static) -> Subscription {
        self.inner.errors.subscribe(callback)
    }

    /// Persist the graph element's current data and position as a new document.
    ///
    /// If a document with this id already exists (the id was used before),
    /// it is loaded and overwritten with the element's state.
    pub async fn create(&self) -> Result<()> {
        let inner = &self.inner;
        inner.check_alive()?;
        let element = inner
            .graph
            .element(&inner.id)
            .ok_or_else(|| GraphError::UnknownElement(inner.id.clone()))?;

        match inner.doc.create(element.to_fields()).await {
            Ok(_) => {}
            Err(SyncError::AlreadyExists { .. }) => {
                debug!("Element document {} already exists, taking it over", inner.id);
                inner.doc.load_with(inner.conflict_policy).await?;
                inner.doc.update(element.to_fields()).await?;
            }
            Err(e) => return Err(e),
        }

        inner.lifecycle().loaded = true;
        Ok(())
    }

    /// Load (if needed), attach to the graph element, and start listening.
    ///
    /// Enabling an enabled syncher is a no-op.
    pub async fn enable(&self) -> Result<()> {
        let inner = &self.inner;
        let loaded = {
            let lifecycle = inner.lifecycle();
            match lifecycle.phase {
                ElementState::Destroyed => return Err(SyncError::Destroyed(inner.id.clone())),
                ElementState::Enabled => return Ok(()),
                _ => lifecycle.loaded,
            }
        };

        if !loaded {
            let doc = inner.doc.load_with(inner.conflict_policy).await?;
            if !inner.graph.contains(&inner.id) {
                match inner.graph.add_from(Element::from_document(&doc), Origin::Remote) {
                    Ok(()) | Err(GraphError::DuplicateElement(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            inner.lifecycle().loaded = true;
        }

        // After a disable, the previous worker finishes its queue first so
        // writes keep their order
        let previous = {
            let mut lifecycle = inner.lifecycle();
            match lifecycle.phase {
                ElementState::Enabled => None,
                _ => lifecycle.worker.take(),
            }
        };
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        let mut lifecycle = inner.lifecycle();
        match lifecycle.phase {
            ElementState::Destroyed => return Err(SyncError::Destroyed(inner.id.clone())),
            ElementState::Enabled => return Ok(()),
            _ => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lifecycle.intents = Some(tx);
        lifecycle.worker = Some(tokio::spawn(run_worker(Arc::downgrade(inner), rx, inner.debounce)));
        lifecycle.listeners = vec![inner.listen_local(), inner.listen_remote()];
        lifecycle.phase = ElementState::Enabled;
        debug!("Enabled element {}", inner.id);
        Ok(())
    }

    /// Stop listening. Intents already observed are still written.
    pub fn disable(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.phase != ElementState::Enabled {
            return;
        }
        lifecycle.listeners.clear();
        lifecycle.intents = None;
        lifecycle.phase = ElementState::Disabled;
        debug!("Disabled element {}", self.inner.id);
    }

    /// Disable and release the document syncher. The document is left in place.
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.phase == ElementState::Destroyed {
                return;
            }
            lifecycle.listeners.clear();
            lifecycle.intents = None;
            lifecycle.phase = ElementState::Destroyed;
        }
        self.inner.doc.destroy();
        debug!("Destroyed element {}", self.inner.id);
    }

    /// Wait until every observed local intent, pending position included, is written.
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
            // Disabled: the worker drains its queue and exits
            let _ = worker.await;
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_alive(&self) -> Result<()> {
        if self.lifecycle().phase == ElementState::Destroyed {
            Err(SyncError::Destroyed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, intent: Intent) {
        if let Some(tx) = &self.lifecycle().intents {
            let _ = tx.send(intent);
        }
    }

    fn is_enabled(&self) -> bool {
        self.lifecycle().phase == ElementState::Enabled
    }

    fn listen_local(self: &Arc<Self>) -> Subscription {
        let weak = Arc::downgrade(self);
        let id = self.id.clone();
        self.graph.subscribe(move |event| {
            if !event.is_local() {
                return;
            }
            let intent = match event {
                GraphEvent::DataChanged { id: changed, data, .. } if changed == id => Intent::Data(data),
                GraphEvent::PositionChanged { id: changed, position, .. } if changed == id => {
                    Intent::Position(position)
                }
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
            let RemoteEvent::Changed(doc) = event;
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote(&doc);
            }
        })
    }

    /// Replace the graph element's data and position with the document's.
    fn apply_remote(&self, doc: &Document) {
        if !self.is_enabled() {
            return;
        }
        if doc.deleted {
            debug!("Element document {} was deleted remotely, leaving the graph alone", self.id);
            return;
        }
        let Some(current) = self.graph.element(&self.id) else {
            return;
        };

        if let Err(e) = self.replace_element(&current, Element::from_document(doc)) {
            warn!("Failed to apply remote change to {}: {}", self.id, e);
        }
    }

    fn replace_element(&self, current: &Element, incoming: Element) -> std::result::Result<(), GraphError> {
        if incoming.data != current.data {
            self.graph.replace_data(&self.id, incoming.data, Origin::Remote)?;
        }
        if let Some(position) = incoming.position.filter(|p| Some(*p) != current.position) {
            self.graph.set_position_from(&self.id, position, Origin::Remote)?;
        }
        Ok(())
    }

    /// Write `patch`, retrying transient failures; terminal failures go to the error bus.
    async fn write(&self, patch: Fields) {
        let label = format!("Write of {}", self.id);
        let result = with_backoff(&self.retry, &label, || self.doc.update(patch.clone())).await;

        match result {
            Ok(_) => {}
            Err(SyncError::Destroyed(_) | SyncError::Cancelled) => {
                debug!("Dropped write of {}: syncher destroyed", self.id);
            }
            Err(e) => {
                error!("Giving up on write of {}: {}", self.id, e);
                self.errors.emit(SyncFailure {
                    doc_id: self.id.clone(),
                    error: e,
                });
            }
        }
    }

    async fn write_position(&self, position: Position) {
        let mut patch = Fields::new();
        patch.insert("position".into(), position_value(position));
        self.write(patch).await;
    }
}

/// Consume intents in order. Exits once the channel closes and the queue is drained.
async fn run_worker(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Intent>, debounce: Duration) {
    let mut positions = CoalescingQueue::new(debounce);

    loop {
        let due = positions.due_at();
        tokio::select! {
            intent = rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match intent {
                    Some(Intent::Data(data)) => {
                        let mut patch = Fields::new();
                        patch.insert("data".into(), Value::Object(data));
                        inner.write(patch).await;
                    }
                    Some(Intent::Position(position)) => positions.push(position),
                    Some(Intent::Flush(done)) => {
                        if let Some(position) = positions.flush() {
                            inner.write_position(position).await;
                        }
                        let _ = done.send(());
                    }
                    None => {
                        if let Some(position) = positions.flush() {
                            inner.write_position(position).await;
                        }
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Some(position) = positions.take_due(Instant::now()) {
                    inner.write_position(position).await;
                }
            }
        }
    }

    if positions.coalesced() > 0 {
        debug!("Position writes coalesced: {}", positions.coalesced());
    }
}
