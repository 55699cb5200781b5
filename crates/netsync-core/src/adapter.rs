//! Document Store Adapter: pairs a local and a remote replica per collection.
//!
//! `StoreContext` is the explicit registry of open collections (one
//! `StoreHandle`, and one replication session, per collection name). Each
//! handle replicates in both directions:
//!
//! 1. Pull: remote changes since the pull checkpoint are inserted into the
//!    local replica with their revisions intact. Every document whose local
//!    winner changed is published on the change feed as a `RemoteChange`.
//! 2. Push: local changes since the push checkpoint are inserted into the
//!    remote replica. Revisions the remote already knows are no-ops, so a
//!    pulled change never bounces back.
//!
//! With `replication.continuous` set, a background loop repeats passes when
//! either replica's sequence moves or the poll interval elapses, and retries
//! failed passes forever with exponential backoff.

use crate::config::{ReplicationConfig, SyncConfig};
use crate::document::Document;
use crate::events::{EventBus, Subscription};
use crate::retry::calculate_backoff;
use crate::store::{self, DocumentStore, InMemoryServer, InMemoryStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supplies the replica pair for a collection.
pub trait StoreProvider: Send + Sync {
    fn local(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>>;
    fn remote(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>>;
}

/// Fresh in-memory local replicas against a shared in-memory server.
pub struct MemoryProvider {
    server: Arc<InMemoryServer>,
    locals: Mutex<HashMap<String, Arc<InMemoryStore>>>,
}

impl MemoryProvider {
    pub fn new(server: Arc<InMemoryServer>) -> Self {
        Self {
            server,
            locals: Mutex::new(HashMap::new()),
        }
    }

    /// The local replica for `collection`, created on first use.
    pub fn local_store(&self, collection: &str) -> Arc<InMemoryStore> {
        let mut locals = self.locals.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locals
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(InMemoryStore::new())),
        )
    }
}

impl StoreProvider for MemoryProvider {
    fn local(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>> {
        Ok(self.local_store(collection))
    }

    fn remote(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>> {
        Ok(self.server.collection(collection))
    }
}

/// A remotely-originated change to one document, as now held by the local replica.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub doc_id: String,
    pub document: Document,
}

/// State of a collection's replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ReplicationState {
    /// No pass has completed yet
    Connecting,
    /// Last pass succeeded
    Active,
    /// Last pass failed, waiting to retry
    Reconnecting { attempt: u32 },
    /// Replication stopped by `close()`
    Closed,
}

/// Outcome of one replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Remote documents examined by the pull
    pub pulled: usize,
    /// Local documents sent by the push
    pub pushed: usize,
    /// Change events published
    pub changed: usize,
}

#[derive(Debug, Default)]
struct Checkpoints {
    pull: u64,
    push: u64,
}

/// Local + remote replica pair for one collection, with its change feed.
pub struct StoreHandle {
    collection: String,
    local: Arc<dyn DocumentStore>,
    remote: Arc<dyn DocumentStore>,
    feed: Arc<EventBus<RemoteChange>>,
    state_tx: watch::Sender<ReplicationState>,
    checkpoints: Mutex<Checkpoints>,
    /// Serializes passes between the loop and `sync_now` callers
    pass: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl StoreHandle {
    pub fn new(collection: &str, local: Arc<dyn DocumentStore>, remote: Arc<dyn DocumentStore>) -> Self {
        let (state_tx, _) = watch::channel(ReplicationState::Connecting);
        Self {
            collection: collection.to_string(),
            local,
            remote,
            feed: Arc::new(EventBus::new()),
            state_tx,
            checkpoints: Mutex::new(Checkpoints::default()),
            pass: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn local(&self) -> &Arc<dyn DocumentStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn DocumentStore> {
        &self.remote
    }

    /// Subscribe to remotely-originated changes for every document in the collection.
    pub fn subscribe(&self, callback: impl Fn(RemoteChange) + Send + Sync + 'static) -> Subscription {
        self.feed.subscribe(callback)
    }

    /// Observe the replication session's state.
    pub fn connection_state(&self) -> watch::Receiver<ReplicationState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the background loop. Manual `sync_now` calls keep working.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing replication for {}", self.collection);
            self.cancel.cancel();
        }
    }

    fn set_state(&self, state: ReplicationState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn checkpoints(&self) -> std::sync::MutexGuard<'_, Checkpoints> {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one pull pass and one push pass.
    pub async fn sync_now(&self) -> store::Result<ReplicationReport> {
        let _pass = self.pass.lock().await;
        let (pulled, changed) = self.pull().await?;
        let pushed = self.push().await?;
        Ok(ReplicationReport {
            pulled,
            pushed,
            changed,
        })
    }

    async fn pull(&self) -> store::Result<(usize, usize)> {
        let since = self.checkpoints().pull;
        let changes = self.remote.changes(since).await?;
        let mut changed = 0;

        for change in &changes {
            let mut winner = None;
            for leaf in &change.leaves {
                if let Some(new_winner) = self.local.put_replicated(leaf).await? {
                    winner = Some(new_winner);
                }
            }
            self.checkpoints().pull = change.seq;

            if let Some(document) = winner {
                debug!("Pulled {} {:?} into {}", change.id, document.rev, self.collection);
                changed += 1;
                self.feed.emit(RemoteChange {
                    doc_id: change.id.clone(),
                    document,
                });
            }
        }

        Ok((changes.len(), changed))
    }

    async fn push(&self) -> store::Result<usize> {
        let since = self.checkpoints().push;
        let changes = self.local.changes(since).await?;

        for change in &changes {
            for leaf in &change.leaves {
                self.remote.put_replicated(leaf).await?;
            }
            self.checkpoints().push = change.seq;
        }

        Ok(changes.len())
    }

    /// Continuous replication loop. Never gives up on errors; exits on `close()`.
    async fn run(self: Arc<Self>, config: ReplicationConfig) {
        let policy = config.reconnect_policy();
        let mut local_rx = self.local.watch_seq();
        let mut remote_rx = self.remote.watch_seq();
        let mut attempt = 0;

        loop {
            local_rx.borrow_and_update();
            remote_rx.borrow_and_update();

            match self.sync_now().await {
                Ok(report) => {
                    if attempt > 0 {
                        info!("Replication of {} recovered after {} attempt(s)", self.collection, attempt);
                    }
                    attempt = 0;
                    self.set_state(ReplicationState::Active);
                    if report.changed > 0 {
                        debug!("{}: {:?}", self.collection, report);
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = calculate_backoff(attempt, &policy);
                    warn!(
                        "Replication of {} failed (attempt {}): {}, retrying in {:?}",
                        self.collection, attempt, e, delay
                    );
                    self.set_state(ReplicationState::Reconnecting { attempt });
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = local_rx.changed() => {}
                _ = remote_rx.changed() => {}
                _ = tokio::time::sleep(config.poll_interval()) => {}
            }
        }

        self.set_state(ReplicationState::Closed);
        debug!("Replication loop for {} exited", self.collection);
    }
}

/// Registry of open collections, owned by the application.
pub struct StoreContext {
    config: SyncConfig,
    provider: Arc<dyn StoreProvider>,
    handles: Mutex<HashMap<String, Arc<StoreHandle>>>,
}

impl StoreContext {
    pub fn new(config: SyncConfig, provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            config,
            provider,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open `collection`, returning the existing handle if already open.
    ///
    /// With continuous replication configured, the first open spawns the
    /// replication loop on the current tokio runtime.
    pub fn open(&self, collection: &str) -> store::Result<Arc<StoreHandle>> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.get(collection) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(StoreHandle::new(
            collection,
            self.provider.local(collection)?,
            self.provider.remote(collection)?,
        ));

        if self.config.replication.continuous {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    info!("Starting continuous replication for {}", collection);
                    runtime.spawn(Arc::clone(&handle).run(self.config.replication.clone()));
                }
                Err(_) => warn!(
                    "No tokio runtime; {} will only replicate on sync_now()",
                    collection
                ),
            }
        }

        handles.insert(collection.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Stop replication for every open collection.
    pub fn close(&self) {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.values() {
            handle.close();
        }
    }
}

impl Drop for StoreContext {
    fn drop(&mut self) {
        self.close();
    }
}
