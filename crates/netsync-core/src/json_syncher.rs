//! JsonSyncher: lifecycle of one JSON document against a `StoreHandle`.
//!
//! Writes are optimistic: `update` and `delete` change the in-memory snapshot
//! before they return, then hand back a future that persists the snapshot to
//! the local replica (replication carries it to the remote). Remote changes
//! arrive through the handle's change feed and are applied only when their
//! revision descends from the one we hold, or beats it in the deterministic
//! revision order when the two are concurrent.
//!
//! Local lifecycle events and remote changes are published on two separate
//! buses (`on_local`, `on_remote`).

use crate::adapter::StoreHandle;
use crate::config::{ConflictPolicy, SyncConfig};
use crate::document::{Document, Fields};
use crate::error::{Result, SyncError};
use crate::events::{EventBus, Subscription};
use crate::revision::{Revision, RevisionRelation, relation};
use crate::secret::Secret;
use crate::store::{self, StoreError};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle events caused by this client.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    Created(Document),
    Loaded(Document),
    /// Optimistic merge applied, write pending.
    Updating { doc_id: String, patch: Fields },
    /// Write confirmed by the local replica.
    Updated(Document),
    /// Optimistic delete applied, write pending.
    Deleting { doc_id: String },
    Deleted(Document),
}

/// Changes received from other clients.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Changed(Document),
}

struct Inner {
    handle: Arc<StoreHandle>,
    doc_id: String,
    secret: Secret,
    timeout: Duration,
    snapshot: RwLock<Option<Document>>,
    /// Serializes writes of this document
    write_lock: tokio::sync::Mutex<()>,
    local_events: Arc<EventBus<LocalEvent>>,
    remote_events: Arc<EventBus<RemoteEvent>>,
    feed: Mutex<Option<Subscription>>,
    cancel: CancellationToken,
}

/// One document's create/load/get/update/delete against a replica pair.
#[derive(Clone)]
pub struct JsonSyncher {
    inner: Arc<Inner>,
}

impl JsonSyncher {
    /// Subscribes to the change feed for `doc_id` immediately.
    pub fn new(handle: Arc<StoreHandle>, doc_id: impl Into<String>, secret: Secret, config: &SyncConfig) -> Self {
        let inner = Arc::new(Inner {
            handle,
            doc_id: doc_id.into(),
            secret,
            timeout: config.operation_timeout(),
            snapshot: RwLock::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            local_events: Arc::new(EventBus::new()),
            remote_events: Arc::new(EventBus::new()),
            feed: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        let doc_id = inner.doc_id.clone();
        let feed = inner.handle.subscribe(move |change| {
            if change.doc_id != doc_id {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote(change.document);
            }
        });
        *inner.feed.lock().unwrap_or_else(|e| e.into_inner()) = Some(feed);

        Self { inner }
    }

    pub fn doc_id(&self) -> &str {
        &self.inner.doc_id
    }

    pub fn collection(&self) -> &str {
        self.inner.handle.collection()
    }

    pub fn secret(&self) -> &Secret {
        &self.inner.secret
    }

    /// True once a live snapshot is held (created or loaded, not deleted).
    pub fn is_loaded(&self) -> bool {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|doc| !doc.deleted)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn on_local(&self, callback: impl Fn(LocalEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.local_events.subscribe(callback)
    }

    pub fn on_remote(&self, callback: impl Fn(RemoteEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.remote_events.subscribe(callback)
    }

    /// The in-memory snapshot, including optimistic changes.
    pub fn get(&self) -> Option<Document> {
        self.inner.snapshot()
    }

    pub fn get_field(&self, field: &str) -> Option<Value> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|doc| doc.get(field).cloned())
    }

    /// Last revision confirmed by a write or an accepted remote change.
    pub fn revision(&self) -> Option<Revision> {
        self.inner.snapshot().and_then(|doc| doc.rev)
    }

    /// Write a brand-new document.
    pub async fn create(&self, initial: Fields) -> Result<Document> {
        let inner = &self.inner;
        inner.check_alive()?;
        if self.is_loaded() {
            return Err(inner.already_exists());
        }

        let mut doc = Document::new(inner.doc_id.clone(), initial);
        let _write = inner.write_lock.lock().await;
        let rev = match inner.guarded(inner.handle.local().put(&doc)).await {
            Ok(rev) => rev,
            Err(SyncError::Store(StoreError::Conflict(_))) => return Err(inner.already_exists()),
            Err(e) => return Err(e),
        };
        doc.advance(rev);

        {
            let mut snapshot = inner.write_snapshot();
            if snapshot.as_ref().is_some_and(|d| !d.deleted) {
                return Err(inner.already_exists());
            }
            *snapshot = Some(doc.clone());
        }
        debug!("Created {}/{} at {:?}", self.collection(), inner.doc_id, doc.rev);
        inner.local_events.emit(LocalEvent::Created(doc.clone()));
        Ok(doc)
    }

    /// Load from the remote replica, failing on conflicting revisions.
    pub async fn load(&self) -> Result<Document> {
        self.load_with(ConflictPolicy::Reject).await
    }

    /// Load from the remote replica, handling conflicts per `policy`.
    pub async fn load_with(&self, policy: ConflictPolicy) -> Result<Document> {
        let inner = &self.inner;
        inner.check_alive()?;
        let remote = inner.handle.remote();
        let local = inner.handle.local();

        let mut doc = match inner.guarded(remote.get(&inner.doc_id)).await {
            Ok(doc) => doc,
            Err(SyncError::Store(StoreError::NotFound(_))) => {
                return Err(SyncError::DocumentNotFound {
                    collection: self.collection().to_string(),
                    doc_id: inner.doc_id.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        if !doc.conflicts.is_empty() {
            let primary = doc
                .rev
                .clone()
                .ok_or_else(|| StoreError::InvalidDocument(inner.doc_id.clone()))?;
            match policy {
                ConflictPolicy::Reject => {
                    return Err(SyncError::LoadConflict {
                        collection: self.collection().to_string(),
                        doc_id: inner.doc_id.clone(),
                        primary,
                        conflicts: doc.conflicts,
                    });
                }
                ConflictPolicy::KeepWinner => {
                    warn!(
                        "{}/{} has {} conflicting revision(s); keeping {} and discarding the rest",
                        self.collection(),
                        inner.doc_id,
                        doc.conflicts.len(),
                        primary
                    );
                    for loser in &doc.conflicts {
                        inner.guarded(remote.delete(&inner.doc_id, loser)).await?;
                    }
                    doc.conflicts.clear();
                }
            }
        }

        // Seed the local replica so local writes build on a revision it knows
        inner.guarded(local.put_replicated(&doc)).await?;
        if let Ok(local_doc) = inner.guarded(local.get(&inner.doc_id)).await {
            if relation(&doc.history(), &local_doc.history()) == RevisionRelation::Descendant {
                debug!("Local replica is ahead for {}, using {:?}", inner.doc_id, local_doc.rev);
                doc = local_doc;
                doc.conflicts.clear();
            }
        }

        *inner.write_snapshot() = Some(doc.clone());
        debug!("Loaded {}/{} at {:?}", self.collection(), inner.doc_id, doc.rev);
        inner.local_events.emit(LocalEvent::Loaded(doc.clone()));
        Ok(doc)
    }

    /// Merge `patch` into the snapshot now; the returned future persists it.
    ///
    /// The future resolves once the local replica has accepted the write.
    pub fn update(&self, patch: Fields) -> BoxFuture<'static, Result<Document>> {
        let inner = Arc::clone(&self.inner);
        if let Err(e) = inner.check_alive() {
            return future::ready(Err(e)).boxed();
        }
        {
            let mut snapshot = inner.write_snapshot();
            match snapshot.as_mut() {
                Some(doc) if !doc.deleted => doc.merge(patch.clone()),
                _ => return future::ready(Err(SyncError::NotLoaded(inner.doc_id.clone()))).boxed(),
            }
        }
        inner.local_events.emit(LocalEvent::Updating {
            doc_id: inner.doc_id.clone(),
            patch,
        });
        async move { inner.persist().await }.boxed()
    }

    /// Mark the snapshot deleted now; the returned future persists the tombstone.
    pub fn delete(&self) -> BoxFuture<'static, Result<Document>> {
        let inner = Arc::clone(&self.inner);
        if let Err(e) = inner.check_alive() {
            return future::ready(Err(e)).boxed();
        }
        {
            let mut snapshot = inner.write_snapshot();
            match snapshot.as_mut() {
                Some(doc) if !doc.deleted => doc.deleted = true,
                _ => return future::ready(Err(SyncError::NotLoaded(inner.doc_id.clone()))).boxed(),
            }
        }
        inner.local_events.emit(LocalEvent::Deleting {
            doc_id: inner.doc_id.clone(),
        });
        async move { inner.persist().await }.boxed()
    }

    /// Detach from the change feed and cancel in-flight store calls.
    pub fn destroy(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.feed.lock().unwrap_or_else(|e| e.into_inner()).take();
        debug!("Destroyed syncher for {}/{}", self.collection(), self.inner.doc_id);
    }
}

impl Inner {
    fn snapshot(&self) -> Option<Document> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_snapshot(&self) -> RwLockWriteGuard<'_, Option<Document>> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_alive(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Destroyed(self.doc_id.clone()))
        } else {
            Ok(())
        }
    }

    fn already_exists(&self) -> SyncError {
        SyncError::AlreadyExists {
            collection: self.handle.collection().to_string(),
            doc_id: self.doc_id.clone(),
        }
    }

    /// Run a store call under the operation deadline and our cancellation token.
    async fn guarded<T>(&self, op: impl Future<Output = store::Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.timeout, op) => match result {
                Ok(result) => result.map_err(SyncError::from),
                Err(_) => Err(SyncError::Timeout(self.timeout)),
            },
        }
    }

    /// Write the current snapshot (or its tombstone) to the local replica.
    async fn persist(&self) -> Result<Document> {
        let _write = self.write_lock.lock().await;
        let mut doc = self
            .snapshot()
            .ok_or_else(|| SyncError::NotLoaded(self.doc_id.clone()))?;
        let local = self.handle.local();
        let mut rebased = false;

        loop {
            let result = match (&doc.rev, doc.deleted) {
                (Some(rev), true) => self.guarded(local.delete(&self.doc_id, rev)).await,
                (None, true) => return Err(SyncError::NotLoaded(self.doc_id.clone())),
                (_, false) => self.guarded(local.put(&doc)).await,
            };

            match result {
                Ok(rev) => {
                    doc.advance(rev);
                    break;
                }
                Err(SyncError::Store(StoreError::Conflict(_))) if !rebased => {
                    // Someone else moved the document: keep our fields, write on top
                    let current = self.guarded(local.get(&self.doc_id)).await?;
                    debug!(
                        "Rebasing write of {} from {:?} onto {:?}",
                        self.doc_id, doc.rev, current.rev
                    );
                    doc.rev = current.rev;
                    doc.revisions = current.revisions;
                    rebased = true;
                }
                Err(e) => return Err(e),
            }
        }

        {
            let mut snapshot = self.write_snapshot();
            if let Some(current) = snapshot.as_mut() {
                if relation(&current.history(), &doc.history()) == RevisionRelation::Descendant {
                    current.rev = doc.rev.clone();
                    current.revisions = doc.revisions.clone();
                }
            }
        }

        if doc.deleted {
            debug!("Deleted {} at {:?}", self.doc_id, doc.rev);
            self.local_events.emit(LocalEvent::Deleted(doc.clone()));
        } else {
            debug!("Updated {} at {:?}", self.doc_id, doc.rev);
            self.local_events.emit(LocalEvent::Updated(doc.clone()));
        }
        Ok(doc)
    }

    /// Apply a change from the feed if it does not regress our revision.
    fn apply_remote(&self, incoming: Document) {
        let applied = {
            let mut snapshot = self.write_snapshot();
            let Some(current) = snapshot.as_mut() else {
                debug!("Ignoring remote change for {} (not loaded)", self.doc_id);
                return;
            };

            let accept = match relation(&current.history(), &incoming.history()) {
                RevisionRelation::Descendant => true,
                RevisionRelation::Concurrent => incoming.rev > current.rev,
                RevisionRelation::Same | RevisionRelation::Ancestor => false,
            };
            if !accept {
                debug!(
                    "Ignoring remote {:?} for {}: not newer than {:?}",
                    incoming.rev, self.doc_id, current.rev
                );
                return;
            }

            current.replace_fields(&incoming.fields);
            current.rev = incoming.rev.clone();
            current.revisions = incoming.history();
            current.deleted = incoming.deleted;
            current.conflicts = incoming.conflicts.clone();
            current.clone()
        };

        debug!("Applied remote {:?} to {}", applied.rev, self.doc_id);
        self.remote_events.emit(RemoteEvent::Changed(applied));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryProvider, StoreContext};
    use crate::store::{DocumentStore, InMemoryServer, WriteKind};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn manual() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.replication.continuous = false;
        config
    }

    struct Client {
        ctx: StoreContext,
        provider: Arc<MemoryProvider>,
    }

    impl Client {
        fn new(server: &Arc<InMemoryServer>) -> Self {
            let provider = Arc::new(MemoryProvider::new(Arc::clone(server)));
            Self {
                ctx: StoreContext::new(manual(), provider.clone()),
                provider,
            }
        }

        fn syncher(&self, doc_id: &str) -> JsonSyncher {
            let handle = self.ctx.open("net1").unwrap();
            JsonSyncher::new(handle, doc_id, Secret::new("s3cret"), self.ctx.config())
        }

        async fn sync(&self) {
            self.ctx.open("net1").unwrap().sync_now().await.unwrap();
        }
    }

    fn recorder<E: Clone + Send + 'static>() -> (Arc<Mutex<Vec<E>>>, impl Fn(E) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        (events, move |e| events_clone.lock().unwrap().push(e))
    }

    #[tokio::test]
    async fn test_create_then_load_on_other_client() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let b = Client::new(&server);

        let created = a
            .syncher("n1")
            .create(fields(json!({"data": {"label": "A"}})))
            .await
            .unwrap();
        a.sync().await;

        let loaded = b.syncher("n1").load().await.unwrap();
        assert_eq!(loaded.fields, created.fields);
        assert_eq!(loaded.rev, created.rev);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);

        let syncher = a.syncher("n1");
        syncher.create(Fields::new()).await.unwrap();
        assert!(matches!(
            syncher.create(Fields::new()).await,
            Err(SyncError::AlreadyExists { .. })
        ));

        // A second syncher for the same id sees the local replica's copy
        assert!(matches!(
            a.syncher("n1").create(Fields::new()).await,
            Err(SyncError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_document() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        assert_eq!(
            a.syncher("ghost").load().await.unwrap_err(),
            SyncError::DocumentNotFound {
                collection: "net1".into(),
                doc_id: "ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn test_update_is_visible_before_persisting() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let syncher = a.syncher("n1");
        let created = syncher.create(fields(json!({"b": 0}))).await.unwrap();

        let first = syncher.update(fields(json!({"a": 1})));
        assert_eq!(syncher.get_field("a"), Some(json!(1)));
        let second = syncher.update(fields(json!({"b": 2})));
        assert_eq!(syncher.get_field("a"), Some(json!(1)));
        assert_eq!(syncher.get_field("b"), Some(json!(2)));
        // Nothing confirmed yet
        assert_eq!(syncher.revision(), created.rev);

        first.await.unwrap();
        let persisted = second.await.unwrap();
        assert_eq!(persisted.get("a"), Some(&json!(1)));
        assert_eq!(persisted.get("b"), Some(&json!(2)));

        let stored = a.provider.local_store("net1").get("n1").await.unwrap();
        assert_eq!(stored.fields, persisted.fields);
        assert_eq!(syncher.revision(), stored.rev);
    }

    #[tokio::test]
    async fn test_update_emits_local_events_only() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let syncher = a.syncher("n1");
        syncher.create(Fields::new()).await.unwrap();

        let (local, on_local) = recorder::<LocalEvent>();
        let (remote, on_remote) = recorder::<RemoteEvent>();
        let _l = syncher.on_local(on_local);
        let _r = syncher.on_remote(on_remote);

        syncher.update(fields(json!({"a": 1}))).await.unwrap();

        let local = local.lock().unwrap();
        assert!(matches!(&local[0], LocalEvent::Updating { patch, .. } if patch["a"] == 1));
        assert!(matches!(&local[1], LocalEvent::Updated(doc) if doc.get("a") == Some(&json!(1))));
        assert!(remote.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_before_load_fails() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        assert_eq!(
            a.syncher("n1").update(Fields::new()).await.unwrap_err(),
            SyncError::NotLoaded("n1".into())
        );
    }

    #[tokio::test]
    async fn test_remote_change_is_applied_and_emitted() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let b = Client::new(&server);

        let on_a = a.syncher("n1");
        on_a.create(fields(json!({"data": {"label": "A"}}))).await.unwrap();
        a.sync().await;

        let on_b = b.syncher("n1");
        on_b.load().await.unwrap();
        let (remote, on_remote) = recorder::<RemoteEvent>();
        let _sub = on_b.on_remote(on_remote);

        on_a.update(fields(json!({"data": {"label": "B"}}))).await.unwrap();
        a.sync().await;
        b.sync().await;

        assert_eq!(on_b.get_field("data"), Some(json!({"label": "B"})));
        assert_eq!(on_b.revision(), on_a.revision());
        let remote = remote.lock().unwrap();
        assert_eq!(remote.len(), 1);
        assert!(matches!(&remote[0], RemoteEvent::Changed(doc) if doc.id == "n1"));
    }

    #[tokio::test]
    async fn test_stale_remote_change_is_ignored() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let syncher = a.syncher("n1");
        let old = syncher.create(fields(json!({"v": 1}))).await.unwrap();
        syncher.update(fields(json!({"v": 2}))).await.unwrap();

        let (remote, on_remote) = recorder::<RemoteEvent>();
        let _sub = syncher.on_remote(on_remote);
        syncher.inner.apply_remote(old.clone());
        syncher.inner.apply_remote(syncher.get().unwrap());

        assert_eq!(syncher.get_field("v"), Some(json!(2)));
        assert!(remote.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_remote_change_uses_revision_order() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let syncher = a.syncher("n1");
        let base = syncher.create(fields(json!({"v": 0}))).await.unwrap();
        let ours = syncher.update(fields(json!({"v": "ours"}))).await.unwrap();

        let mut theirs = base.clone();
        theirs.fields = fields(json!({"v": "theirs"}));
        let their_rev = Revision::next(base.rev.as_ref(), &theirs.fields, false);
        theirs.advance(their_rev.clone());

        syncher.inner.apply_remote(theirs);
        let expected = if Some(&their_rev) > ours.rev.as_ref() { "theirs" } else { "ours" };
        assert_eq!(syncher.get_field("v"), Some(json!(expected)));
    }

    #[tokio::test]
    async fn test_write_rebases_onto_newer_local_revision() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let syncher = a.syncher("n1");
        let created = syncher.create(fields(json!({"a": 1}))).await.unwrap();

        // Another writer on the same replica moves the document first
        let local = a.provider.local_store("net1");
        let mut other = created.clone();
        other.fields = fields(json!({"a": 1, "z": 9}));
        local.put(&other).await.unwrap();

        let persisted = syncher.update(fields(json!({"b": 2}))).await.unwrap();
        assert_eq!(persisted.rev.as_ref().unwrap().generation(), 3);
        assert_eq!(local.get("n1").await.unwrap().get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_delete_then_load_elsewhere() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let b = Client::new(&server);
        let syncher = a.syncher("n1");
        syncher.create(Fields::new()).await.unwrap();

        let deleting = syncher.delete();
        assert!(!syncher.is_loaded());
        let tombstone = deleting.await.unwrap();
        assert!(tombstone.deleted);
        a.sync().await;

        assert!(matches!(
            b.syncher("n1").load().await,
            Err(SyncError::DocumentNotFound { .. })
        ));
        assert_eq!(a.provider.local_store("net1").writes_for("n1", WriteKind::Delete), 1);
    }

    #[tokio::test]
    async fn test_load_conflict_policies() {
        let server = Arc::new(InMemoryServer::new());
        let remote = server.collection("net1");
        let base = Document::new("d", fields(json!({"v": 0})));
        let r1 = remote.put(&base).await.unwrap();

        // Two concurrent edits of r1 arrive at the server
        for value in ["x", "y"] {
            let mut branch = Document::new("d", fields(json!({"v": value})));
            let rev = Revision::next(Some(&r1), &branch.fields, false);
            branch.revisions = vec![r1.clone()];
            branch.advance(rev);
            remote.put_replicated(&branch).await.unwrap();
        }

        let a = Client::new(&server);
        let err = a.syncher("d").load().await.unwrap_err();
        let SyncError::LoadConflict { primary, conflicts, .. } = err else {
            panic!("expected a load conflict, got {err:?}");
        };
        assert_eq!(conflicts.len(), 1);
        assert!(primary > conflicts[0]);

        let doc = a.syncher("d").load_with(ConflictPolicy::KeepWinner).await.unwrap();
        assert_eq!(doc.rev, Some(primary));
        assert!(remote.get("d").await.unwrap().conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_detaches_and_rejects_writes() {
        let server = Arc::new(InMemoryServer::new());
        let a = Client::new(&server);
        let b = Client::new(&server);

        let on_a = a.syncher("n1");
        on_a.create(fields(json!({"v": 1}))).await.unwrap();
        a.sync().await;
        let on_b = b.syncher("n1");
        on_b.load().await.unwrap();
        on_b.destroy();

        assert!(on_b.is_destroyed());
        assert_eq!(
            on_b.update(Fields::new()).await.unwrap_err(),
            SyncError::Destroyed("n1".into())
        );

        on_a.update(fields(json!({"v": 2}))).await.unwrap();
        a.sync().await;
        b.sync().await;
        assert_eq!(on_b.get_field("v"), Some(json!(1)));
    }
}
