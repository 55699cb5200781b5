//! On-disk replicas: one JSON file per collection.
//!
//! A `FileStore` keeps the whole revision tree in an `InMemoryStore` and
//! rewrites `<dir>/<collection>.json` after every write (temp file + rename).

use async_trait::async_trait;
use netsync_core::adapter::StoreProvider;
use netsync_core::document::Document;
use netsync_core::revision::Revision;
use netsync_core::store::{self, Change, DocumentStore, InMemoryStore, StoreDump, StoreError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

pub struct FileStore {
    path: PathBuf,
    inner: InMemoryStore,
    /// Held across a write and its save, so a failed save rolls back only its own write
    save_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open the replica at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> store::Result<Self> {
        let path = path.into();
        let dump = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            serde_json::from_str::<StoreDump>(&contents)
                .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?
        } else {
            StoreDump::default()
        };
        debug!("Opened replica {} at seq {}", path.display(), dump.seq);

        Ok(Self {
            path,
            inner: InMemoryStore::import(dump),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// `<dir>/<collection>.json`
    pub fn collection_path(dir: &Path, collection: &str) -> PathBuf {
        dir.join(format!("{}.json", collection))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save the tree, or put `before` back if the file could not be written.
    /// A write is only visible once its save succeeded.
    async fn persist(&self, before: StoreDump) -> store::Result<()> {
        if let Err(e) = self.save().await {
            debug!("Save of {} failed, rolling back to seq {}", self.path.display(), before.seq);
            self.inner.restore(before);
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self) -> store::Result<()> {
        let contents = serde_json::to_vec_pretty(&self.inner.export())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, id: &str) -> store::Result<Document> {
        self.inner.get(id).await
    }

    async fn put(&self, doc: &Document) -> store::Result<Revision> {
        let _save = self.save_lock.lock().await;
        let before = self.inner.export();
        let rev = self.inner.put(doc).await?;
        self.persist(before).await?;
        Ok(rev)
    }

    async fn delete(&self, id: &str, rev: &Revision) -> store::Result<Revision> {
        let _save = self.save_lock.lock().await;
        let before = self.inner.export();
        let rev = self.inner.delete(id, rev).await?;
        self.persist(before).await?;
        Ok(rev)
    }

    async fn put_replicated(&self, doc: &Document) -> store::Result<Option<Document>> {
        let _save = self.save_lock.lock().await;
        let before = self.inner.export();
        let winner = self.inner.put_replicated(doc).await?;
        // Known revisions leave the tree untouched
        if self.inner.seq() != before.seq {
            self.persist(before).await?;
        }
        Ok(winner)
    }

    async fn changes(&self, since: u64) -> store::Result<Vec<Change>> {
        self.inner.changes(since).await
    }

    async fn all_documents(&self) -> store::Result<Vec<Document>> {
        self.inner.all_documents().await
    }

    fn watch_seq(&self) -> watch::Receiver<u64> {
        self.inner.watch_seq()
    }
}

/// Local replicas under `data_dir`, remote replicas under `remote_dir`.
pub struct FileProvider {
    data_dir: PathBuf,
    remote_dir: PathBuf,
    open: Mutex<HashMap<PathBuf, Arc<FileStore>>>,
}

impl FileProvider {
    pub fn new(data_dir: impl Into<PathBuf>, remote_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_dir: remote_dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self, path: PathBuf) -> store::Result<Arc<dyn DocumentStore>> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = open.get(&path) {
            return Ok(store.clone());
        }
        let store = Arc::new(FileStore::open(path.clone())?);
        open.insert(path, store.clone());
        Ok(store)
    }
}

impl StoreProvider for FileProvider {
    fn local(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>> {
        self.store(FileStore::collection_path(&self.data_dir, collection))
    }

    fn remote(&self, collection: &str) -> store::Result<Arc<dyn DocumentStore>> {
        self.store(FileStore::collection_path(&self.remote_dir, collection))
    }
}
