//! In-memory revision-tree store.
//!
//! Every document keeps its set of leaf revisions. Normal edits extend one
//! leaf; replicated revisions replace the leaves they descend from, or open a
//! new branch (a conflict) when they descend from none of them.

use super::{Change, DocumentStore, Result, StoreError};
use crate::document::{Document, Fields, is_private};
use crate::revision::{REVS_LIMIT, Revision};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Kind of store call recorded in the write log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    Put,
    Delete,
    Replicated,
}

/// One successful write, in the order the store accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    pub id: String,
    pub rev: Revision,
}

/// Live leaves beat tombstones, then the highest revision wins.
fn winner(leaves: &[Document]) -> Option<&Document> {
    leaves
        .iter()
        .max_by(|a, b| (!a.deleted, &a.rev).cmp(&(!b.deleted, &b.rev)))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Entry {
    seq: u64,
    leaves: Vec<Document>,
}

impl Entry {
    fn winner(&self) -> Option<&Document> {
        winner(&self.leaves)
    }

    /// Winner with the other live leaves listed as conflicts.
    fn resolved(&self) -> Option<Document> {
        let winner = self.winner()?;
        let mut doc = winner.clone();
        let mut conflicts: Vec<Revision> = self
            .leaves
            .iter()
            .filter(|leaf| !leaf.deleted && leaf.rev != winner.rev)
            .filter_map(|leaf| leaf.rev.clone())
            .collect();
        conflicts.sort_by(|a, b| b.cmp(a));
        doc.conflicts = conflicts;
        Some(doc)
    }

    fn knows(&self, rev: &Revision) -> bool {
        self.leaves.iter().any(|leaf| leaf.revisions.contains(rev))
    }
}

/// Serializable image of a whole store, used for on-disk replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDump {
    pub seq: u64,
    documents: BTreeMap<String, Entry>,
}

#[derive(Default)]
struct StoreState {
    seq: u64,
    docs: BTreeMap<String, Entry>,
    writes: Vec<WriteRecord>,
}

/// In-memory replica.
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
    seq_tx: watch::Sender<u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::import(StoreDump::default())
    }

    /// Rebuild a store from a dump.
    pub fn import(dump: StoreDump) -> Self {
        let (seq_tx, _) = watch::channel(dump.seq);
        Self {
            state: Mutex::new(StoreState {
                seq: dump.seq,
                docs: dump.documents,
                writes: Vec::new(),
            }),
            available: AtomicBool::new(true),
            seq_tx,
        }
    }

    pub fn export(&self) -> StoreDump {
        let state = self.lock();
        StoreDump {
            seq: state.seq,
            documents: state.docs.clone(),
        }
    }

    /// Replace the revision tree with `dump`. The write log is kept.
    pub fn restore(&self, dump: StoreDump) {
        let mut state = self.lock();
        state.seq = dump.seq;
        state.docs = dump.documents;
        self.seq_tx.send_replace(dump.seq);
    }

    /// Sequence number of the latest write.
    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    /// Simulate an outage: while unavailable every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful writes so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Writes of the given kind for one document.
    pub fn writes_for(&self, id: &str, kind: WriteKind) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.id == id && w.kind == kind)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".into()))
        }
    }

    /// Build the child of `parent` carrying `fields`.
    fn child(id: &str, parent: Option<&Document>, fields: &Fields, deleted: bool) -> Document {
        let fields: Fields = if deleted {
            Fields::new()
        } else {
            fields
                .iter()
                .filter(|(key, _)| !is_private(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        let rev = Revision::next(parent.and_then(|p| p.rev.as_ref()), &fields, deleted);
        let mut revisions = vec![rev.clone()];
        if let Some(parent) = parent {
            revisions.extend(parent.revisions.iter().cloned());
        }
        revisions.truncate(REVS_LIMIT);

        Document {
            id: id.to_string(),
            rev: Some(rev),
            revisions,
            deleted,
            conflicts: Vec::new(),
            fields,
        }
    }

    fn commit(&self, state: &mut StoreState, id: &str, kind: WriteKind, rev: Revision) {
        state.seq += 1;
        let seq = state.seq;
        if let Some(entry) = state.docs.get_mut(id) {
            entry.seq = seq;
        }
        state.writes.push(WriteRecord {
            kind,
            id: id.to_string(),
            rev,
        });
        self.seq_tx.send_replace(seq);
    }

    /// Apply an edit to the leaf named by `rev` (or start/revive the document).
    fn edit(&self, id: &str, rev: Option<&Revision>, fields: &Fields, deleted: bool) -> Result<Revision> {
        self.check_available()?;
        let mut state = self.lock();
        let leaves = state.docs.get(id).map(|e| e.leaves.as_slice()).unwrap_or(&[]);

        let parent_index = match rev {
            Some(rev) => Some(
                leaves
                    .iter()
                    .position(|leaf| leaf.rev.as_ref() == Some(rev) && !leaf.deleted)
                    .ok_or_else(|| StoreError::Conflict(id.to_string()))?,
            ),
            None if leaves.is_empty() => None,
            // Recreating a deleted document continues its tombstone branch
            None => match winner(leaves) {
                Some(w) if w.deleted => leaves.iter().position(|leaf| leaf.rev == w.rev),
                _ => return Err(StoreError::Conflict(id.to_string())),
            },
        };
        if deleted && parent_index.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let child = Self::child(id, parent_index.map(|i| &leaves[i]), fields, deleted);
        let new_rev = child
            .rev
            .clone()
            .ok_or_else(|| StoreError::InvalidDocument(id.to_string()))?;

        let entry = state.docs.entry(id.to_string()).or_default();
        match parent_index {
            Some(i) => entry.leaves[i] = child,
            None => entry.leaves.push(child),
        }

        let kind = if deleted { WriteKind::Delete } else { WriteKind::Put };
        debug!("{:?} {} -> {}", kind, id, new_rev);
        self.commit(&mut state, id, kind, new_rev.clone());
        Ok(new_rev)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, id: &str) -> Result<Document> {
        self.check_available()?;
        let state = self.lock();
        state
            .docs
            .get(id)
            .and_then(Entry::resolved)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put(&self, doc: &Document) -> Result<Revision> {
        self.edit(&doc.id, doc.rev.as_ref(), &doc.fields, doc.deleted)
    }

    async fn delete(&self, id: &str, rev: &Revision) -> Result<Revision> {
        self.check_available()?;
        if !self.lock().docs.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.edit(id, Some(rev), &Fields::new(), true)
    }

    async fn put_replicated(&self, doc: &Document) -> Result<Option<Document>> {
        self.check_available()?;
        let rev = doc
            .rev
            .clone()
            .ok_or_else(|| StoreError::InvalidDocument(format!("{} has no revision", doc.id)))?;
        let history = doc.history();

        let mut state = self.lock();
        if state.docs.get(&doc.id).is_some_and(|entry| entry.knows(&rev)) {
            return Ok(None);
        }
        let entry = state.docs.entry(doc.id.clone()).or_default();

        let before = entry.winner().map(|w| (w.rev.clone(), w.deleted));
        entry
            .leaves
            .retain(|leaf| leaf.rev.as_ref().is_none_or(|r| !history.contains(r)));
        entry.leaves.push(Document {
            revisions: history,
            conflicts: Vec::new(),
            ..doc.clone()
        });

        let after = entry.winner().map(|w| (w.rev.clone(), w.deleted));
        let winner = if before != after { entry.resolved() } else { None };
        self.commit(&mut state, &doc.id, WriteKind::Replicated, rev);
        Ok(winner)
    }

    async fn changes(&self, since: u64) -> Result<Vec<Change>> {
        self.check_available()?;
        let state = self.lock();
        let mut changes: Vec<Change> = state
            .docs
            .iter()
            .filter(|(_, entry)| entry.seq > since)
            .map(|(id, entry)| Change {
                seq: entry.seq,
                id: id.clone(),
                leaves: entry.leaves.clone(),
            })
            .collect();
        changes.sort_by_key(|change| change.seq);
        Ok(changes)
    }

    async fn all_documents(&self) -> Result<Vec<Document>> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .docs
            .values()
            .filter_map(Entry::resolved)
            .filter(|doc| !doc.deleted)
            .collect())
    }

    fn watch_seq(&self) -> watch::Receiver<u64> {
        self.seq_tx.subscribe()
    }
}

/// Shared stand-in for a remote database server: one store per collection.
#[derive(Default)]
pub struct InMemoryServer {
    collections: Mutex<HashMap<String, Arc<InMemoryStore>>>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `name`, created on first use.
    pub fn collection(&self, name: &str) -> Arc<InMemoryStore> {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(InMemoryStore::new())),
        )
    }
}
