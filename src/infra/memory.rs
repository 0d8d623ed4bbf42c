//! In-memory collaborators for development and testing
//!
//! Each store keeps its state behind one `tokio::sync::RwLock`; guards are
//! evaluated while the write lock is held, which makes every conditional write
//! atomic with respect to concurrent writers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{
    AggregateVersion, Changeset, CheckpointRecord, DocumentVersion, Position, ReadModelDocument,
    Signature,
};

use super::{
    BulkWriteFailure, BulkWriteResult, CheckpointStore, DocumentStore, EventLog, FaultMarker,
    ProjectionError, Result, VersionUpdate, WriteGuard, WriteOperation,
};

// ============================================================================
// Event log
// ============================================================================

struct LogState<E> {
    changesets: Vec<Changeset<E>>,
    /// stream id -> indexes into `changesets`, in version order
    streams: HashMap<String, Vec<usize>>,
}

/// Append-only event log held in memory
pub struct InMemoryEventLog<E> {
    state: RwLock<LogState<E>>,
}

impl<E: Clone + Send + Sync + 'static> InMemoryEventLog<E> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                changesets: Vec::new(),
                streams: HashMap::new(),
            }),
        }
    }

    /// Append one changeset to `aggregate_id`, stamped with the current time
    pub async fn append(&self, aggregate_id: &str, events: Vec<E>) -> Changeset<E> {
        self.append_at(aggregate_id, Utc::now(), events).await
    }

    /// Append with an explicit commit timestamp
    pub async fn append_at(
        &self,
        aggregate_id: &str,
        timestamp: DateTime<Utc>,
        events: Vec<E>,
    ) -> Changeset<E> {
        let mut state = self.state.write().await;

        let index = state.changesets.len();
        let position = index as Position + 1;
        let stream = state.streams.entry(aggregate_id.to_string()).or_default();
        let version = stream.len() as AggregateVersion + 1;
        stream.push(index);

        let changeset = Changeset::new(aggregate_id, version, position, timestamp, events);
        state.changesets.push(changeset.clone());
        changeset
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.changesets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<E: Clone + Send + Sync + 'static> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> EventLog<E> for InMemoryEventLog<E> {
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: AggregateVersion,
        limit: usize,
    ) -> Result<Vec<Changeset<E>>> {
        let state = self.state.read().await;
        let Some(indexes) = state.streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        // versions are 1-based and dense, so version v lives at slot v - 1
        let start = from_version.max(1) as usize - 1;
        Ok(indexes
            .iter()
            .skip(start)
            .take(limit)
            .map(|&i| state.changesets[i].clone())
            .collect())
    }

    async fn read_all(&self, after_position: Position, limit: usize) -> Result<Vec<Changeset<E>>> {
        let state = self.state.read().await;
        let start = after_position.max(0) as usize;
        Ok(state
            .changesets
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_position(&self) -> Result<Position> {
        Ok(self.state.read().await.changesets.len() as Position)
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Document store keeping each collection in a `HashMap`
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, HashMap<String, ReadModelDocument>>>,
    writes: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Store a document unconditionally, bypassing every guard
    pub async fn put_raw(&self, collection: &str, document: ReadModelDocument) {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(document.id().to_string(), document);
    }

    pub async fn get_raw(&self, collection: &str, id: &str) -> Option<ReadModelDocument> {
        let collections = self.collections.read().await;
        collections.get(collection).and_then(|c| c.get(id)).cloned()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, HashMap::len)
    }

    /// Number of documents inserted, replaced or version-updated so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn insert_locked(
        &self,
        documents: &mut HashMap<String, ReadModelDocument>,
        collection: &str,
        document: &ReadModelDocument,
    ) -> Result<()> {
        if documents.contains_key(document.id()) {
            return Err(ProjectionError::DuplicateKey {
                collection: collection.to_string(),
                id: document.id().to_string(),
            });
        }
        documents.insert(document.id().to_string(), document.clone());
        self.record_write();
        Ok(())
    }

    fn replace_locked(
        &self,
        documents: &mut HashMap<String, ReadModelDocument>,
        document: &ReadModelDocument,
        guard: WriteGuard,
    ) -> bool {
        match documents.get_mut(document.id()) {
            Some(stored) if guard.admits(&stored.version()) => {
                *stored = document.clone();
                self.record_write();
                true
            }
            _ => false,
        }
    }

    fn update_version_locked(
        &self,
        documents: &mut HashMap<String, ReadModelDocument>,
        update: &VersionUpdate,
    ) -> bool {
        match documents.get_mut(&update.id) {
            Some(stored) if update.admits(&stored.version()) => {
                update.apply_to(&mut stored.state);
                self.record_write();
                true
            }
            _ => false,
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<ReadModelDocument>> {
        Ok(self.get_raw(collection, id).await)
    }

    async fn find_versions(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<DocumentVersion>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| documents.get(id))
            .map(ReadModelDocument::version)
            .collect())
    }

    async fn insert(&self, collection: &str, document: &ReadModelDocument) -> Result<()> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        self.insert_locked(documents, collection, document)
    }

    async fn replace_if(
        &self,
        collection: &str,
        document: &ReadModelDocument,
        guard: WriteGuard,
    ) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        Ok(self.replace_locked(documents, document, guard))
    }

    async fn update_version_if(&self, collection: &str, update: &VersionUpdate) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        Ok(self.update_version_locked(documents, update))
    }

    async fn mark_faulted_if(&self, collection: &str, marker: &FaultMarker) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        match documents.get_mut(&marker.id) {
            Some(stored) if marker.admits(&stored.version()) => {
                marker.apply_to(&mut stored.state);
                self.record_write();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOperation>,
    ) -> Result<BulkWriteResult> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection.to_string()).or_default();
        let mut result = BulkWriteResult::default();

        for operation in operations {
            match operation {
                WriteOperation::Insert(document) => {
                    match self.insert_locked(documents, collection, &document) {
                        Ok(()) => result.inserted += 1,
                        Err(e) => result.failures.push(BulkWriteFailure {
                            id: document.id().to_string(),
                            duplicate_key: matches!(e, ProjectionError::DuplicateKey { .. }),
                            message: e.to_string(),
                        }),
                    }
                }
                WriteOperation::Replace { document, guard } => {
                    if self.replace_locked(documents, &document, guard) {
                        result.modified += 1;
                    } else {
                        result.unmatched += 1;
                    }
                }
                WriteOperation::UpdateVersion(update) => {
                    if self.update_version_locked(documents, &update) {
                        result.modified += 1;
                    } else {
                        result.unmatched += 1;
                    }
                }
            }
        }

        Ok(result)
    }

    async fn find_stale(
        &self,
        collection: &str,
        signature: Signature,
        after_position: Position,
        limit: usize,
    ) -> Result<Vec<DocumentVersion>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut stale: Vec<DocumentVersion> = documents
            .values()
            .map(ReadModelDocument::version)
            .filter(|v| v.readmodel_version < signature && v.projected_position > after_position)
            .collect();
        stale.sort_by(|a, b| {
            (a.projected_position, a.readmodel_version, &a.id).cmp(&(
                b.projected_position,
                b.readmodel_version,
                &b.id,
            ))
        });
        stale.truncate(limit);
        Ok(stale)
    }
}

// ============================================================================
// Checkpoint store
// ============================================================================

/// Checkpoint store keyed by read-model name
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, CheckpointRecord>>,
    upserts: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Store seeded with records persisted by an earlier run
    pub fn with_records(records: impl IntoIterator<Item = CheckpointRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.name.clone(), r)).collect()),
            upserts: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, name: &str) -> Option<CheckpointRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// Number of `upsert_many` calls so far
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_all(&self) -> Result<Vec<CheckpointRecord>> {
        let records = self.records.read().await;
        let mut all: Vec<CheckpointRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn upsert_many(&self, records: &[CheckpointRecord]) -> Result<()> {
        let mut stored = self.records.write().await;
        for record in records {
            let mut record = record.clone();
            if let Some(previous) = stored.get(&record.name) {
                record.position = record.position.max(previous.position);
            }
            stored.insert(record.name.clone(), record);
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
