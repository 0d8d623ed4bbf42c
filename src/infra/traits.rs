//! Trait definitions for the collaborators of the projection core

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    AggregateVersion, Changeset, CheckpointRecord, DocumentVersion, Position, ReadModelDocument,
    Signature,
};

use super::{BulkWriteResult, FaultMarker, Result, VersionUpdate, WriteGuard, WriteOperation};

/// Append-only event log with per-stream and global ordering.
///
/// Paged reads stand in for a subscription: the caller stops early simply by
/// not requesting the next page.
#[async_trait]
pub trait EventLog<E: Send + Sync + 'static>: Send + Sync {
    /// Changesets of one aggregate with `aggregate_version >= from_version`,
    /// in increasing version order
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: AggregateVersion,
        limit: usize,
    ) -> Result<Vec<Changeset<E>>>;

    /// Changesets of all aggregates with `position > after_position`,
    /// in increasing position order
    async fn read_all(&self, after_position: Position, limit: usize) -> Result<Vec<Changeset<E>>>;

    /// Highest position written so far (0 for an empty log)
    async fn last_position(&self) -> Result<Position>;
}

/// Collection-scoped document storage for read models.
///
/// Conditional operations evaluate their guard atomically on the stored
/// document; a guard that does not match is reported as `false`, not as an
/// error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collection and its `(projected_position, readmodel_version, id)` index
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<ReadModelDocument>>;

    /// Read only the version fields of the given ids; missing ids are omitted
    async fn find_versions(&self, collection: &str, ids: &[String])
        -> Result<Vec<DocumentVersion>>;

    /// Insert a new document; `ProjectionError::DuplicateKey` if the id exists
    async fn insert(&self, collection: &str, document: &ReadModelDocument) -> Result<()>;

    /// Replace the stored document if it exists and `guard` admits it
    async fn replace_if(
        &self,
        collection: &str,
        document: &ReadModelDocument,
        guard: WriteGuard,
    ) -> Result<bool>;

    /// Update only the version fields if the stored document admits `update`
    async fn update_version_if(&self, collection: &str, update: &VersionUpdate) -> Result<bool>;

    /// Flag the stored document faulted if its version still matches `marker`
    async fn mark_faulted_if(&self, collection: &str, marker: &FaultMarker) -> Result<bool>;

    /// Unordered bulk write; per-item failures are reported, not raised
    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOperation>,
    ) -> Result<BulkWriteResult>;

    /// Documents with `readmodel_version < signature` and
    /// `projected_position > after_position`, oldest position first
    async fn find_stale(
        &self,
        collection: &str,
        signature: Signature,
        after_position: Position,
        limit: usize,
    ) -> Result<Vec<DocumentVersion>>;
}

/// Durable storage for checkpoint records, keyed by read-model name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<CheckpointRecord>>;

    /// Upsert every record in one unordered bulk write
    async fn upsert_many(&self, records: &[CheckpointRecord]) -> Result<()>;
}
