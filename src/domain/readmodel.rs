//! Read-model contract and idempotent changeset application
//!
//! A read-model type implements [`ReadModel`]: it names itself, declares the
//! schema signature of the running code, and maps each event variant to a
//! handler with a plain `match`. [`AtomicReadModel`] wraps that business state
//! with the versioning metadata that makes application replay-safe.
//!
//! # Application rules
//!
//! - A changeset whose aggregate version is not above the current one is a
//!   no-op (duplicate or late delivery) and reports `false`.
//! - Otherwise every event is offered to the handler; the changeset reports
//!   `true` iff at least one event was handled.
//! - Versions and position advance even when nothing was handled, so the
//!   model always records "seen everything up to X".

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{
    AggregateVersion, Changeset, DocumentVersion, Position, ReadModelDocument, Signature,
    RECENT_VERSIONS_CAPACITY,
};
use crate::infra::{ProjectionError, Result, WriteGuard};

/// Failure raised by a read-model event handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Business side of a read model.
///
/// `apply` returns `Ok(false)` for event variants the model has no handler
/// for; that is not an error.
pub trait ReadModel:
    fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Event type carried by the changesets this model consumes
    type Event: Send + Sync + 'static;

    /// Stable logical name; also names the collection and the checkpoint
    const NAME: &'static str;

    /// Schema version of the running code
    const SIGNATURE: Signature;

    /// Empty state for a new aggregate instance
    fn create(id: &str) -> Self;

    /// Apply one event from the model's own stream
    fn apply(&mut self, event: &Self::Event) -> std::result::Result<bool, HandlerError>;

    /// Apply one event from another aggregate's stream
    fn apply_extra_stream(
        &mut self,
        aggregate_id: &str,
        event: &Self::Event,
    ) -> std::result::Result<bool, HandlerError> {
        let _ = aggregate_id;
        self.apply(event)
    }
}

/// Versioning metadata shared by every read model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadModelState {
    pub id: String,
    pub aggregate_version: AggregateVersion,
    pub projected_position: Position,
    #[serde(default)]
    pub last_processed_versions: Vec<AggregateVersion>,
    pub readmodel_version: Signature,
    #[serde(default)]
    pub faulted: bool,
    #[serde(default)]
    pub fault_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl ReadModelState {
    pub fn new(id: impl Into<String>, signature: Signature) -> Self {
        Self {
            id: id.into(),
            aggregate_version: 0,
            projected_position: 0,
            last_processed_versions: Vec::new(),
            readmodel_version: signature,
            faulted: false,
            fault_retry_count: 0,
            last_error: None,
            last_processed_at: None,
        }
    }

    pub fn version(&self) -> DocumentVersion {
        DocumentVersion {
            id: self.id.clone(),
            aggregate_version: self.aggregate_version,
            readmodel_version: self.readmodel_version,
            projected_position: self.projected_position,
        }
    }

    pub fn has_processed(&self, version: AggregateVersion) -> bool {
        self.last_processed_versions.contains(&version)
    }

    fn remember_version(&mut self, version: AggregateVersion) {
        self.last_processed_versions.push(version);
        if self.last_processed_versions.len() > RECENT_VERSIONS_CAPACITY {
            let excess = self.last_processed_versions.len() - RECENT_VERSIONS_CAPACITY;
            self.last_processed_versions.drain(..excess);
        }
    }
}

/// One read-model instance: business state plus versioning metadata.
///
/// An instance is owned by whichever operation is processing it; it is never
/// shared mutably between concurrent appliers.
#[derive(Debug, Clone)]
pub struct AtomicReadModel<M: ReadModel> {
    state: ReadModelState,
    data: M,
    modified_with_extra_stream_events: bool,
}

impl<M: ReadModel> AtomicReadModel<M> {
    /// Fresh instance at version 0, stamped with the running signature
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let data = M::create(&id);
        Self {
            state: ReadModelState::new(id, M::SIGNATURE),
            data,
            modified_with_extra_stream_events: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn aggregate_version(&self) -> AggregateVersion {
        self.state.aggregate_version
    }

    pub fn projected_position(&self) -> Position {
        self.state.projected_position
    }

    pub fn readmodel_version(&self) -> Signature {
        self.state.readmodel_version
    }

    pub fn last_processed_versions(&self) -> &[AggregateVersion] {
        &self.state.last_processed_versions
    }

    pub fn is_faulted(&self) -> bool {
        self.state.faulted
    }

    pub fn fault_retry_count(&self) -> u32 {
        self.state.fault_retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.state.last_error.as_deref()
    }

    /// Set once events from another stream were applied; such an instance
    /// must not be persisted through the normal write path.
    pub fn modified_with_extra_stream_events(&self) -> bool {
        self.modified_with_extra_stream_events
    }

    pub fn state(&self) -> &ReadModelState {
        &self.state
    }

    pub fn data(&self) -> &M {
        &self.data
    }

    pub fn into_data(self) -> M {
        self.data
    }

    pub fn version(&self) -> DocumentVersion {
        self.state.version()
    }

    /// Apply a changeset from this model's own stream.
    ///
    /// Returns whether any event was dispatched to a handler. A handler error
    /// leaves versions and position at the last successfully applied
    /// changeset.
    pub fn process_changeset(&mut self, changeset: &Changeset<M::Event>) -> Result<bool> {
        if changeset.aggregate_id() != self.state.id {
            return Err(ProjectionError::StreamMismatch {
                expected: self.state.id.clone(),
                actual: changeset.aggregate_id().to_string(),
            });
        }

        let version = changeset.aggregate_version();
        if version <= self.state.aggregate_version {
            if self.state.has_processed(version) {
                debug!(
                    read_model = M::NAME,
                    aggregate_id = %self.state.id,
                    aggregate_version = version,
                    "Duplicate changeset, skipping"
                );
            } else {
                debug!(
                    read_model = M::NAME,
                    aggregate_id = %self.state.id,
                    aggregate_version = version,
                    current_version = self.state.aggregate_version,
                    "Changeset older than current version, skipping"
                );
            }
            return Ok(false);
        }

        let mut handled = false;
        for event in changeset.events() {
            let applied = self
                .data
                .apply(event)
                .map_err(|source| ProjectionError::Handler {
                    read_model: M::NAME.to_string(),
                    aggregate_id: self.state.id.clone(),
                    aggregate_version: version,
                    source,
                })?;
            handled |= applied;
        }

        self.advance(changeset);
        Ok(handled)
    }

    /// Apply a changeset from a different aggregate's stream.
    ///
    /// Versions are untouched; the instance is flagged so only the
    /// version-only update path may persist it afterwards.
    pub fn process_extra_stream_changeset(
        &mut self,
        changeset: &Changeset<M::Event>,
    ) -> Result<bool> {
        self.modified_with_extra_stream_events = true;

        let mut handled = false;
        for event in changeset.events() {
            let applied = self
                .data
                .apply_extra_stream(changeset.aggregate_id(), event)
                .map_err(|source| ProjectionError::Handler {
                    read_model: M::NAME.to_string(),
                    aggregate_id: self.state.id.clone(),
                    aggregate_version: changeset.aggregate_version(),
                    source,
                })?;
            handled |= applied;
        }
        Ok(handled)
    }

    /// Mark the instance as faulted; versions stay at the last good point
    pub fn mark_faulted(&mut self, error: &dyn fmt::Display) {
        self.state.faulted = true;
        self.state.last_error = Some(error.to_string());
    }

    pub fn increment_fault_retry(&mut self) {
        self.state.fault_retry_count = self.state.fault_retry_count.saturating_add(1);
    }

    /// Whether this instance would win a checked write against `stored`
    pub fn is_newer_than(&self, stored: &DocumentVersion) -> bool {
        WriteGuard::checked(&self.version()).admits(stored)
    }

    pub fn to_document(&self) -> Result<ReadModelDocument> {
        Ok(ReadModelDocument {
            state: self.state.clone(),
            body: serde_json::to_value(&self.data)?,
        })
    }

    /// Rebuild an instance from storage; fails when the body no longer
    /// deserializes into the running model type.
    pub fn from_document(document: ReadModelDocument) -> Result<Self> {
        let data: M = serde_json::from_value(document.body)?;
        Ok(Self {
            state: document.state,
            data,
            modified_with_extra_stream_events: false,
        })
    }

    fn advance(&mut self, changeset: &Changeset<M::Event>) {
        self.state.aggregate_version = changeset.aggregate_version();
        self.state.projected_position = self.state.projected_position.max(changeset.position());
        self.state.remember_version(changeset.aggregate_version());
        self.state.last_processed_at = Some(changeset.timestamp());
    }
}
