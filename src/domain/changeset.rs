//! Changesets: the unit of delivery from the event log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AggregateVersion, Position};

/// One or more events appended atomically to one aggregate stream.
///
/// A changeset is immutable once created; everything is exposed through
/// accessors only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset<E> {
    aggregate_id: String,
    aggregate_version: AggregateVersion,
    position: Position,
    timestamp: DateTime<Utc>,
    events: Vec<E>,
}

impl<E> Changeset<E> {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_version: AggregateVersion,
        position: Position,
        timestamp: DateTime<Utc>,
        events: Vec<E>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_version,
            position,
            timestamp,
            events,
        }
    }

    /// Id of the aggregate stream this changeset belongs to
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Version of the stream after applying this changeset
    pub fn aggregate_version(&self) -> AggregateVersion {
        self.aggregate_version
    }

    /// Global log position (checkpoint token)
    pub fn position(&self) -> Position {
        self.position
    }

    /// Wall-clock time the changeset was committed
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
