//! Conditional write predicates and bulk write operations
//!
//! Guards are evaluated by the document store itself (inside its write lock or
//! in the `WHERE` clause), so two writers racing on one id resolve to
//! "highest version wins" regardless of interleaving.

use crate::domain::{
    AggregateVersion, DocumentVersion, Position, ReadModelDocument, ReadModelState, Signature,
};

/// Predicate a stored document must satisfy before it is replaced.
///
/// The stored `readmodel_version` may never exceed the candidate's, so schema
/// upgrades are never downgraded. A checked guard (`require_newer`) also
/// demands a strictly newer `(aggregate_version, readmodel_version)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGuard {
    pub aggregate_version: AggregateVersion,
    pub readmodel_version: Signature,
    pub require_newer: bool,
}

impl WriteGuard {
    /// Replace only when the candidate is strictly newer
    pub fn checked(candidate: &DocumentVersion) -> Self {
        Self {
            aggregate_version: candidate.aggregate_version,
            readmodel_version: candidate.readmodel_version,
            require_newer: true,
        }
    }

    /// Replace regardless of business version, still refusing signature downgrades
    pub fn force(candidate: &DocumentVersion) -> Self {
        Self {
            aggregate_version: candidate.aggregate_version,
            readmodel_version: candidate.readmodel_version,
            require_newer: false,
        }
    }

    pub fn admits(&self, stored: &DocumentVersion) -> bool {
        if stored.readmodel_version > self.readmodel_version {
            return false;
        }
        if !self.require_newer {
            return true;
        }
        stored.aggregate_version < self.aggregate_version
            || (stored.aggregate_version == self.aggregate_version
                && stored.readmodel_version < self.readmodel_version)
    }
}

/// Version-only update: records progress without touching business fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionUpdate {
    pub id: String,
    pub aggregate_version: AggregateVersion,
    pub readmodel_version: Signature,
    pub projected_position: Position,
    pub last_processed_versions: Vec<AggregateVersion>,
}

impl VersionUpdate {
    pub fn from_state(state: &ReadModelState) -> Self {
        Self {
            id: state.id.clone(),
            aggregate_version: state.aggregate_version,
            readmodel_version: state.readmodel_version,
            projected_position: state.projected_position,
            last_processed_versions: state.last_processed_versions.clone(),
        }
    }

    pub fn admits(&self, stored: &DocumentVersion) -> bool {
        stored.aggregate_version < self.aggregate_version
            && stored.readmodel_version <= self.readmodel_version
    }

    /// Copy the tracked fields onto a stored state
    pub fn apply_to(&self, state: &mut ReadModelState) {
        state.aggregate_version = self.aggregate_version;
        state.projected_position = self.projected_position;
        state.last_processed_versions = self.last_processed_versions.clone();
    }
}

/// Fault flag written onto a stored document in place.
///
/// Applies only while the stored version still equals the one the failure was
/// observed against; body and version fields are never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultMarker {
    pub id: String,
    pub aggregate_version: AggregateVersion,
    pub readmodel_version: Signature,
    pub last_error: String,
    /// Count this failure against the retry budget
    pub increment_retry: bool,
}

impl FaultMarker {
    pub fn new(stored: &DocumentVersion, error: &dyn std::fmt::Display) -> Self {
        Self {
            id: stored.id.clone(),
            aggregate_version: stored.aggregate_version,
            readmodel_version: stored.readmodel_version,
            last_error: error.to_string(),
            increment_retry: false,
        }
    }

    pub fn with_retry_increment(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn admits(&self, stored: &DocumentVersion) -> bool {
        stored.aggregate_version == self.aggregate_version
            && stored.readmodel_version == self.readmodel_version
    }

    pub fn apply_to(&self, state: &mut ReadModelState) {
        state.faulted = true;
        state.last_error = Some(self.last_error.clone());
        if self.increment_retry {
            state.fault_retry_count = state.fault_retry_count.saturating_add(1);
        }
    }
}

/// One item of an unordered bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Insert(ReadModelDocument),
    Replace {
        document: ReadModelDocument,
        guard: WriteGuard,
    },
    UpdateVersion(VersionUpdate),
}

impl WriteOperation {
    pub fn id(&self) -> &str {
        match self {
            WriteOperation::Insert(document) => document.id(),
            WriteOperation::Replace { document, .. } => document.id(),
            WriteOperation::UpdateVersion(update) => &update.id,
        }
    }
}

/// Item of a bulk write that did not apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteFailure {
    pub id: String,
    pub duplicate_key: bool,
    pub message: String,
}

/// Outcome of an unordered bulk write.
///
/// `unmatched` counts conditional operations whose guard filtered them out;
/// that is the expected result of losing a version race, not a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub modified: usize,
    pub unmatched: usize,
    pub failures: Vec<BulkWriteFailure>,
}

impl BulkWriteResult {
    pub fn written(&self) -> usize {
        self.inserted + self.modified
    }
}
