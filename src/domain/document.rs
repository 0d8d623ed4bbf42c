//! Persisted form of a read model

use serde::{Deserialize, Serialize};

use super::{AggregateVersion, Position, ReadModelState, Signature};

/// A read model as stored in its collection.
///
/// Versioning metadata lives next to the business body so the store can
/// evaluate write guards and version-only updates without touching `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModelDocument {
    #[serde(flatten)]
    pub state: ReadModelState,
    pub body: serde_json::Value,
}

impl ReadModelDocument {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn version(&self) -> DocumentVersion {
        self.state.version()
    }
}

/// Partial read of a stored document: the fields write guards compare
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: String,
    pub aggregate_version: AggregateVersion,
    pub readmodel_version: Signature,
    pub projected_position: Position,
}
