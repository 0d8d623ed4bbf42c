//! Durable checkpoint record, one per read-model type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Position;

/// How far a read-model type has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Read-model name (unique key)
    pub name: String,

    /// Last dispatched global log position
    pub position: Position,

    /// Persisted by an earlier run but not registered by this one
    pub readmodel_missing: bool,

    /// False while a brand-new read-model type still has to be fast-forwarded
    pub catchup_done: bool,

    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: 0,
            readmodel_missing: false,
            catchup_done: false,
            updated_at: Utc::now(),
        }
    }
}
