//! Error types for read-model projection

use thiserror::Error;

use crate::domain::{AggregateVersion, HandlerError};

/// Errors that can occur while projecting, persisting or repairing read models
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document body could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert collided with an existing document (concurrent writer)
    #[error("duplicate key in {collection}: {id}")]
    DuplicateKey { collection: String, id: String },

    /// A read-model handler failed while applying a changeset
    #[error("handler for {read_model}/{aggregate_id} failed at version {aggregate_version}: {source}")]
    Handler {
        read_model: String,
        aggregate_id: String,
        aggregate_version: AggregateVersion,
        #[source]
        source: HandlerError,
    },

    /// A changeset from another stream was applied through the normal path
    #[error("changeset for stream {actual} cannot be applied to read model {expected}")]
    StreamMismatch { expected: String, actual: String },

    /// Read model id is empty
    #[error("read model id must not be empty")]
    EmptyId,

    /// The same id appears more than once in a batch
    #[error("duplicate id in batch: {id}")]
    DuplicateIdInBatch { id: String },

    /// Two distinct read-model types claim the same name
    #[error("read model name {name} claimed by both {existing} and {conflicting}")]
    DuplicateReadModelName {
        name: String,
        existing: String,
        conflicting: String,
    },

    /// Read-model name was never registered
    #[error("unknown read model: {0}")]
    UnknownReadModel(String),

    /// Some items of an unordered bulk write failed
    #[error("bulk write to {collection} failed for {} document(s): {}", .ids.len(), .ids.join(", "))]
    PartialBulkWrite { collection: String, ids: Vec<String> },

    /// Operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProjectionError {
    /// Races and I/O failures that a later attempt may not hit
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProjectionError::Database(_) | ProjectionError::DuplicateKey { .. }
        )
    }

    /// Programming or configuration mistakes, never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProjectionError::EmptyId
                | ProjectionError::DuplicateIdInBatch { .. }
                | ProjectionError::DuplicateReadModelName { .. }
                | ProjectionError::UnknownReadModel(_)
                | ProjectionError::StreamMismatch { .. }
                | ProjectionError::Configuration(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProjectionError::Cancelled)
    }
}

/// Result type for projection operations
pub type Result<T> = std::result::Result<T, ProjectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let race = ProjectionError::DuplicateKey {
            collection: "rm_counter".to_string(),
            id: "c-1".to_string(),
        };
        assert!(race.is_transient());
        assert!(!race.is_configuration());

        let dup = ProjectionError::DuplicateIdInBatch {
            id: "c-1".to_string(),
        };
        assert!(dup.is_configuration());
        assert!(dup.to_string().contains("c-1"));

        assert!(ProjectionError::Cancelled.is_cancelled());
        assert!(!ProjectionError::Cancelled.is_transient());
    }

    #[test]
    fn test_partial_bulk_write_message_lists_ids() {
        let err = ProjectionError::PartialBulkWrite {
            collection: "rm_counter".to_string(),
            ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "bulk write to rm_counter failed for 2 document(s): a, b"
        );
    }
}
