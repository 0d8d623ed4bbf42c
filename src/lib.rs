//! Atomic read-model projection library
//!
//! Builds and maintains denormalized read models from an event-sourced log
//! with idempotent, version-guarded persistence, self-healing reads and
//! background schema repair.
//!
//! ## Modules
//!
//! - [`domain`] - Changesets, the read-model contract, documents and checkpoints
//! - [`infra`] - Errors, storage traits, in-memory and PostgreSQL implementations
//! - [`projection`] - Registry, checkpoint manager, live processor, collection wrapper, fixer
//! - [`config`] - Environment-driven tunables
//! - [`metrics`] - Counters, gauges and histograms
//! - [`telemetry`] - Tracing subscriber setup

pub mod config;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod projection;
pub mod telemetry;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::ProjectionConfig;

pub use domain::{
    AggregateVersion, AtomicReadModel, Changeset, CheckpointRecord, DocumentVersion, HandlerError,
    Position, ReadModel, ReadModelDocument, ReadModelState, Signature,
};

pub use infra::{
    CancellationSource, CancellationToken, CheckpointStore, DocumentStore, EventLog,
    ProjectionError, Result,
};

pub use projection::{
    CheckpointManager, CollectionWrapper, FixReport, FixerStatus, FoundModels, LiveProcessor,
    ReadModelRegistry, ReplayLimit, SignatureFixer,
};
