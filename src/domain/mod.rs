//! Domain models for atomic read-model projection
//!
//! Changesets come out of the event log, are applied to [`AtomicReadModel`]
//! instances, and are persisted as [`ReadModelDocument`]s. One
//! [`CheckpointRecord`] per read-model type records how far it was projected.

mod changeset;
mod checkpoint;
mod document;
mod readmodel;
mod types;

pub use changeset::*;
pub use checkpoint::*;
pub use document::*;
pub use readmodel::*;
pub use types::*;
