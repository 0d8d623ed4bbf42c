//! Projection engine for atomic read models
//!
//! - [`ReadModelRegistry`] - explicit name to type registry built at startup
//! - [`CheckpointManager`] - monotonic per-model positions with batched flush
//! - [`LiveProcessor`] - on-demand rebuild and catch-up from the event log
//! - [`CollectionWrapper`] - idempotent persistence and self-healing reads
//! - [`SignatureFixer`] - background repair of documents behind the running schema

mod checkpoint;
mod collection;
mod fixer;
mod live;
mod registry;

pub use checkpoint::*;
pub use collection::*;
pub use fixer::*;
pub use live::{BatchReport, LiveProcessor, ReplayLimit};
pub use registry::*;
