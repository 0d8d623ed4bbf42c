//! Infrastructure layer for read-model projection
//!
//! Contains trait definitions and implementations for:
//! - Event log reads (paged per-stream and global)
//! - Document storage with storage-evaluated write guards
//! - Checkpoint storage
//! - Cooperative cancellation
//! - Retry with backoff (checkpoint flush)

mod cancellation;
mod error;
pub mod memory;
pub mod postgres;
mod retry;
mod traits;
mod write;

pub use cancellation::{CancellationSource, CancellationToken};
pub use error::*;
pub use memory::{InMemoryCheckpointStore, InMemoryDocumentStore, InMemoryEventLog};
pub use postgres::{PgCheckpointStore, PgDocumentStore};
pub use retry::{Backoff, Retry, RetryConfig, RetryResult};
pub use traits::*;
pub use write::*;
