//! PostgreSQL implementations for production read-model storage
//!
//! Provides the document store (one table per read-model collection) and the
//! checkpoint store.

mod checkpoint_store;
mod document_store;

pub use checkpoint_store::*;
pub use document_store::*;
