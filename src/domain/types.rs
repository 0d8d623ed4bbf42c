//! Core type definitions shared by the projection layers

/// Version of an aggregate stream after a changeset was appended (1-based)
pub type AggregateVersion = i64;

/// Global position of a changeset in the event log (1-based)
pub type Position = i64;

/// Schema version baked into a read-model type
pub type Signature = i32;

/// Number of recently applied aggregate versions each read model remembers.
///
/// Sized to absorb the reordering window of a catch-up that overlaps live
/// delivery; older versions are evicted first.
pub const RECENT_VERSIONS_CAPACITY: usize = 32;
