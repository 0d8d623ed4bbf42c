//! Projection configuration
//!
//! Values are read from the environment by the hosting service; anything
//! missing or unparsable keeps its default.

use std::time::Duration;

/// Tunables shared by the projection components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionConfig {
    /// Rebuild attempts on read for a document already marked faulted
    pub max_fault_retries: u32,
    /// Stale documents fetched per signature fixer page
    pub fixer_page_size: usize,
    /// Changesets fetched per event log read during replay
    pub replay_page_size: usize,
    /// Period of the background checkpoint flush
    pub checkpoint_flush_interval: Duration,
    /// Prefix of the physical collection name of each read model
    pub collection_prefix: String,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_fault_retries: 3,
            fixer_page_size: 100,
            replay_page_size: 500,
            checkpoint_flush_interval: Duration::from_millis(1000),
            collection_prefix: "rm_".to_string(),
        }
    }
}

impl ProjectionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_fault_retries: env_parse("PROJECTION_MAX_FAULT_RETRIES")
                .unwrap_or(defaults.max_fault_retries),
            fixer_page_size: env_parse("PROJECTION_FIXER_PAGE_SIZE")
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.fixer_page_size),
            replay_page_size: env_parse("PROJECTION_REPLAY_PAGE_SIZE")
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.replay_page_size),
            checkpoint_flush_interval: env_parse("PROJECTION_CHECKPOINT_FLUSH_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.checkpoint_flush_interval),
            collection_prefix: std::env::var("PROJECTION_COLLECTION_PREFIX")
                .unwrap_or(defaults.collection_prefix),
        }
    }

    pub fn with_max_fault_retries(mut self, retries: u32) -> Self {
        self.max_fault_retries = retries;
        self
    }

    pub fn with_fixer_page_size(mut self, size: usize) -> Self {
        self.fixer_page_size = size.max(1);
        self
    }

    pub fn with_replay_page_size(mut self, size: usize) -> Self {
        self.replay_page_size = size.max(1);
        self
    }

    pub fn with_checkpoint_flush_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_flush_interval = interval;
        self
    }

    pub fn with_collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.collection_prefix = prefix.into();
        self
    }

    /// Physical collection holding the documents of `read_model`
    pub fn collection_name(&self, read_model: &str) -> String {
        format!("{}{}", self.collection_prefix, read_model)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
