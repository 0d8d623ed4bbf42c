//! Checkpoint manager
//!
//! Tracks, per read-model type, the last global position dispatched to it.
//! Positions are advanced in memory with a per-key atomic max and written to
//! the [`CheckpointStore`] in one bulk upsert by [`CheckpointManager::flush`].
//! Losing the last few marks on a crash only costs replay time on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::{ReadModelDescriptor, ReadModelRegistry};
use crate::domain::{CheckpointRecord, Position, ReadModel};
use crate::infra::{
    CancellationToken, CheckpointStore, ProjectionError, Result, Retry, RetryConfig,
};
use crate::metrics::{metric_names, MetricsRegistry};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Broadcast whenever a tracked position advances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointChanged {
    pub name: String,
    pub previous: Position,
    pub position: Position,
}

#[derive(Debug)]
struct TrackedCheckpoint {
    position: AtomicI64,
    catchup_done: AtomicBool,
    readmodel_missing: AtomicBool,
}

impl TrackedCheckpoint {
    fn from_record(record: Option<&CheckpointRecord>) -> Self {
        Self {
            position: AtomicI64::new(record.map_or(0, |r| r.position)),
            catchup_done: AtomicBool::new(record.is_some_and(|r| r.catchup_done)),
            readmodel_missing: AtomicBool::new(false),
        }
    }

    fn to_record(&self, name: &str) -> CheckpointRecord {
        CheckpointRecord {
            name: name.to_string(),
            position: self.position.load(Ordering::SeqCst),
            readmodel_missing: self.readmodel_missing.load(Ordering::SeqCst),
            catchup_done: self.catchup_done.load(Ordering::SeqCst),
            updated_at: Utc::now(),
        }
    }
}

/// In-memory checkpoint map with periodic durable flush
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    registry: RwLock<ReadModelRegistry>,
    checkpoints: RwLock<HashMap<String, Arc<TrackedCheckpoint>>>,
    /// Records loaded from the store at startup
    persisted: RwLock<HashMap<String, CheckpointRecord>>,
    changes: broadcast::Sender<CheckpointChanged>,
    retry: RetryConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            registry: RwLock::new(ReadModelRegistry::new()),
            checkpoints: RwLock::new(HashMap::new()),
            persisted: RwLock::new(HashMap::new()),
            changes,
            retry: RetryConfig::storage(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry policy of the background flush loop
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load persisted checkpoints; already registered names are seeded
    /// from them.
    #[instrument(skip(self, cancel))]
    pub async fn load(&self, cancel: &CancellationToken) -> Result<usize> {
        cancel.check()?;
        let records = self.store.load_all().await?;
        let count = records.len();

        let mut persisted = self.persisted.write().await;
        let checkpoints = self.checkpoints.read().await;
        for record in records {
            if let Some(tracked) = checkpoints.get(&record.name) {
                tracked.position.fetch_max(record.position, Ordering::SeqCst);
                if record.catchup_done {
                    tracked.catchup_done.store(true, Ordering::SeqCst);
                }
            }
            persisted.insert(record.name.clone(), record);
        }

        info!(count = count, "Loaded read model checkpoints");
        Ok(count)
    }

    pub async fn register<M: ReadModel>(&self) -> Result<ReadModelDescriptor> {
        self.register_descriptor(ReadModelDescriptor::of::<M>()).await
    }

    /// Register a read-model type and start tracking its checkpoint.
    ///
    /// A name already persisted resumes from the stored position; a new one
    /// starts at 0 with catch-up pending.
    pub async fn register_descriptor(
        &self,
        descriptor: ReadModelDescriptor,
    ) -> Result<ReadModelDescriptor> {
        let descriptor = self
            .registry
            .write()
            .await
            .register_descriptor(descriptor)?
            .clone();

        let persisted = self.persisted.read().await;
        let mut checkpoints = self.checkpoints.write().await;
        let tracked = checkpoints
            .entry(descriptor.name.clone())
            .or_insert_with(|| {
                Arc::new(TrackedCheckpoint::from_record(
                    persisted.get(&descriptor.name),
                ))
            });
        tracked.readmodel_missing.store(false, Ordering::SeqCst);

        debug!(
            read_model = %descriptor.name,
            signature = descriptor.signature,
            position = tracked.position.load(Ordering::SeqCst),
            "Read model registered"
        );
        Ok(descriptor)
    }

    /// Snapshot of the registry built by `register`
    pub async fn registry(&self) -> ReadModelRegistry {
        self.registry.read().await.clone()
    }

    pub async fn position(&self, name: &str) -> Option<Position> {
        let checkpoints = self.checkpoints.read().await;
        checkpoints
            .get(name)
            .map(|t| t.position.load(Ordering::SeqCst))
    }

    pub async fn checkpoint(&self, name: &str) -> Option<CheckpointRecord> {
        let checkpoints = self.checkpoints.read().await;
        checkpoints.get(name).map(|t| t.to_record(name))
    }

    /// Every tracked checkpoint, sorted by name
    pub async fn checkpoints(&self) -> Vec<CheckpointRecord> {
        let checkpoints = self.checkpoints.read().await;
        let mut records: Vec<CheckpointRecord> = checkpoints
            .iter()
            .map(|(name, tracked)| tracked.to_record(name))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointChanged> {
        self.changes.subscribe()
    }

    /// Advance the dispatched position of `name`.
    ///
    /// Returns `false` when `position` is not above the tracked one; the
    /// checkpoint never moves backwards.
    pub async fn mark_position(&self, name: &str, position: Position) -> Result<bool> {
        let tracked = self.tracked(name).await?;

        let previous = tracked.position.fetch_max(position, Ordering::SeqCst);
        if position <= previous {
            debug!(
                read_model = name,
                position = position,
                current = previous,
                "Stale checkpoint mark ignored"
            );
            return Ok(false);
        }

        // no subscribers is fine
        let _ = self.changes.send(CheckpointChanged {
            name: name.to_string(),
            previous,
            position,
        });

        if let Some(metrics) = &self.metrics {
            metrics
                .set_gauge(&metric_names::checkpoint_position(name), position)
                .await;
        }
        Ok(true)
    }

    /// Record that a new read-model type finished its initial catch-up
    pub async fn mark_catchup_done(&self, name: &str) -> Result<()> {
        let tracked = self.tracked(name).await?;
        tracked.catchup_done.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Flag persisted checkpoints whose read model was not registered by this
    /// process and persist the flag. Call after every type has registered.
    #[instrument(skip(self, cancel))]
    pub async fn mark_missing_readmodels(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        cancel.check()?;

        let registry = self.registry.read().await;
        let persisted = self.persisted.read().await;
        let mut checkpoints = self.checkpoints.write().await;

        let mut missing: Vec<CheckpointRecord> = persisted
            .values()
            .filter(|record| !registry.contains(&record.name))
            .cloned()
            .collect();
        missing.sort_by(|a, b| a.name.cmp(&b.name));

        for record in &mut missing {
            record.readmodel_missing = true;
            record.updated_at = Utc::now();

            let tracked = checkpoints
                .entry(record.name.clone())
                .or_insert_with(|| Arc::new(TrackedCheckpoint::from_record(Some(&*record))));
            tracked.readmodel_missing.store(true, Ordering::SeqCst);

            warn!(
                read_model = %record.name,
                position = record.position,
                "Checkpoint has no registered read model"
            );
        }

        if !missing.is_empty() {
            self.store.upsert_many(&missing).await?;
        }

        Ok(missing.into_iter().map(|r| r.name).collect())
    }

    /// Write every tracked checkpoint in one bulk upsert
    #[instrument(skip(self, cancel))]
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<usize> {
        cancel.check()?;

        let records = self.checkpoints().await;
        if records.is_empty() {
            return Ok(0);
        }

        self.store.upsert_many(&records).await?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(metric_names::CHECKPOINT_FLUSHES).await;
        }
        debug!(count = records.len(), "Checkpoints flushed");
        Ok(records.len())
    }

    /// Flush every `period` until `cancel` fires, then flush once more.
    ///
    /// A failed flush is retried per the retry policy and then logged; it
    /// never ends the loop.
    pub fn spawn_flush_loop(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "Checkpoint flush loop started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.flush_with_retry().await,
                }
            }

            self.flush_with_retry().await;
            info!("Checkpoint flush loop stopped");
        })
    }

    async fn flush_with_retry(&self) {
        let none = CancellationToken::none();
        let outcome = Retry::new(self.retry.clone())
            .run_transient("checkpoint flush", || self.flush(&none))
            .await;

        if let Err(e) = outcome.result {
            error!(
                attempts = outcome.attempts,
                error = %e,
                "Checkpoint flush failed"
            );
        }
    }

    async fn tracked(&self, name: &str) -> Result<Arc<TrackedCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        match checkpoints.get(name) {
            Some(tracked) if !tracked.readmodel_missing.load(Ordering::SeqCst) => {
                Ok(tracked.clone())
            }
            _ => Err(ProjectionError::UnknownReadModel(name.to_string())),
        }
    }
}
