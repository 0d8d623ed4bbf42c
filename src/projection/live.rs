//! Live processor: on-demand rebuild and catch-up from the event log
//!
//! Every replay reads the aggregate's own stream forward in pages of
//! `page_size` changesets, starting right after the instance's current
//! aggregate version, and stops before the first changeset excluded by the
//! [`ReplayLimit`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::config::ProjectionConfig;
use crate::domain::{AggregateVersion, AtomicReadModel, Changeset, Position, ReadModel};
use crate::infra::{CancellationToken, EventLog, ProjectionError, Result};

/// Where a replay stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayLimit {
    /// Replay to the end of the stream
    End,
    /// Stop before any changeset with a higher aggregate version
    Version(AggregateVersion),
    /// Stop before any changeset with a higher global position
    Position(Position),
    /// Stop before any changeset committed after this instant
    Timestamp(DateTime<Utc>),
}

impl ReplayLimit {
    pub fn excludes<E>(&self, changeset: &Changeset<E>) -> bool {
        match *self {
            ReplayLimit::End => false,
            ReplayLimit::Version(version) => changeset.aggregate_version() > version,
            ReplayLimit::Position(position) => changeset.position() > position,
            ReplayLimit::Timestamp(timestamp) => changeset.timestamp() > timestamp,
        }
    }
}

/// Outcome of a batch catch-up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Changesets applied across all healthy instances
    pub applied: usize,
    /// Ids of instances marked faulted by a handler error
    pub faulted: Vec<String>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.faulted.is_empty()
    }
}

/// Rebuilds and catches up read models by replaying their streams
pub struct LiveProcessor<E> {
    event_log: Arc<dyn EventLog<E>>,
    page_size: usize,
}

impl<E: Send + Sync + 'static> LiveProcessor<E> {
    pub fn new(event_log: Arc<dyn EventLog<E>>, page_size: usize) -> Self {
        Self {
            event_log,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(event_log: Arc<dyn EventLog<E>>, config: &ProjectionConfig) -> Self {
        Self::new(event_log, config.replay_page_size)
    }

    /// Rebuild `id` from scratch up to `version_up_to` (inclusive).
    ///
    /// `None` when no changeset was applied, i.e. the aggregate does not exist
    /// (or has no changeset within the limit).
    pub async fn process<M: ReadModel<Event = E>>(
        &self,
        id: &str,
        version_up_to: AggregateVersion,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        self.process_until(id, ReplayLimit::Version(version_up_to), cancel)
            .await
    }

    /// Point-in-time rebuild by global position
    pub async fn process_until_position<M: ReadModel<Event = E>>(
        &self,
        id: &str,
        position_up_to: Position,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        self.process_until(id, ReplayLimit::Position(position_up_to), cancel)
            .await
    }

    /// Point-in-time rebuild by commit timestamp
    pub async fn process_until_timestamp<M: ReadModel<Event = E>>(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        self.process_until(id, ReplayLimit::Timestamp(timestamp), cancel)
            .await
    }

    #[instrument(skip(self, cancel), fields(read_model = M::NAME))]
    pub async fn process_until<M: ReadModel<Event = E>>(
        &self,
        id: &str,
        limit: ReplayLimit,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        if id.is_empty() {
            return Err(ProjectionError::EmptyId);
        }

        let mut model = AtomicReadModel::<M>::new(id);
        self.catchup_until(&mut model, limit, cancel).await?;

        if model.aggregate_version() == 0 {
            return Ok(None);
        }
        Ok(Some(model))
    }

    /// Apply everything after the instance's current version; returns the
    /// number of changesets applied.
    pub async fn catchup<M: ReadModel<Event = E>>(
        &self,
        model: &mut AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.catchup_until(model, ReplayLimit::End, cancel).await
    }

    pub async fn catchup_until<M: ReadModel<Event = E>>(
        &self,
        model: &mut AtomicReadModel<M>,
        limit: ReplayLimit,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut from_version = model.aggregate_version() + 1;
        let mut applied = 0;

        loop {
            cancel.check()?;
            let page = self
                .event_log
                .read_stream(model.id(), from_version, self.page_size)
                .await?;
            let page_len = page.len();

            for changeset in &page {
                if limit.excludes(changeset) {
                    return Ok(applied);
                }
                model.process_changeset(changeset)?;
                from_version = changeset.aggregate_version() + 1;
                applied += 1;
            }

            if page_len < self.page_size {
                break;
            }
        }

        if applied > 0 {
            debug!(
                read_model = M::NAME,
                aggregate_id = %model.id(),
                aggregate_version = model.aggregate_version(),
                applied = applied,
                "Caught up read model"
            );
        }
        Ok(applied)
    }

    /// Catch up many instances of one type.
    ///
    /// Ids must be non-empty and unique. Each instance advances along its own
    /// stream until its own limit; a handler error marks only that instance
    /// faulted, at its last good version, and the batch continues.
    #[instrument(skip(self, models, cancel), fields(read_model = M::NAME, count = models.len()))]
    pub async fn catchup_batch<M: ReadModel<Event = E>>(
        &self,
        models: &mut [AtomicReadModel<M>],
        limit: ReplayLimit,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        validate_ids(models.iter().map(|m| m.id()))?;
        cancel.check()?;

        let mut report = BatchReport::default();
        for model in models.iter_mut() {
            match self.catchup_until(model, limit, cancel).await {
                Ok(applied) => report.applied += applied,
                Err(e @ ProjectionError::Handler { .. }) => {
                    warn!(
                        read_model = M::NAME,
                        aggregate_id = %model.id(),
                        aggregate_version = model.aggregate_version(),
                        error = %e,
                        "Read model faulted during batch catch-up"
                    );
                    model.mark_faulted(&e);
                    report.faulted.push(model.id().to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Build fresh instances for `ids` and catch them up as one batch.
    ///
    /// Instances are returned in `ids` order, including ones whose stream was
    /// empty (aggregate version 0).
    pub async fn process_batch<M: ReadModel<Event = E>>(
        &self,
        ids: &[String],
        limit: ReplayLimit,
        cancel: &CancellationToken,
    ) -> Result<(Vec<AtomicReadModel<M>>, BatchReport)> {
        validate_ids(ids.iter().map(String::as_str))?;

        let mut models: Vec<AtomicReadModel<M>> =
            ids.iter().map(|id| AtomicReadModel::new(id.as_str())).collect();
        let report = self.catchup_batch(&mut models, limit, cancel).await?;
        Ok((models, report))
    }

    /// Enrich `model` with another aggregate's stream.
    ///
    /// The instance is flagged as modified by extra-stream events and can
    /// afterwards only be persisted through the version-only update path.
    #[instrument(skip(self, model, cancel), fields(read_model = M::NAME, aggregate_id = %model.id()))]
    pub async fn apply_extra_stream<M: ReadModel<Event = E>>(
        &self,
        model: &mut AtomicReadModel<M>,
        stream_id: &str,
        limit: ReplayLimit,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if stream_id.is_empty() {
            return Err(ProjectionError::EmptyId);
        }

        let mut from_version = 1;
        let mut handled = 0;

        loop {
            cancel.check()?;
            let page = self
                .event_log
                .read_stream(stream_id, from_version, self.page_size)
                .await?;
            let page_len = page.len();

            for changeset in &page {
                if limit.excludes(changeset) {
                    return Ok(handled);
                }
                if model.process_extra_stream_changeset(changeset)? {
                    handled += 1;
                }
                from_version = changeset.aggregate_version() + 1;
            }

            if page_len < self.page_size {
                return Ok(handled);
            }
        }
    }
}

/// Reject empty and repeated ids before any I/O
pub(crate) fn validate_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ProjectionError::EmptyId);
        }
        if !seen.insert(id) {
            return Err(ProjectionError::DuplicateIdInBatch { id: id.to_string() });
        }
    }
    Ok(())
}
