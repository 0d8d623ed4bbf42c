//! Collection wrapper: idempotent persistence and self-healing reads
//!
//! All writes go through storage-evaluated guards, so concurrent writers for
//! the same id settle on the highest `(aggregate_version, readmodel_version)`
//! regardless of interleaving. Reads detect documents written by an older
//! signature (or no longer deserializable) and rebuild them from the event
//! log.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, instrument, warn};

use super::live::{validate_ids, LiveProcessor};
use crate::config::ProjectionConfig;
use crate::domain::{AtomicReadModel, ReadModel, ReadModelDocument, ReadModelState};
use crate::infra::{
    CancellationToken, DocumentStore, FaultMarker, ProjectionError, Result, VersionUpdate,
    WriteGuard, WriteOperation,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// Typed access to the collection of one read-model type
pub struct CollectionWrapper<M: ReadModel> {
    store: Arc<dyn DocumentStore>,
    live: Arc<LiveProcessor<M::Event>>,
    collection: String,
    max_fault_retries: u32,
    metrics: Option<Arc<MetricsRegistry>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: ReadModel> CollectionWrapper<M> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        live: Arc<LiveProcessor<M::Event>>,
        config: &ProjectionConfig,
    ) -> Self {
        Self {
            store,
            live,
            collection: config.collection_name(M::NAME),
            max_fault_retries: config.max_fault_retries,
            metrics: None,
            _model: PhantomData,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Create the physical collection and its index
    pub async fn ensure_collection(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        self.store.ensure_collection(&self.collection).await
    }

    /// Insert or replace `model` if it is newer than the stored document.
    ///
    /// Returns whether a write happened. Models carrying extra-stream events
    /// are never written here.
    pub async fn upsert(
        &self,
        model: &AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.upsert_with(model, true, cancel).await
    }

    /// Like [`upsert`](Self::upsert) but ignores the business version; a
    /// stored document with a higher signature is still never overwritten.
    pub async fn upsert_force(
        &self,
        model: &AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.upsert_with(model, false, cancel).await
    }

    #[instrument(
        skip(self, model, cancel),
        fields(read_model = M::NAME, aggregate_id = %model.id(), aggregate_version = model.aggregate_version())
    )]
    async fn upsert_with(
        &self,
        model: &AtomicReadModel<M>,
        require_newer: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if model.id().is_empty() {
            return Err(ProjectionError::EmptyId);
        }
        cancel.check()?;

        if model.modified_with_extra_stream_events() {
            debug!("Model carries extra-stream events, not persisting");
            return Ok(false);
        }

        let guard = guard_for(model, require_newer);
        let existing = self
            .store
            .find_versions(&self.collection, &[model.id().to_string()])
            .await?;

        if let Some(stored) = existing.first() {
            if !guard.admits(stored) {
                debug!(
                    stored_version = stored.aggregate_version,
                    stored_signature = stored.readmodel_version,
                    "Stored document is not older, skipping write"
                );
                self.count(metric_names::READMODEL_WRITES_SKIPPED).await;
                return Ok(false);
            }
            cancel.check()?;
            return self
                .store
                .replace_if(&self.collection, &model.to_document()?, guard)
                .await;
        }

        cancel.check()?;
        let document = model.to_document()?;
        match self.store.insert(&self.collection, &document).await {
            Ok(()) => Ok(true),
            Err(ProjectionError::DuplicateKey { .. }) => {
                warn!("Concurrent insert detected, falling back to conditional replace");
                self.count(metric_names::READMODEL_INSERT_RACES).await;
                self.store
                    .replace_if(&self.collection, &document, guard)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Conditional replace only; never inserts
    pub async fn update(
        &self,
        model: &AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.replace_with(model, true, cancel).await
    }

    /// Replace ignoring the business version; never inserts
    pub async fn update_force(
        &self,
        model: &AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.replace_with(model, false, cancel).await
    }

    async fn replace_with(
        &self,
        model: &AtomicReadModel<M>,
        require_newer: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if model.id().is_empty() {
            return Err(ProjectionError::EmptyId);
        }
        cancel.check()?;

        if model.modified_with_extra_stream_events() {
            return Ok(false);
        }

        self.store
            .replace_if(
                &self.collection,
                &model.to_document()?,
                guard_for(model, require_newer),
            )
            .await
    }

    /// Record processed versions without touching business fields.
    ///
    /// This is the only write path open to models that applied extra-stream
    /// events.
    pub async fn update_version(
        &self,
        model: &AtomicReadModel<M>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if model.id().is_empty() {
            return Err(ProjectionError::EmptyId);
        }
        cancel.check()?;

        self.store
            .update_version_if(&self.collection, &VersionUpdate::from_state(model.state()))
            .await
    }

    /// Upsert many models with one version lookup and one unordered bulk
    /// write.
    ///
    /// Duplicate or empty ids fail the whole batch before any I/O. Returns the
    /// number of documents written.
    #[instrument(skip(self, models, cancel), fields(read_model = M::NAME, count = models.len()))]
    pub async fn upsert_batch(
        &self,
        models: &[AtomicReadModel<M>],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        cancel.check()?;
        validate_ids(models.iter().map(|m| m.id()))?;

        let candidates: Vec<&AtomicReadModel<M>> = models
            .iter()
            .filter(|m| !m.modified_with_extra_stream_events())
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = candidates.iter().map(|m| m.id().to_string()).collect();
        let existing = self.store.find_versions(&self.collection, &ids).await?;

        let mut operations = Vec::with_capacity(candidates.len());
        let mut skipped = 0u64;
        for model in &candidates {
            let document = model.to_document()?;
            let guard = WriteGuard::checked(&model.version());
            match existing.iter().find(|v| v.id == model.id()) {
                None => operations.push(WriteOperation::Insert(document)),
                Some(stored) if guard.admits(stored) => {
                    operations.push(WriteOperation::Replace { document, guard })
                }
                Some(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(skipped = skipped, "Skipped documents that are not newer");
            if let Some(metrics) = &self.metrics {
                metrics
                    .add_counter(metric_names::READMODEL_WRITES_SKIPPED, skipped)
                    .await;
            }
        }
        if operations.is_empty() {
            return Ok(0);
        }

        cancel.check()?;
        let retry_documents: Vec<ReadModelDocument> = operations
            .iter()
            .filter_map(|op| match op {
                WriteOperation::Insert(document) => Some(document.clone()),
                _ => None,
            })
            .collect();

        let result = self.store.bulk_write(&self.collection, operations).await?;
        let mut written = result.written();
        let mut failed = Vec::new();

        for failure in result.failures {
            let retry = retry_documents.iter().find(|d| d.id() == failure.id);
            match retry {
                Some(document) if failure.duplicate_key => {
                    warn!(
                        aggregate_id = %failure.id,
                        "Concurrent insert in batch, falling back to conditional replace"
                    );
                    self.count(metric_names::READMODEL_INSERT_RACES).await;
                    let guard = WriteGuard::checked(&document.version());
                    if self
                        .store
                        .replace_if(&self.collection, document, guard)
                        .await?
                    {
                        written += 1;
                    }
                }
                _ => {
                    error!(aggregate_id = %failure.id, error = %failure.message, "Bulk write item failed");
                    failed.push(failure.id);
                }
            }
        }

        if !failed.is_empty() {
            return Err(ProjectionError::PartialBulkWrite {
                collection: self.collection.clone(),
                ids: failed,
            });
        }
        Ok(written)
    }

    /// Version-only update for many models in one bulk write; duplicate or
    /// empty ids fail the whole batch before any I/O.
    #[instrument(skip(self, models, cancel), fields(read_model = M::NAME, count = models.len()))]
    pub async fn update_version_batch(
        &self,
        models: &[AtomicReadModel<M>],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        cancel.check()?;
        validate_ids(models.iter().map(|m| m.id()))?;
        if models.is_empty() {
            return Ok(0);
        }

        let operations = models
            .iter()
            .map(|m| WriteOperation::UpdateVersion(VersionUpdate::from_state(m.state())))
            .collect();
        let result = self.store.bulk_write(&self.collection, operations).await?;

        if !result.failures.is_empty() {
            return Err(ProjectionError::PartialBulkWrite {
                collection: self.collection.clone(),
                ids: result.failures.into_iter().map(|f| f.id).collect(),
            });
        }
        Ok(result.written())
    }

    /// Read one model, rebuilding it from the event log when the stored
    /// document was written by another signature, cannot be deserialized, or
    /// is faulted with retries left.
    ///
    /// `None` means the aggregate has no document and no events.
    #[instrument(skip(self, cancel), fields(read_model = M::NAME))]
    pub async fn find_one_by_id(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        if id.is_empty() {
            return Err(ProjectionError::EmptyId);
        }
        cancel.check()?;

        let Some(document) = self.store.find_by_id(&self.collection, id).await? else {
            return self.rebuild(id, None, cancel).await;
        };
        let stored = StoredDocument::<M>::decode(document);
        if let Err(e) = &stored.model {
            warn!(
                aggregate_id = id,
                stored_signature = stored.state.readmodel_version,
                faulted = stored.state.faulted,
                error = %e,
                "Stored document does not deserialize"
            );
        }

        if !self.needs_rebuild(&stored) {
            if stored.state.faulted {
                debug!(
                    aggregate_id = id,
                    retries = stored.state.fault_retry_count,
                    "Fault retries exhausted, not rebuilding"
                );
            }
            return stored.model.map(Some);
        }

        self.rebuild(id, Some(stored), cancel).await
    }

    /// [`find_one_by_id`](Self::find_one_by_id) for each id. Ids with neither
    /// document nor events are left out; a failing id is reported in
    /// [`FoundModels::failures`] without stopping the others. Only
    /// cancellation aborts the whole read.
    pub async fn find_many_by_ids(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<FoundModels<M>> {
        let mut found = FoundModels {
            models: Vec::with_capacity(ids.len()),
            failures: Vec::new(),
        };
        for id in ids {
            match self.find_one_by_id(id, cancel).await {
                Ok(Some(model)) => found.models.push(model),
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => found.failures.push((id.clone(), e)),
            }
        }
        Ok(found)
    }

    /// Faulted documents are governed by the retry budget alone
    fn needs_rebuild(&self, stored: &StoredDocument<M>) -> bool {
        if stored.state.faulted {
            return stored.state.fault_retry_count < self.max_fault_retries;
        }
        stored.model.is_err() || stored.state.readmodel_version != M::SIGNATURE
    }

    async fn rebuild(
        &self,
        id: &str,
        stored: Option<StoredDocument<M>>,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        self.count(metric_names::READMODEL_REBUILDS).await;
        let started = Instant::now();
        let rebuilt = self.live.process::<M>(id, i64::MAX, cancel).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .observe_histogram(
                    metric_names::READMODEL_REBUILD_LATENCY,
                    started.elapsed().as_secs_f64(),
                )
                .await;
        }

        match rebuilt {
            Ok(Some(model)) => {
                // A faulted or unreadable document is replaced outright; a
                // healthy one only if the rebuild is newer.
                let force = stored
                    .as_ref()
                    .map_or(true, |s| s.state.faulted || s.model.is_err());
                let written = if force {
                    self.upsert_force(&model, cancel).await?
                } else {
                    self.update(&model, cancel).await?
                };
                debug!(
                    aggregate_id = id,
                    aggregate_version = model.aggregate_version(),
                    written = written,
                    "Read model rebuilt"
                );
                Ok(Some(model))
            }
            Ok(None) => Ok(stored.and_then(|s| s.model.ok())),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                self.count(metric_names::READMODEL_REBUILD_FAILURES).await;
                self.handle_rebuild_failure(id, stored, e, cancel).await
            }
        }
    }

    /// The stored document is flagged in place: its body and versions stay,
    /// whether or not it still deserializes.
    async fn handle_rebuild_failure(
        &self,
        id: &str,
        stored: Option<StoredDocument<M>>,
        failure: ProjectionError,
        cancel: &CancellationToken,
    ) -> Result<Option<AtomicReadModel<M>>> {
        let Some(stored) = stored else {
            error!(aggregate_id = id, error = %failure, "Rebuild failed");
            return Err(failure);
        };
        let marker = FaultMarker::new(&stored.state.version(), &failure);

        if stored.state.faulted {
            warn!(
                aggregate_id = id,
                retries = stored.state.fault_retry_count.saturating_add(1),
                max_retries = self.max_fault_retries,
                error = %failure,
                "Rebuild of faulted read model failed again"
            );
            self.mark_faulted(&marker.with_retry_increment(), cancel)
                .await?;
            return match stored.model {
                Ok(mut model) => {
                    model.increment_fault_retry();
                    model.mark_faulted(&failure);
                    Ok(Some(model))
                }
                Err(_) => Err(failure),
            };
        }

        error!(aggregate_id = id, error = %failure, "Rebuild failed, marking read model faulted");
        self.count(metric_names::READMODEL_FAULTED).await;
        if let Err(e) = self.mark_faulted(&marker, cancel).await {
            warn!(aggregate_id = id, error = %e, "Could not persist fault marker");
        }
        Err(failure)
    }

    async fn mark_faulted(&self, marker: &FaultMarker, cancel: &CancellationToken) -> Result<bool> {
        cancel.check()?;
        let marked = self.store.mark_faulted_if(&self.collection, marker).await?;
        if !marked {
            debug!(
                aggregate_id = %marker.id,
                aggregate_version = marker.aggregate_version,
                "Stored document moved on, fault marker not applied"
            );
        }
        Ok(marked)
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}

/// Result of [`CollectionWrapper::find_many_by_ids`]
#[derive(Debug)]
pub struct FoundModels<M: ReadModel> {
    /// In request order
    pub models: Vec<AtomicReadModel<M>>,
    pub failures: Vec<(String, ProjectionError)>,
}

/// Document as read, with its metadata kept even when the body no longer
/// decodes into `M`
struct StoredDocument<M: ReadModel> {
    state: ReadModelState,
    model: Result<AtomicReadModel<M>>,
}

impl<M: ReadModel> StoredDocument<M> {
    fn decode(document: ReadModelDocument) -> Self {
        Self {
            state: document.state.clone(),
            model: AtomicReadModel::from_document(document),
        }
    }
}

fn guard_for<M: ReadModel>(model: &AtomicReadModel<M>, require_newer: bool) -> WriteGuard {
    if require_newer {
        WriteGuard::checked(&model.version())
    } else {
        WriteGuard::force(&model.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DocumentVersion;
    use crate::infra::{
        CancellationSource, InMemoryDocumentStore, InMemoryEventLog, MockDocumentStore,
    };
    use crate::test_support::{changeset, CounterV1, CounterV2, SampleEvent};

    const COLLECTION: &str = "rm_counter";

    struct Fixture {
        log: Arc<InMemoryEventLog<SampleEvent>>,
        store: Arc<InMemoryDocumentStore>,
        metrics: Arc<MetricsRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(InMemoryEventLog::new()),
                store: Arc::new(InMemoryDocumentStore::new()),
                metrics: Arc::new(MetricsRegistry::new()),
            }
        }

        fn wrapper<M: ReadModel<Event = SampleEvent>>(&self) -> CollectionWrapper<M> {
            let live = Arc::new(LiveProcessor::<SampleEvent>::new(self.log.clone(), 10));
            CollectionWrapper::new(self.store.clone(), live, &ProjectionConfig::default())
                .with_metrics(self.metrics.clone())
        }
    }

    fn model_at(id: &str, version: i64, touches: usize) -> AtomicReadModel<CounterV1> {
        let mut model = AtomicReadModel::new(id);
        for v in 1..=version {
            let events = if (v as usize) <= touches {
                vec![SampleEvent::Touched]
            } else {
                vec![SampleEvent::Ignored]
            };
            model.process_changeset(&changeset(id, v, v, events)).unwrap();
        }
        model
    }

    fn cancelled() -> CancellationToken {
        let source = CancellationSource::new();
        source.cancel();
        source.token()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_skips_older() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();

        assert!(wrapper.upsert(&model_at("a", 5, 5), &cancel).await.unwrap());
        assert!(!wrapper.upsert(&model_at("a", 4, 0), &cancel).await.unwrap());
        assert!(!wrapper.upsert(&model_at("a", 5, 0), &cancel).await.unwrap());

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.aggregate_version, 5);
        assert_eq!(stored.body["touch_count"], 5);
        assert_eq!(fx.metrics.get_counter(metric_names::READMODEL_WRITES_SKIPPED).await, 2);
    }

    #[tokio::test]
    async fn test_signature_bump_wins_at_equal_version() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        fx.wrapper::<CounterV1>()
            .upsert(&model_at("a", 5, 1), &cancel)
            .await
            .unwrap();

        let mut upgraded = AtomicReadModel::<CounterV2>::new("a");
        for v in 1..=5 {
            upgraded
                .process_changeset(&changeset("a", v, v, vec![SampleEvent::Touched]))
                .unwrap();
        }

        assert!(fx
            .wrapper::<CounterV2>()
            .upsert(&upgraded, &cancel)
            .await
            .unwrap());
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.readmodel_version, 2);
        assert_eq!(stored.body["touch_count"], 5);
    }

    #[tokio::test]
    async fn test_upsert_force_overwrites_but_never_downgrades_signature() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        let v1 = fx.wrapper::<CounterV1>();

        v1.upsert(&model_at("a", 5, 5), &cancel).await.unwrap();
        assert!(v1.upsert_force(&model_at("a", 3, 1), &cancel).await.unwrap());
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.aggregate_version, 3);
        assert_eq!(stored.body["touch_count"], 1);

        // stored document now carries a newer signature
        let mut newer = stored.clone();
        newer.state.readmodel_version = 2;
        fx.store.put_raw(COLLECTION, newer).await;

        assert!(!v1.upsert_force(&model_at("a", 9, 9), &cancel).await.unwrap());
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.aggregate_version, 3);
    }

    #[tokio::test]
    async fn test_upsert_rejects_empty_id() {
        let fx = Fixture::new();
        let model = AtomicReadModel::<CounterV1>::new("");
        assert!(matches!(
            fx.wrapper::<CounterV1>()
                .upsert(&model, &CancellationToken::none())
                .await,
            Err(ProjectionError::EmptyId)
        ));
    }

    #[tokio::test]
    async fn test_extra_stream_model_is_only_version_updated() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();
        wrapper.upsert(&model_at("a", 1, 1), &cancel).await.unwrap();

        let mut model = model_at("a", 2, 1);
        model
            .process_extra_stream_changeset(&changeset("b", 1, 9, vec![SampleEvent::Touched]))
            .unwrap();

        assert!(!wrapper.upsert(&model, &cancel).await.unwrap());
        assert!(!wrapper.upsert_force(&model, &cancel).await.unwrap());
        assert!(wrapper.update_version(&model, &cancel).await.unwrap());

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.aggregate_version, 2);
        assert_eq!(stored.body["linked_touches"], 0);
    }

    #[tokio::test]
    async fn test_update_never_inserts() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        assert!(!wrapper
            .update(&model_at("a", 1, 1), &CancellationToken::none())
            .await
            .unwrap());
        assert_eq!(fx.store.count(COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_insert_race_falls_back_to_replace() {
        let mut store = MockDocumentStore::new();
        store.expect_find_versions().returning(|_, _| Ok(Vec::new()));
        store.expect_insert().times(1).returning(|collection, document| {
            Err(ProjectionError::DuplicateKey {
                collection: collection.to_string(),
                id: document.id().to_string(),
            })
        });
        store
            .expect_replace_if()
            .withf(|_, _, guard: &WriteGuard| guard.require_newer)
            .times(1)
            .returning(|_, _, _| Ok(true));

        let live = Arc::new(LiveProcessor::<SampleEvent>::new(
            Arc::new(InMemoryEventLog::new()),
            10,
        ));
        let wrapper: CollectionWrapper<CounterV1> =
            CollectionWrapper::new(Arc::new(store), live, &ProjectionConfig::default());

        assert!(wrapper
            .upsert(&model_at("a", 1, 1), &CancellationToken::none())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_token_issues_no_io() {
        let mut store = MockDocumentStore::new();
        store.expect_find_versions().times(0);
        store.expect_find_by_id().times(0);
        store.expect_bulk_write().times(0);
        store.expect_update_version_if().times(0);

        let live = Arc::new(LiveProcessor::<SampleEvent>::new(
            Arc::new(InMemoryEventLog::new()),
            10,
        ));
        let wrapper: CollectionWrapper<CounterV1> =
            CollectionWrapper::new(Arc::new(store), live, &ProjectionConfig::default());
        let token = cancelled();
        let model = model_at("a", 1, 1);

        assert!(wrapper.upsert(&model, &token).await.unwrap_err().is_cancelled());
        assert!(wrapper.update_version(&model, &token).await.unwrap_err().is_cancelled());
        assert!(wrapper
            .find_one_by_id("a", &token)
            .await
            .unwrap_err()
            .is_cancelled());
        assert!(wrapper
            .upsert_batch(std::slice::from_ref(&model), &token)
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn test_upsert_batch_partitions_insert_and_replace() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();
        wrapper.upsert(&model_at("old", 1, 1), &cancel).await.unwrap();
        wrapper.upsert(&model_at("current", 4, 4), &cancel).await.unwrap();

        let written = wrapper
            .upsert_batch(
                &[model_at("new", 2, 2), model_at("old", 3, 3), model_at("current", 2, 0)],
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(
            fx.store.get_raw(COLLECTION, "old").await.unwrap().state.aggregate_version,
            3
        );
        assert_eq!(
            fx.store.get_raw(COLLECTION, "current").await.unwrap().state.aggregate_version,
            4
        );
        assert!(fx.store.get_raw(COLLECTION, "new").await.is_some());
    }

    #[tokio::test]
    async fn test_upsert_batch_duplicate_ids_write_nothing() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();

        let err = wrapper
            .upsert_batch(
                &[model_at("a", 1, 1), model_at("b", 1, 1), model_at("a", 2, 2)],
                &CancellationToken::none(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProjectionError::DuplicateIdInBatch { ref id } if id == "a"));
        assert_eq!(fx.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_update_version_batch_rejects_duplicates_and_updates() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();
        wrapper.upsert(&model_at("a", 1, 1), &cancel).await.unwrap();
        wrapper.upsert(&model_at("b", 1, 1), &cancel).await.unwrap();
        let writes = fx.store.write_count();

        assert!(wrapper
            .update_version_batch(&[model_at("a", 2, 1), model_at("a", 3, 1)], &cancel)
            .await
            .is_err());
        assert_eq!(fx.store.write_count(), writes);

        let updated = wrapper
            .update_version_batch(&[model_at("a", 3, 1), model_at("b", 1, 1)], &cancel)
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.aggregate_version, 3);
        assert_eq!(stored.state.last_processed_versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_upsert_batch_reports_partial_failure() {
        let mut store = MockDocumentStore::new();
        store.expect_find_versions().returning(|_, _| Ok(Vec::new()));
        store.expect_bulk_write().times(1).returning(|_, operations| {
            Ok(crate::infra::BulkWriteResult {
                inserted: operations.len() - 1,
                failures: vec![crate::infra::BulkWriteFailure {
                    id: "b".to_string(),
                    duplicate_key: false,
                    message: "disk full".to_string(),
                }],
                ..Default::default()
            })
        });

        let live = Arc::new(LiveProcessor::<SampleEvent>::new(
            Arc::new(InMemoryEventLog::new()),
            10,
        ));
        let wrapper: CollectionWrapper<CounterV1> =
            CollectionWrapper::new(Arc::new(store), live, &ProjectionConfig::default());

        let err = wrapper
            .upsert_batch(&[model_at("a", 1, 1), model_at("b", 1, 1)], &CancellationToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::PartialBulkWrite { ref ids, .. } if ids == &vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn test_find_returns_current_document_without_rebuild() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();
        wrapper.upsert(&model_at("a", 2, 2), &cancel).await.unwrap();

        let found = wrapper.find_one_by_id("a", &cancel).await.unwrap().unwrap();
        assert_eq!(found.data().touch_count, 2);
        assert_eq!(fx.metrics.get_counter(metric_names::READMODEL_REBUILDS).await, 0);
    }

    #[tokio::test]
    async fn test_find_missing_aggregate_is_none() {
        let fx = Fixture::new();
        let found = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("ghost", &CancellationToken::none())
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(fx.store.count(COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_find_rebuilds_stale_signature_and_persists() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;
        fx.log.append("a", vec![SampleEvent::Touched]).await;

        let v1 = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("a", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1.readmodel_version(), 1);

        let v2 = fx
            .wrapper::<CounterV2>()
            .find_one_by_id("a", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v2.readmodel_version(), 2);
        assert_eq!(v2.data().touch_count, 1);

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.readmodel_version, 2);
        assert_eq!(stored.body["touch_count"], 1);
    }

    #[tokio::test]
    async fn test_find_rebuilds_undeserializable_document() {
        let fx = Fixture::new();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;

        let mut state = ReadModelState::new("a", 1);
        state.aggregate_version = 1;
        state.projected_position = 1;
        fx.store
            .put_raw(
                COLLECTION,
                ReadModelDocument {
                    state,
                    body: serde_json::json!({ "shape": "from an older release" }),
                },
            )
            .await;

        let found = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("a", &CancellationToken::none())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.data().name, "A");
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.body["name"], "A");
    }

    #[tokio::test]
    async fn test_rebuild_failure_faults_then_degrades_with_bounded_retries() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;
        fx.log.append("a", vec![SampleEvent::Exploded]).await;

        // stored by the previous signature at version 1
        let mut old = AtomicReadModel::<CounterV1>::new("a");
        old.process_changeset(&changeset("a", 1, 1, vec![SampleEvent::created("A")]))
            .unwrap();
        fx.store.put_raw(COLLECTION, old.to_document().unwrap()).await;

        let wrapper = fx.wrapper::<CounterV2>();

        // first failure is visible and leaves a fault marker
        let err = wrapper.find_one_by_id("a", &cancel).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Handler { .. }));
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert!(stored.state.faulted);
        assert_eq!(stored.state.fault_retry_count, 0);

        // later reads return the stored document and count retries
        for expected in 1..=3 {
            let found = wrapper.find_one_by_id("a", &cancel).await.unwrap().unwrap();
            assert!(found.is_faulted());
            assert_eq!(found.data().name, "A");
            assert_eq!(found.fault_retry_count(), expected);
        }

        // retries exhausted: no more rebuild attempts
        let failures = fx
            .metrics
            .get_counter(metric_names::READMODEL_REBUILD_FAILURES)
            .await;
        let found = wrapper.find_one_by_id("a", &cancel).await.unwrap().unwrap();
        assert_eq!(found.fault_retry_count(), 3);
        assert_eq!(
            fx.metrics.get_counter(metric_names::READMODEL_REBUILD_FAILURES).await,
            failures
        );
        assert_eq!(fx.metrics.get_counter(metric_names::READMODEL_FAULTED).await, 1);
    }

    #[tokio::test]
    async fn test_find_rebuild_failure_without_document_propagates() {
        let fx = Fixture::new();
        fx.log.append("a", vec![SampleEvent::Exploded]).await;

        let err = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("a", &CancellationToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Handler { .. }));
        assert_eq!(fx.store.count(COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_stale_reader_does_not_clobber_newer_document() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;

        // a newer process already stored signature 2 at a later version
        let mut newer = ReadModelState::new("a", 2);
        newer.aggregate_version = 7;
        fx.store
            .put_raw(
                COLLECTION,
                ReadModelDocument {
                    state: newer,
                    body: serde_json::to_value(CounterV2::create("a")).unwrap(),
                },
            )
            .await;

        let found = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("a", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.readmodel_version(), 1);

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(
            stored.version(),
            DocumentVersion {
                id: "a".to_string(),
                aggregate_version: 7,
                readmodel_version: 2,
                projected_position: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_find_many_skips_missing() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        let cancel = CancellationToken::none();
        wrapper.upsert(&model_at("a", 1, 1), &cancel).await.unwrap();
        fx.log.append("b", vec![SampleEvent::created("B")]).await;

        let ids = vec!["a".to_string(), "ghost".to_string(), "b".to_string()];
        let found = wrapper.find_many_by_ids(&ids, &cancel).await.unwrap();
        let found_ids: Vec<_> = found.models.iter().map(|m| m.id()).collect();
        assert_eq!(found_ids, vec!["a", "b"]);
        assert!(found.failures.is_empty());
    }

    #[tokio::test]
    async fn test_find_many_isolates_failing_ids() {
        let fx = Fixture::new();
        let wrapper = fx.wrapper::<CounterV1>();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;
        fx.log.append("boom", vec![SampleEvent::Exploded]).await;
        fx.log.append("c", vec![SampleEvent::created("C")]).await;

        let ids = vec!["a".to_string(), "boom".to_string(), "c".to_string()];
        let found = wrapper
            .find_many_by_ids(&ids, &CancellationToken::none())
            .await
            .unwrap();

        let found_ids: Vec<_> = found.models.iter().map(|m| m.id()).collect();
        assert_eq!(found_ids, vec!["a", "c"]);
        assert_eq!(found.failures.len(), 1);
        assert_eq!(found.failures[0].0, "boom");
        assert!(matches!(found.failures[0].1, ProjectionError::Handler { .. }));
    }

    #[tokio::test]
    async fn test_find_many_stops_on_cancellation() {
        let fx = Fixture::new();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;

        let err = fx
            .wrapper::<CounterV1>()
            .find_many_by_ids(&["a".to_string()], &cancelled())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    fn undecodable(id: &str, version: i64, faulted: bool) -> ReadModelDocument {
        let mut state = ReadModelState::new(id, 1);
        state.aggregate_version = version;
        state.projected_position = version;
        state.faulted = faulted;
        ReadModelDocument {
            state,
            body: serde_json::json!({ "bogus": true }),
        }
    }

    #[tokio::test]
    async fn test_undeserializable_document_keeps_fault_marker_on_failed_rebuild() {
        let fx = Fixture::new();
        fx.log.append("a", vec![SampleEvent::created("A")]).await;
        fx.log.append("a", vec![SampleEvent::Exploded]).await;
        fx.store.put_raw(COLLECTION, undecodable("a", 1, false)).await;

        let err = fx
            .wrapper::<CounterV1>()
            .find_one_by_id("a", &CancellationToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Handler { .. }));

        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert!(stored.state.faulted);
        assert_eq!(stored.state.fault_retry_count, 0);
        assert_eq!(stored.state.aggregate_version, 1);
        assert_eq!(stored.body["bogus"], true);
        assert_eq!(fx.metrics.get_counter(metric_names::READMODEL_FAULTED).await, 1);
    }

    #[tokio::test]
    async fn test_undeserializable_faulted_document_respects_retry_budget() {
        let fx = Fixture::new();
        let cancel = CancellationToken::none();
        fx.log.append("a", vec![SampleEvent::Exploded]).await;
        fx.store.put_raw(COLLECTION, undecodable("a", 1, true)).await;
        let wrapper = fx.wrapper::<CounterV1>();

        for expected in 1..=3 {
            let err = wrapper.find_one_by_id("a", &cancel).await.unwrap_err();
            assert!(matches!(err, ProjectionError::Handler { .. }));
            let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
            assert_eq!(stored.state.fault_retry_count, expected);
        }
        let replays = fx.metrics.get_counter(metric_names::READMODEL_REBUILDS).await;
        assert_eq!(replays, 3);

        // budget spent: the decode error surfaces without another replay
        let err = wrapper.find_one_by_id("a", &cancel).await.unwrap_err();
        assert!(!matches!(err, ProjectionError::Handler { .. }));
        assert_eq!(
            fx.metrics.get_counter(metric_names::READMODEL_REBUILDS).await,
            replays
        );
        let stored = fx.store.get_raw(COLLECTION, "a").await.unwrap();
        assert_eq!(stored.state.fault_retry_count, 3);
    }

    #[tokio::test]
    async fn test_fault_marker_skipped_when_document_moved_on() {
        let mut store = MockDocumentStore::new();
        let stale = model_at("a", 1, 0).to_document().unwrap();
        store
            .expect_find_by_id()
            .returning(move |_, _| Ok(Some(stale.clone())));
        store
            .expect_mark_faulted_if()
            .times(1)
            .withf(|collection: &str, marker: &FaultMarker| {
                collection == COLLECTION && marker.aggregate_version == 1 && !marker.increment_retry
            })
            .returning(|_, _| Ok(false));
        store.expect_replace_if().times(0);
        store.expect_insert().times(0);

        let log = Arc::new(InMemoryEventLog::new());
        log.append("a", vec![SampleEvent::Exploded]).await;
        let live = Arc::new(LiveProcessor::<SampleEvent>::new(log, 10));
        let wrapper =
            CollectionWrapper::<CounterV2>::new(Arc::new(store), live, &ProjectionConfig::default());

        let err = wrapper
            .find_one_by_id("a", &CancellationToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Handler { .. }));
    }
}
