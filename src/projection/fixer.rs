//! Signature fixer: background repair of documents behind the running schema
//!
//! For one read-model type the fixer pages through documents whose stored
//! signature is older than the running one, oldest projected position first,
//! rebuilds each from its stream and writes it back through the checked
//! guard. Each spawned worker publishes a [`FixerStatus`] on a `watch` channel
//! so dependents can wait for convergence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::collection::CollectionWrapper;
use super::live::LiveProcessor;
use crate::config::ProjectionConfig;
use crate::domain::{AtomicReadModel, Position, ReadModel};
use crate::infra::{CancellationToken, DocumentStore, FaultMarker, ProjectionError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// Outcome of one fixer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    /// Documents rewritten at the running signature
    pub fixed: usize,
    /// Documents whose replay failed and were flagged faulted in place
    pub faulted: usize,
    /// Documents whose write-back failed; left stale for the next run
    pub write_failures: usize,
    pub pages: usize,
    /// False when the run was cancelled before an empty page was seen
    pub completed: bool,
}

/// Observable state of a spawned fixer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixerStatus {
    Running,
    Completed(FixReport),
    Stopped(FixReport),
    Failed(String),
}

impl FixerStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, FixerStatus::Running)
    }
}

/// Owned handle to a spawned fixer worker
pub struct FixerHandle {
    name: &'static str,
    status: watch::Receiver<FixerStatus>,
    task: JoinHandle<()>,
}

impl FixerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> FixerStatus {
        self.status.borrow().clone()
    }

    /// Wait for the worker to publish a terminal status
    pub async fn wait(&self) -> FixerStatus {
        wait_finished(self.status.clone()).await
    }

    /// Wait for the worker task itself to exit
    pub async fn join(self) -> FixerStatus {
        if let Err(e) = self.task.await {
            return FixerStatus::Failed(format!("fixer task aborted: {}", e));
        }
        let status = self.status.borrow().clone();
        status
    }
}

/// Repairs stale documents of any read model consuming events of type `E`
pub struct SignatureFixer<E> {
    store: Arc<dyn DocumentStore>,
    live: Arc<LiveProcessor<E>>,
    config: ProjectionConfig,
    metrics: Option<Arc<MetricsRegistry>>,
    statuses: RwLock<HashMap<String, watch::Receiver<FixerStatus>>>,
}

impl<E: Send + Sync + 'static> SignatureFixer<E> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        live: Arc<LiveProcessor<E>>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            store,
            live,
            config,
            metrics: None,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the repair loop for `M` inline until a page comes back empty or
    /// `cancel` fires between pages.
    #[instrument(skip(self, cancel), fields(read_model = M::NAME, signature = M::SIGNATURE))]
    pub async fn fix<M: ReadModel<Event = E>>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<FixReport> {
        let mut wrapper =
            CollectionWrapper::<M>::new(self.store.clone(), self.live.clone(), &self.config);
        if let Some(metrics) = &self.metrics {
            wrapper = wrapper.with_metrics(metrics.clone());
        }

        let mut report = FixReport::default();
        let mut last_position = Position::MIN;

        loop {
            if cancel.is_cancelled() {
                info!(fixed = report.fixed, pages = report.pages, "Signature fixer stopped");
                return Ok(report);
            }

            let page = self
                .store
                .find_stale(
                    wrapper.collection_name(),
                    M::SIGNATURE,
                    last_position,
                    self.config.fixer_page_size,
                )
                .await?;
            if page.is_empty() {
                report.completed = true;
                info!(
                    fixed = report.fixed,
                    faulted = report.faulted,
                    write_failures = report.write_failures,
                    pages = report.pages,
                    "Signature fixer completed"
                );
                return Ok(report);
            }
            report.pages += 1;
            debug!(page = report.pages, size = page.len(), "Fixing stale page");

            for stale in page {
                last_position = last_position.max(stale.projected_position);

                let mut model = AtomicReadModel::<M>::new(stale.id.as_str());
                let outcome = match self.live.catchup(&mut model, cancel).await {
                    Ok(_) if model.aggregate_version() == 0 => continue,
                    Ok(_) => {
                        let written = wrapper.update(&model, cancel).await;
                        if matches!(written, Ok(true)) {
                            report.fixed += 1;
                            self.count(metric_names::FIXER_FIXED).await;
                        }
                        written
                    }
                    Err(e) if e.is_cancelled() => {
                        info!(fixed = report.fixed, "Signature fixer stopped mid-page");
                        return Ok(report);
                    }
                    Err(e @ ProjectionError::Handler { .. }) => {
                        // The partial replay is discarded; the stored document
                        // keeps its body and versions and stays stale.
                        warn!(
                            aggregate_id = %stale.id,
                            stored_version = stale.aggregate_version,
                            replayed_version = model.aggregate_version(),
                            error = %e,
                            "Replay failed, marking read model faulted"
                        );
                        report.faulted += 1;
                        self.count(metric_names::FIXER_FAULTED).await;
                        self.store
                            .mark_faulted_if(
                                wrapper.collection_name(),
                                &FaultMarker::new(&stale, &e),
                            )
                            .await
                    }
                    Err(e) => return Err(e),
                };

                match outcome {
                    Err(e) if e.is_cancelled() => return Ok(report),
                    Err(e) => {
                        warn!(aggregate_id = %stale.id, error = %e, "Could not write repaired read model");
                        report.write_failures += 1;
                    }
                    Ok(_) => {}
                }
            }
        }
    }

    /// Start the repair loop for `M` as an owned background task.
    ///
    /// The latest status stays queryable by name through
    /// [`status`](Self::status) after the handle is dropped.
    pub async fn spawn<M: ReadModel<Event = E>>(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> FixerHandle {
        let (tx, rx) = watch::channel(FixerStatus::Running);
        self.statuses
            .write()
            .await
            .insert(M::NAME.to_string(), rx.clone());

        info!(read_model = M::NAME, signature = M::SIGNATURE, "Signature fixer started");
        let fixer = self.clone();
        let task = tokio::spawn(async move {
            let status = match fixer.fix::<M>(&cancel).await {
                Ok(report) if report.completed => FixerStatus::Completed(report),
                Ok(report) => FixerStatus::Stopped(report),
                Err(e) => {
                    error!(read_model = M::NAME, error = %e, "Signature fixer failed");
                    FixerStatus::Failed(e.to_string())
                }
            };
            tx.send_replace(status);
        });

        FixerHandle {
            name: M::NAME,
            status: rx,
            task,
        }
    }

    /// Latest status of the fixer spawned for `name`, if any
    pub async fn status(&self, name: &str) -> Option<FixerStatus> {
        let statuses = self.statuses.read().await;
        statuses.get(name).map(|rx| rx.borrow().clone())
    }

    /// Wait until the fixer spawned for `name` finishes; `None` if none was
    /// spawned.
    pub async fn wait_until_finished(&self, name: &str) -> Option<FixerStatus> {
        let rx = self.statuses.read().await.get(name).cloned()?;
        Some(wait_finished(rx).await)
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}

async fn wait_finished(mut rx: watch::Receiver<FixerStatus>) -> FixerStatus {
    let status = match rx.wait_for(FixerStatus::is_finished).await {
        Ok(status) => status.clone(),
        // sender dropped without a terminal status
        Err(_) => FixerStatus::Failed("fixer task ended without reporting".to_string()),
    };
    status
}
