use std::sync::Arc;

use declarative_apply::{ApplyReport, Materializer};
use declarative_core::{CommonStatus, DeclarativeObject, ObjectSet};
use declarative_kubehub::ResourceServer;
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::{Error, ReconcilerConfig};

/// Runs ticks for owners of one kind. Cheap to share behind an `Arc`.
pub struct Reconciler {
    config: Arc<ReconcilerConfig>,
    materializer: Materializer,
    server: Arc<dyn ResourceServer>,
}

impl Reconciler {
    pub(crate) fn new(config: Arc<ReconcilerConfig>, materializer: Materializer, server: Arc<dyn ResourceServer>) -> Self {
        Self { config, materializer, server }
    }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    pub fn server(&self) -> &Arc<dyn ResourceServer> { &self.server }

    /// Resolve, run raw operations, parse and transform; no cluster writes.
    pub async fn render(&self, owner: &DeclarativeObject) -> Result<ObjectSet, Error> {
        let manifest = self
            .config
            .manifest
            .resolve_manifest(owner)
            .await
            .map_err(|source| Error::Resolution { owner: owner.key(), source })?;
        Ok(self.config.pipeline.run(owner, manifest)?)
    }

    /// One reconcile tick. On failure the owner's status is marked unhealthy
    /// with the error before the error is returned.
    pub async fn reconcile(&self, owner: &DeclarativeObject) -> Result<ApplyReport, Error> {
        let t0 = std::time::Instant::now();
        counter!("reconcile_total", 1u64);
        let result = self.tick(owner).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &result {
            Ok(report) => info!(owner = %owner.key(), report = %report, "reconciled"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(owner = %owner.key(), error = %e, "reconcile failed");
                self.record_failure(owner, e).await;
            }
        }
        result
    }

    async fn tick(&self, owner: &DeclarativeObject) -> Result<ApplyReport, Error> {
        let mut objects = self.render(owner).await?;

        let prune_labels = if self.config.prune { self.config.labels_for(owner) } else { None };
        let report = self.materializer.materialize(owner, &mut objects, prune_labels.as_ref()).await?;

        if let Some(status) = &self.config.status {
            let computed = status.compute(self.server.as_ref(), owner, &objects).await.map_err(Error::Status)?;
            status.persist(self.server.as_ref(), owner, &computed).await.map_err(Error::Status)?;
        }

        if let Some(sink) = &self.config.sink {
            if let Err(e) = sink.notify(owner, &objects).await {
                warn!(owner = %owner.key(), error = %e, "sink notify failed");
            }
        }
        Ok(report)
    }

    async fn record_failure(&self, owner: &DeclarativeObject, err: &Error) {
        let Some(status) = &self.config.status else { return };
        let failed = CommonStatus::failed(err.to_string(), owner.status().version);
        if let Err(e) = status.persist(self.server.as_ref(), owner, &failed).await {
            warn!(owner = %owner.key(), error = %e, "recording failed status");
        }
    }
}
