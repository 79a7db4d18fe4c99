use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use declarative_core::{DeclarativeObject, OwnerKey};
use declarative_kubehub::WatchEvent;
use declarative_watch::{EventTranslator, ReconcileRequest, RequestQueue};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{EngineConfig, Error, Reconciler};

/// Serial work loop: watch events in, coalesced reconcile requests out, one
/// tick at a time, failed keys retried with exponential backoff.
///
/// Events on the managed kind itself request a reconcile of that object;
/// events on materialized kinds go through an [`EventTranslator`].
pub struct Runner {
    reconciler: Arc<Reconciler>,
    translator: EventTranslator,
    queue: RequestQueue,
    retries: Vec<(Instant, ReconcileRequest)>,
    failures: HashMap<OwnerKey, u32>,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl Runner {
    pub fn new(reconciler: Arc<Reconciler>, cfg: &EngineConfig) -> Self {
        let translator = EventTranslator::new(reconciler.config().gvk.clone());
        Self {
            reconciler,
            translator,
            queue: RequestQueue::with_capacity(cfg.queue_cap),
            retries: Vec::new(),
            failures: HashMap::new(),
            backoff_min: cfg.backoff_min,
            backoff_max: cfg.backoff_max,
        }
    }

    pub fn queued(&self) -> usize { self.queue.len() }

    pub fn pending_retries(&self) -> usize { self.retries.len() }

    pub fn enqueue(&mut self, req: ReconcileRequest) {
        // a fresh request supersedes a scheduled retry
        self.retries.retain(|(_, r)| r.key != req.key);
        self.queue.push(req);
    }

    pub fn enqueue_event(&mut self, event: &WatchEvent) {
        let managed = &self.reconciler.config().gvk;
        let req = if event.kind.group == managed.group && event.kind.kind == managed.kind {
            ReconcileRequest::new(OwnerKey::new(event.namespace.as_deref(), &event.name), "owner changed")
        } else {
            self.translator.translate(event)
        };
        debug!(request = %req, "queueing reconcile");
        self.enqueue(req);
    }

    /// Queue every existing owner.
    pub async fn resync(&mut self) {
        let gvk = self.reconciler.config().gvk.clone();
        match self.reconciler.server().list(&gvk, None, "").await {
            Ok(items) => {
                for item in items {
                    let Ok(owner) = DeclarativeObject::with_gvk(gvk.clone(), item) else { continue };
                    self.enqueue(ReconcileRequest::new(owner.key(), "resync"));
                }
            }
            Err(e) => warn!(gvk = %gvk, error = %e, "listing owners failed"),
        }
    }

    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1).min(31)).unwrap_or(u32::MAX);
        self.backoff_min.saturating_mul(factor).min(self.backoff_max)
    }

    /// Move retries whose delay has passed back into the queue.
    pub fn promote_due(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retries).into_iter().partition(|(at, _)| *at <= now);
        self.retries = later;
        for (_, req) in due {
            self.queue.push(req);
        }
    }

    /// Reconcile the next queued owner, if any.
    pub async fn process_next(&mut self) -> Option<(OwnerKey, Result<(), Error>)> {
        let req = self.queue.pop()?;
        let key = req.key.clone();
        let result = self.process(&req).await;
        match &result {
            Ok(()) => {
                self.failures.remove(&key);
            }
            Err(e) if e.is_retryable() => {
                let n = {
                    let count = self.failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = self.backoff(n);
                warn!(owner = %key, error = %e, attempt = n, delay_ms = delay.as_millis() as u64, "requeueing with backoff");
                self.retries.push((Instant::now() + delay, req));
            }
            Err(e) => warn!(owner = %key, error = %e, "not retrying"),
        }
        Some((key, result))
    }

    async fn process(&self, req: &ReconcileRequest) -> Result<(), Error> {
        let gvk = &self.reconciler.config().gvk;
        let live = self
            .reconciler
            .server()
            .get(gvk, req.key.namespace.as_deref(), &req.key.name)
            .await
            .map_err(|source| Error::Fetch { owner: req.key.clone(), source })?;
        let Some(live) = live else {
            debug!(owner = %req.key, "owner gone; dropping request");
            return Ok(());
        };
        let owner = DeclarativeObject::with_gvk(gvk.clone(), live)?;
        self.reconciler.reconcile(&owner).await.map(|_| ())
    }

    /// Drive the loop until `shutdown` resolves or the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        self.resync().await;
        info!(gvk = %self.reconciler.config().gvk, "runner started");
        loop {
            // a pending shutdown wins over a non-empty backlog
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }
            while let Ok(ev) = events.try_recv() {
                self.enqueue_event(&ev);
            }
            self.promote_due(Instant::now());
            if self.process_next().await.is_some() {
                continue;
            }
            let next_retry = self.retries.iter().map(|(at, _)| *at).min();
            tokio::select! {
                _ = &mut shutdown => break,
                maybe = events.recv() => match maybe {
                    Some(ev) => self.enqueue_event(&ev),
                    None => {
                        debug!("event channel closed");
                        break;
                    }
                },
                _ = async {
                    match next_retry {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
        info!(queued = self.queue.len(), retries = self.retries.len(), "runner stopped");
    }
}
