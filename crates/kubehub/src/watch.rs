use anyhow::Result;
use declarative_core::{GroupVersionKind, OwnerKey};
use futures::StreamExt;
use kube::{
    core::DynamicObject,
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{DynamicWatch, ResourceCache, WatchEvent, WatchFilter};

/// One kube `watcher` task per added kind; events go out on a single channel.
pub struct KubeDynamicWatch {
    cache: ResourceCache,
    tx: mpsc::Sender<WatchEvent>,
}

impl KubeDynamicWatch {
    pub fn new(client: Client, cap: usize) -> (Self, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { cache: ResourceCache::new(client), tx }, rx)
    }
}

fn event_from(kind: &GroupVersionKind, target: &OwnerKey, obj: &DynamicObject, deleted: bool) -> WatchEvent {
    WatchEvent {
        kind: kind.clone(),
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        owner_references: obj.metadata.owner_references.clone().unwrap_or_default(),
        target: target.clone(),
        deleted,
    }
}

#[async_trait::async_trait]
impl DynamicWatch for KubeDynamicWatch {
    async fn add(&self, kind: &GroupVersionKind, filter: &WatchFilter, target: &OwnerKey) -> Result<()> {
        // Resolving up front makes unknown kinds a registration failure
        let api = self.cache.api(kind, filter.namespace.as_deref()).await?;
        let mut cfg = watcher::Config::default();
        if !filter.label_selector.is_empty() {
            cfg = cfg.labels(&filter.label_selector);
        }
        let tx = self.tx.clone();
        let kind = kind.clone();
        let target = target.clone();
        info!(gvk = %kind, selector = %filter.label_selector, "dynamic watch started");
        tokio::spawn(async move {
            let stream = watcher::watcher(api, cfg).default_backoff();
            futures::pin_mut!(stream);
            while let Some(ev) = stream.next().await {
                let batch = match ev {
                    Ok(Event::Applied(o)) => vec![event_from(&kind, &target, &o, false)],
                    Ok(Event::Deleted(o)) => vec![event_from(&kind, &target, &o, true)],
                    Ok(Event::Restarted(list)) => list.iter().map(|o| event_from(&kind, &target, o, false)).collect(),
                    Err(e) => {
                        warn!(gvk = %kind, error = %e, "dynamic watch error");
                        continue;
                    }
                };
                for we in batch {
                    counter!("watch_events_total", 1u64);
                    if tx.send(we).await.is_err() {
                        info!(gvk = %kind, "event receiver dropped; stopping dynamic watch");
                        return;
                    }
                }
            }
            warn!(gvk = %kind, "dynamic watch stream ended");
        });
        Ok(())
    }
}
