//! Declarative watch: the process-wide dynamic watch registry, the `Sink`
//! hook that feeds it, and translation of watch events into coalesced
//! reconcile requests.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use declarative_core::{DeclarativeObject, GroupVersionKind, ObjectSet, OwnerKey};
use declarative_kubehub::{DynamicWatch, WatchEvent, WatchFilter};
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

mod queue;
mod recording;

pub use queue::RequestQueue;
pub use recording::RecordingWatch;

/// Called once per successful tick with the objects that were materialized.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn notify(&self, owner: &DeclarativeObject, objects: &ObjectSet) -> Result<()>;
}

/// A request to reconcile one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub key: OwnerKey,
    pub cause: String,
}

impl ReconcileRequest {
    pub fn new(key: OwnerKey, cause: impl Into<String>) -> Self {
        Self { key, cause: cause.into() }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.cause)
    }
}

type FilterFn = dyn Fn(&DeclarativeObject) -> WatchFilter + Send + Sync;

/// Registers one watch per distinct kind, for the lifetime of the process.
///
/// The registered set only grows. The lock is held across the whole
/// check, register and insert sequence, so concurrent ticks that discover
/// the same kind register it exactly once. A failed registration is not
/// recorded and is retried by the next tick that carries the kind.
pub struct WatchRegistry {
    watch: Arc<dyn DynamicWatch>,
    filter: Arc<FilterFn>,
    registered: Mutex<BTreeSet<GroupVersionKind>>,
}

impl WatchRegistry {
    pub fn new(watch: Arc<dyn DynamicWatch>) -> Self {
        Self { watch, filter: Arc::new(|_| WatchFilter::default()), registered: Mutex::new(BTreeSet::new()) }
    }

    /// Filter handed to every new watch, derived from the owner that first
    /// brought the kind in.
    pub fn with_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&DeclarativeObject) -> WatchFilter + Send + Sync + 'static,
    {
        self.filter = Arc::new(f);
        self
    }

    pub async fn registered(&self) -> Vec<GroupVersionKind> {
        self.registered.lock().await.iter().cloned().collect()
    }

    pub async fn is_registered(&self, kind: &GroupVersionKind) -> bool {
        self.registered.lock().await.contains(kind)
    }

    /// Register every kind not seen before; returns how many were added.
    pub async fn register(&self, owner: &DeclarativeObject, kinds: &[GroupVersionKind]) -> usize {
        let filter = (self.filter)(owner);
        let target = owner.key();
        let mut registered = self.registered.lock().await;
        let mut added = 0;
        for kind in kinds {
            if registered.contains(kind) {
                continue;
            }
            match self.watch.add(kind, &filter, &target).await {
                Ok(()) => {
                    registered.insert(kind.clone());
                    added += 1;
                    counter!("watch_registered_total", 1u64);
                    info!(gvk = %kind, owner = %target, selector = %filter.label_selector, "watch registered");
                }
                Err(e) => {
                    counter!("watch_register_err", 1u64);
                    warn!(gvk = %kind, owner = %target, error = %e, "watch registration failed; will retry");
                }
            }
        }
        added
    }
}

#[async_trait::async_trait]
impl Sink for WatchRegistry {
    async fn notify(&self, owner: &DeclarativeObject, objects: &ObjectSet) -> Result<()> {
        let added = self.register(owner, &objects.unique_gvks()).await;
        debug!(owner = %owner.key(), added, "sink notified");
        Ok(())
    }
}

/// Maps events on watched objects back to the owner to reconcile.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    managed: GroupVersionKind,
}

impl EventTranslator {
    pub fn new(managed: GroupVersionKind) -> Self { Self { managed } }

    /// The owner reference of the managed kind wins; without one the event
    /// goes to the owner that registered the watch.
    pub fn translate(&self, event: &WatchEvent) -> ReconcileRequest {
        let cause = format!(
            "{} {}{} {}",
            event.kind.kind,
            event.namespace.as_deref().map(|ns| format!("{}/", ns)).unwrap_or_default(),
            event.name,
            if event.deleted { "deleted" } else { "changed" }
        );
        let owned = event.owner_references.iter().find(|r| {
            r.kind == self.managed.kind && GroupVersionKind::from_api_version(&r.api_version, &r.kind).group == self.managed.group
        });
        let key = match owned {
            // owners of one kind share a scope; the registration target tells which
            Some(r) if event.target.namespace.is_some() => OwnerKey::new(event.namespace.as_deref(), &r.name),
            Some(r) => OwnerKey::new(None, &r.name),
            None => event.target.clone(),
        };
        ReconcileRequest::new(key, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use serde_json::json;

    fn owner(name: &str) -> DeclarativeObject {
        DeclarativeObject::from_json(json!({
            "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
            "metadata": {"name": name, "namespace": "ops"}
        }))
        .unwrap()
    }

    fn kind(k: &str) -> GroupVersionKind { GroupVersionKind::new("", "v1", k) }

    fn event(owner_refs: Vec<OwnerReference>, target: OwnerKey) -> WatchEvent {
        WatchEvent {
            kind: kind("ConfigMap"),
            namespace: Some("ops".into()),
            name: "cfg".into(),
            owner_references: owner_refs,
            target,
            deleted: false,
        }
    }

    fn owner_ref(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference { api_version: api_version.into(), kind: kind.into(), name: name.into(), uid: "u".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn repeated_kinds_register_once() {
        let watch = Arc::new(RecordingWatch::new());
        let registry = WatchRegistry::new(watch.clone());
        for k in ["A", "B", "A", "C"] {
            registry.register(&owner("dash"), &[kind(k)]).await;
        }
        assert_eq!(watch.adds().len(), 3);
        assert_eq!(registry.registered().await, vec![kind("A"), kind("B"), kind("C")]);
    }

    #[tokio::test]
    async fn failed_registration_is_retried_next_time() {
        let watch = Arc::new(RecordingWatch::new());
        watch.fail_on("B");
        let registry = WatchRegistry::new(watch.clone());
        assert_eq!(registry.register(&owner("dash"), &[kind("A"), kind("B")]).await, 1);
        assert!(!registry.is_registered(&kind("B")).await);

        watch.clear_failures();
        assert_eq!(registry.register(&owner("dash"), &[kind("A"), kind("B")]).await, 1);
        assert!(registry.is_registered(&kind("B")).await);
        assert_eq!(watch.adds().iter().filter(|(k, _, _)| k.kind == "B").count(), 2);
    }

    #[tokio::test]
    async fn filter_and_target_come_from_the_first_owner() {
        let watch = Arc::new(RecordingWatch::new());
        let registry = WatchRegistry::new(watch.clone()).with_filter(|_| WatchFilter {
            label_selector: "addons.example.org/dashboard".into(),
            namespace: None,
        });
        registry.register(&owner("first"), &[kind("A")]).await;
        registry.register(&owner("second"), &[kind("A")]).await;
        let adds = watch.adds();
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].1.label_selector, "addons.example.org/dashboard");
        assert_eq!(adds[0].2, OwnerKey::new(Some("ops"), "first"));
    }

    #[test]
    fn events_follow_the_managed_owner_reference() {
        let t = EventTranslator::new(GroupVersionKind::new("addons.example.org", "v1alpha1", "Dashboard"));
        let target = OwnerKey::new(Some("ops"), "first");

        let refs = vec![
            owner_ref("apps/v1", "ReplicaSet", "rs"),
            owner_ref("addons.example.org/v1beta1", "Dashboard", "second"),
        ];
        let req = t.translate(&event(refs, target.clone()));
        assert_eq!(req.key, OwnerKey::new(Some("ops"), "second"));
        assert_eq!(req.cause, "ConfigMap ops/cfg changed");

        // same kind name, different group: not ours
        let req = t.translate(&event(vec![owner_ref("other.io/v1", "Dashboard", "x")], target.clone()));
        assert_eq!(req.key, target);
    }

    #[test]
    fn cluster_scoped_owners_drop_the_object_namespace() {
        let t = EventTranslator::new(GroupVersionKind::new("addons.example.org", "v1alpha1", "Dashboard"));
        let req = t.translate(&event(
            vec![owner_ref("addons.example.org/v1alpha1", "Dashboard", "global")],
            OwnerKey::new(None, "first"),
        ));
        assert_eq!(req.key, OwnerKey::new(None, "global"));
    }
}
