//! Declarative apply: owner assignment, create/update and label-scoped prune
//! of a transformed object set.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use declarative_core::{DeclarativeObject, FieldError, GroupVersionKind, Object, ObjectKey, ObjectSet};
use declarative_kubehub::{label_selector, ResourceServer};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Picks the object that becomes the controller owner of a materialized
/// object. Runs for every object before anything is written.
#[async_trait::async_trait]
pub trait OwnerSelector: Send + Sync {
    async fn select(&self, owner: &DeclarativeObject, object: &Object, objects: &ObjectSet) -> Result<DeclarativeObject>;
}

/// Every object is owned by the object being reconciled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceAsOwner;

#[async_trait::async_trait]
impl OwnerSelector for SourceAsOwner {
    async fn select(&self, owner: &DeclarativeObject, _object: &Object, _objects: &ObjectSet) -> Result<DeclarativeObject> {
        Ok(owner.clone())
    }
}

pub struct SelectorFn<F>(F);

/// Wrap a synchronous closure as an [`OwnerSelector`].
pub fn owner_selector_fn<F>(f: F) -> SelectorFn<F>
where
    F: Fn(&DeclarativeObject, &Object, &ObjectSet) -> Result<DeclarativeObject> + Send + Sync,
{
    SelectorFn(f)
}

#[async_trait::async_trait]
impl<F> OwnerSelector for SelectorFn<F>
where
    F: Fn(&DeclarativeObject, &Object, &ObjectSet) -> Result<DeclarativeObject> + Send + Sync,
{
    async fn select(&self, owner: &DeclarativeObject, object: &Object, objects: &ObjectSet) -> Result<DeclarativeObject> {
        (self.0)(owner, object, objects)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFailure {
    pub key: ObjectKey,
    pub error: String,
}

/// Outcome of one materialization, per object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    /// Live object already carried every desired field
    pub unchanged: Vec<ObjectKey>,
    pub pruned: Vec<ObjectKey>,
    pub failed: Vec<ObjectFailure>,
    pub prune_skipped: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool { self.failed.is_empty() }

    pub fn attempted(&self) -> usize {
        self.created.len() + self.updated.len() + self.unchanged.len() + self.failed.len()
    }

    fn fail(&mut self, key: ObjectKey, error: &anyhow::Error) {
        self.failed.push(ObjectFailure { key, error: format!("{:#}", error) });
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} pruned, {} failed",
            self.created.len(),
            self.updated.len(),
            self.unchanged.len(),
            self.pruned.len(),
            self.failed.len()
        )?;
        for failure in &self.failed {
            write!(f, "; {}: {}", failure.key, failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("selecting owner for {object}: {source:#}")]
    Owner { object: ObjectKey, #[source] source: anyhow::Error },
    #[error("setting owner reference on {object}: {source}")]
    OwnerReference { object: ObjectKey, #[source] source: FieldError },
    #[error("listing {kind} for prune: {source:#}")]
    PruneList { kind: GroupVersionKind, #[source] source: anyhow::Error },
    #[error("prune requested with an empty label set")]
    UnscopedPrune,
    #[error("materialization incomplete: {0}")]
    Incomplete(ApplyReport),
}

impl ApplyError {
    /// The per-object report, when the failure happened after writes began.
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            ApplyError::Incomplete(report) => Some(report),
            _ => None,
        }
    }
}

/// Writes object sets to a [`ResourceServer`]. Remembers every kind it has
/// applied so later prunes also reach kinds that left the manifest.
pub struct Materializer {
    server: Arc<dyn ResourceServer>,
    owners: Arc<dyn OwnerSelector>,
    preserve_namespace: bool,
    applied_kinds: Mutex<BTreeSet<GroupVersionKind>>,
}

impl Materializer {
    pub fn new(server: Arc<dyn ResourceServer>) -> Self {
        Self { server, owners: Arc::new(SourceAsOwner), preserve_namespace: false, applied_kinds: Mutex::new(BTreeSet::new()) }
    }

    pub fn with_owner_selector(mut self, owners: Arc<dyn OwnerSelector>) -> Self {
        self.owners = owners;
        self
    }

    /// Prune across all namespaces instead of only the owner's.
    pub fn with_preserve_namespace(mut self, preserve: bool) -> Self {
        self.preserve_namespace = preserve;
        self
    }

    pub fn server(&self) -> &Arc<dyn ResourceServer> { &self.server }

    pub fn applied_kinds(&self) -> Vec<GroupVersionKind> {
        self.applied_kinds.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    /// Assign owners, apply every object, then (with `prune_labels`) delete
    /// labelled objects that are no longer part of `objects` and whose
    /// controller is the owner or one of the set's controllers.
    ///
    /// Owner selection runs for the whole set before the first write. Apply is
    /// best effort: a failing object does not stop the rest, but it does skip
    /// the prune and fails the call with the full report.
    pub async fn materialize(
        &self,
        owner: &DeclarativeObject,
        objects: &mut ObjectSet,
        prune_labels: Option<&BTreeMap<String, String>>,
    ) -> Result<ApplyReport, ApplyError> {
        if prune_labels.map(|l| l.is_empty()).unwrap_or(false) {
            return Err(ApplyError::UnscopedPrune);
        }
        self.assign_owners(owner, objects).await?;

        let t0 = std::time::Instant::now();
        let mut report = ApplyReport::default();
        for o in objects.iter() {
            self.apply_one(o, &mut report).await;
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        self.applied_kinds.lock().unwrap_or_else(|e| e.into_inner()).extend(objects.unique_gvks());

        match prune_labels {
            Some(_) if !report.is_success() => {
                warn!(owner = %owner.key(), failed = report.failed.len(), "skipping prune after apply failures");
                report.prune_skipped = true;
            }
            Some(labels) => self.prune(owner, objects, labels, &mut report).await?,
            None => {}
        }

        if report.is_success() {
            debug!(owner = %owner.key(), report = %report, "materialized");
            Ok(report)
        } else {
            Err(ApplyError::Incomplete(report))
        }
    }

    async fn assign_owners(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> Result<(), ApplyError> {
        let mut chosen = Vec::with_capacity(objects.len());
        for o in objects.iter() {
            let selected = self
                .owners
                .select(owner, o, objects)
                .await
                .map_err(|source| ApplyError::Owner { object: o.key(), source })?;
            chosen.push(selected);
        }
        for (o, selected) in objects.iter_mut().zip(chosen) {
            set_controller_reference(o, &selected)
                .map_err(|source| ApplyError::OwnerReference { object: o.key(), source })?;
        }
        Ok(())
    }

    async fn apply_one(&self, o: &Object, report: &mut ApplyReport) {
        let key = o.key();
        let desired = o.to_json();
        let live = match self.server.get(o.gvk(), o.namespace(), o.name()).await {
            Ok(live) => live,
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(object = %key, error = %e, "reading live object failed");
                report.fail(key, &e);
                return;
            }
        };
        let result = match &live {
            None => self.server.create(o.gvk(), &desired).await.map(|_| report.created.push(key.clone())),
            Some(live) if !drifted(&desired, live) => {
                report.unchanged.push(key.clone());
                Ok(())
            }
            Some(_) => self.server.update(o.gvk(), &desired).await.map(|_| report.updated.push(key.clone())),
        };
        match result {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                debug!(object = %key, "applied");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(object = %key, error = %e, "apply failed");
                report.fail(key, &e);
            }
        }
    }

    async fn prune(
        &self,
        owner: &DeclarativeObject,
        objects: &ObjectSet,
        labels: &BTreeMap<String, String>,
        report: &mut ApplyReport,
    ) -> Result<(), ApplyError> {
        let selector = label_selector(labels);
        let namespace = if self.preserve_namespace { None } else { owner.namespace() };
        // labels alone do not tell same-named owners in different namespaces apart
        let controllers = controller_uids(owner, objects);

        // list everything first; a failed list must not leave a partial prune behind
        let mut stale = Vec::new();
        for kind in self.applied_kinds() {
            let live = self
                .server
                .list(&kind, namespace, &selector)
                .await
                .map_err(|source| ApplyError::PruneList { kind: kind.clone(), source })?;
            for item in live {
                let Some(key) = ObjectKey::from_json(&item) else { continue };
                if objects.contains_key(&key) {
                    continue;
                }
                match controller_uid(item.pointer("/metadata/ownerReferences")) {
                    Some(uid) if controllers.contains(uid) => stale.push((kind.clone(), key)),
                    _ => debug!(owner = %owner.key(), object = %key, "labelled but controlled elsewhere; not pruning"),
                }
            }
        }

        for (kind, key) in stale {
            match self.server.delete(&kind, key.namespace.as_deref(), &key.name).await {
                Ok(()) => {
                    counter!("prune_deleted_total", 1u64);
                    info!(owner = %owner.key(), object = %key, "pruned");
                    report.pruned.push(key);
                }
                Err(e) => {
                    warn!(object = %key, error = %e, "prune delete failed");
                    report.fail(key, &e);
                }
            }
        }
        Ok(())
    }
}

/// Make `owner` the single controller reference of `object`, keeping any
/// non-controller references. Owners without a uid (offline renders) are
/// skipped.
pub fn set_controller_reference(object: &mut Object, owner: &DeclarativeObject) -> Result<(), FieldError> {
    let Some(uid) = owner.uid() else {
        debug!(object = %object.key(), owner = %owner.key(), "owner has no uid; not setting owner reference");
        return Ok(());
    };
    let mut refs: Vec<Json> = object
        .nested(&["metadata", "ownerReferences"])
        .and_then(|r| r.as_array())
        .map(|r| {
            r.iter()
                .filter(|x| x.get("controller").and_then(|c| c.as_bool()) != Some(true))
                .filter(|x| x.get("uid").and_then(|u| u.as_str()) != Some(uid))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    refs.push(json!({
        "apiVersion": owner.gvk().api_version(),
        "kind": owner.gvk().kind,
        "name": owner.name(),
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    }));
    object.set_nested(Json::Array(refs), &["metadata", "ownerReferences"])
}

/// Uid of the controller entry in an `ownerReferences` list.
fn controller_uid(refs: Option<&Json>) -> Option<&str> {
    refs?
        .as_array()?
        .iter()
        .find(|r| r.get("controller").and_then(|c| c.as_bool()) == Some(true))?
        .get("uid")?
        .as_str()
}

/// Uids that may control a prunable object: the owner and every controller
/// assigned to the current set.
fn controller_uids<'a>(owner: &'a DeclarativeObject, objects: &'a ObjectSet) -> BTreeSet<&'a str> {
    owner
        .uid()
        .into_iter()
        .chain(objects.iter().filter_map(|o| controller_uid(o.nested(&["metadata", "ownerReferences"]))))
        .collect()
}

/// Server-populated fields that never count as drift.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Whether `live` lacks or differs in any field `desired` sets. Fields only
/// present on the live object (server defaults) are ignored.
fn drifted(desired: &Json, live: &Json) -> bool {
    fn walk(want: &Json, have: &Json) -> bool {
        match (want, have) {
            (Json::Object(w), Json::Object(h)) => {
                w.iter().any(|(k, wv)| h.get(k).map(|hv| walk(wv, hv)).unwrap_or(true))
            }
            (w, h) => w != h,
        }
    }
    walk(&strip_noisy(desired.clone()), &strip_noisy(live.clone()))
}
