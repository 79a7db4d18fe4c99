//! Declarative kubehub: the resource-server and dynamic-watch boundaries,
//! with kube-backed implementations and an in-memory server.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use declarative_core::{GroupVersionKind, OwnerKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::debug;

mod memory;
mod server;
mod watch;

pub use memory::{MemoryServer, Verb};
pub use server::KubeServer;
pub use watch::KubeDynamicWatch;

/// Create/update/list/delete against the cluster, keyed by GVK + namespace.
/// Objects travel as raw JSON (`apiVersion`, `kind`, `metadata`, ...).
#[async_trait::async_trait]
pub trait ResourceServer: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>>;
    async fn create(&self, gvk: &GroupVersionKind, obj: &Json) -> Result<()>;
    /// Update an existing object (server-side apply for the kube impl).
    async fn update(&self, gvk: &GroupVersionKind, obj: &Json) -> Result<()>;
    /// `namespace: None` lists across all namespaces. Empty selector matches all.
    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>>;
    /// Deleting an absent object is not an error.
    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()>;
    async fn patch_status(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str, status: &Json) -> Result<()>;
}

/// Narrows the events a dynamic watch delivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    pub label_selector: String,
    pub namespace: Option<String>,
}

/// One change observed on a dynamically watched kind.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    pub owner_references: Vec<OwnerReference>,
    /// Identity passed to `DynamicWatch::add` for this kind
    pub target: OwnerKey,
    pub deleted: bool,
}

/// Registers watches for kinds discovered at runtime. Events are delivered
/// out of band, on the channel the implementation was built with.
#[async_trait::async_trait]
pub trait DynamicWatch: Send + Sync {
    async fn add(&self, kind: &GroupVersionKind, filter: &WatchFilter, target: &OwnerKey) -> Result<()>;
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client, built from the default config on first use.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT.get_or_try_init(|| async { Client::try_default().await }).await?;
    Ok(client.clone())
}

/// `k=v,k2=v2`, ordered by key.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Evaluate the subset of selector syntax this crate produces: `k=v`, `k==v`,
/// `k!=v` and bare `k` (existence).
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            labels.get(k.trim()).map(|x| x != v.trim()).unwrap_or(true)
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            labels.get(k.trim()).map(|x| x == v.trim()).unwrap_or(false)
        } else {
            labels.contains_key(term)
        }
    })
}

pub(crate) fn to_kube_gvk(gvk: &GroupVersionKind) -> kube::core::GroupVersionKind {
    kube::core::GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() }
}

/// Caches GVK → (ApiResource, namespaced) lookups; discovery is expensive.
pub(crate) struct ResourceCache {
    client: Client,
    map: Mutex<FxHashMap<GroupVersionKind, (ApiResource, bool)>>,
}

impl ResourceCache {
    pub(crate) fn new(client: Client) -> Self {
        Self { client, map: Mutex::new(FxHashMap::default()) }
    }

    pub(crate) fn client(&self) -> Client { self.client.clone() }

    pub(crate) async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.map.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned() {
            return Ok(hit);
        }
        let found = find_api_resource(self.client.clone(), gvk).await?;
        debug!(gvk = %gvk, plural = %found.0.plural, namespaced = found.1, "resolved api resource");
        self.map.lock().unwrap_or_else(|e| e.into_inner()).insert(gvk.clone(), found.clone());
        Ok(found)
    }

    /// Api handle for `gvk`; cluster-scoped kinds ignore `namespace`.
    pub(crate) async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }

    pub(crate) async fn namespaced(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.resolve(gvk).await?.1)
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let wanted = to_kube_gvk(gvk);
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == wanted.group && ar.version == wanted.version && ar.kind == wanted.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", gvk.key()))
}
