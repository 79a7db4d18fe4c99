use anyhow::{anyhow, Context, Result};
use declarative_core::GroupVersionKind;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

use crate::{get_kube_client, ResourceCache, ResourceServer};

fn default_field_manager() -> String {
    std::env::var("DECL_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "declarative".to_string())
}

/// Resource server backed by the kube API. Updates use server-side apply.
pub struct KubeServer {
    cache: ResourceCache,
    field_manager: String,
}

impl KubeServer {
    pub fn new(client: Client) -> Self {
        Self { cache: ResourceCache::new(client), field_manager: default_field_manager() }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn client(&self) -> Client { self.cache.client() }
}

fn name_and_namespace(obj: &Json) -> Result<(String, Option<String>)> {
    let meta = obj.get("metadata").ok_or_else(|| anyhow!("object missing metadata"))?;
    let name = meta.get("name").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let ns = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
    Ok((name.to_string(), ns))
}

#[async_trait::async_trait]
impl ResourceServer for KubeServer {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>> {
        if self.cache.namespaced(gvk).await? && namespace.is_none() {
            return Err(anyhow!("namespace required for namespaced kind {}", gvk.key()));
        }
        let api = self.cache.api(gvk, namespace).await?;
        match api.get_opt(name).await.with_context(|| format!("getting {} {}", gvk.key(), name))? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj).context("serializing DynamicObject")?)),
            None => Ok(None),
        }
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &Json) -> Result<()> {
        let (name, ns) = name_and_namespace(obj)?;
        let api = self.cache.api(gvk, ns.as_deref()).await?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone()).context("building DynamicObject")?;
        api.create(&PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }, &dynamic)
            .await
            .with_context(|| format!("creating {} {}", gvk.key(), name))?;
        counter!("server_create_total", 1u64);
        Ok(())
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &Json) -> Result<()> {
        let (name, ns) = name_and_namespace(obj)?;
        let api = self.cache.api(gvk, ns.as_deref()).await?;
        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(&name, &pp, &Patch::Apply(obj))
            .await
            .with_context(|| format!("server-side apply of {} {}", gvk.key(), name))?;
        counter!("server_apply_total", 1u64);
        Ok(())
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>> {
        let api = self.cache.api(gvk, namespace).await?;
        let lp = if label_selector.is_empty() { ListParams::default() } else { ListParams::default().labels(label_selector) };
        let list = api.list(&lp).await.with_context(|| format!("listing {} ({})", gvk.key(), label_selector))?;
        let mut out = Vec::with_capacity(list.items.len());
        for item in list.items {
            let mut v = serde_json::to_value(&item).context("serializing DynamicObject")?;
            // list items usually come back without type metadata
            if let Some(map) = v.as_object_mut() {
                map.entry("apiVersion").or_insert_with(|| Json::String(gvk.api_version()));
                map.entry("kind").or_insert_with(|| Json::String(gvk.kind.clone()));
            }
            out.push(v);
        }
        debug!(gvk = %gvk, count = out.len(), selector = %label_selector, "listed");
        Ok(out)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let api = self.cache.api(gvk, namespace).await?;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!("deleting {} {}", gvk.key(), name))),
        }
    }

    async fn patch_status(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str, status: &Json) -> Result<()> {
        let api = self.cache.api(gvk, namespace).await?;
        let payload = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .with_context(|| format!("patching status of {} {}", gvk.key(), name))?;
        Ok(())
    }
}
