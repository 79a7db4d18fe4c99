use anyhow::Context;
use declarative_core::{DeclarativeObject, FieldError, ObjectSet, WORKLOAD_KINDS};
use serde_json::{json, Value as Json};

use crate::ObjectTransform;

/// `<registry>/<last path segment of image>`; tag and digest are kept.
pub fn rewrite_image(registry: &str, image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{}", registry.trim_end_matches('/'), name)
}

/// Point workload images at a private registry and/or pin a single image
/// pull secret. Empty strings disable the respective half.
#[derive(Debug, Clone, Default)]
pub struct ImageRegistry {
    registry: String,
    pull_secret: String,
}

impl ImageRegistry {
    pub fn new(registry: impl Into<String>, pull_secret: impl Into<String>) -> Self {
        Self { registry: registry.into(), pull_secret: pull_secret.into() }
    }

    /// From `DECL_PRIVATE_REGISTRY` / `DECL_IMAGE_PULL_SECRET`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("DECL_PRIVATE_REGISTRY").unwrap_or_default(),
            std::env::var("DECL_IMAGE_PULL_SECRET").unwrap_or_default(),
        )
    }

    pub fn is_noop(&self) -> bool { self.registry.is_empty() && self.pull_secret.is_empty() }
}

impl ObjectTransform for ImageRegistry {
    fn name(&self) -> &str { "image-registry" }

    fn transform(&self, _owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()> {
        if self.is_noop() { return Ok(()); }
        for o in objects.iter_mut() {
            if !WORKLOAD_KINDS.contains(&o.kind()) { continue; }
            let key = o.key();
            if !self.registry.is_empty() {
                o.mutate_containers(|c| {
                    if let Some(image) = c.get("image").and_then(|i| i.as_str()) {
                        let rewritten = rewrite_image(&self.registry, image);
                        c.insert("image".to_string(), Json::String(rewritten));
                    }
                    Ok::<(), FieldError>(())
                })
                .with_context(|| format!("applying private registry to {}", key))?;
            }
            if !self.pull_secret.is_empty() {
                o.mutate_pod_spec(|spec| {
                    spec.insert("imagePullSecrets".to_string(), json!([{ "name": self.pull_secret }]));
                    Ok(())
                })
                .with_context(|| format!("applying image pull secret to {}", key))?;
            }
        }
        Ok(())
    }
}
