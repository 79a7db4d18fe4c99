//! Declarative status: rollout health of the materialized objects and the
//! owner's `.status` sub-resource.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use declarative_core::{
    CommonStatus, DeclarativeObject, Object, ObjectSet, PHASE_PROGRESSING, PHASE_READY,
};
use declarative_kubehub::ResourceServer;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// Computes and writes the owner's status after a materialization.
#[async_trait::async_trait]
pub trait Status: Send + Sync {
    async fn compute(&self, server: &dyn ResourceServer, owner: &DeclarativeObject, objects: &ObjectSet) -> Result<CommonStatus>;

    async fn persist(&self, server: &dyn ResourceServer, owner: &DeclarativeObject, status: &CommonStatus) -> Result<()> {
        persist_status(server, owner, status).await
    }
}

/// One entry of `status.conditions` on a workload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Conditions of a live object; missing or malformed reads as none.
pub fn conditions(live: &Json) -> Vec<Condition> {
    live.get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default()
}

pub fn deployment_available(live: &Json) -> bool {
    conditions(live).iter().any(|c| c.type_ == "Available" && c.status == "True")
}

/// Healthy iff every Deployment in the set reports `Available=True`.
/// The declared version is recorded once the rollout is healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStatus;

impl BasicStatus {
    async fn check(&self, server: &dyn ResourceServer, o: &Object) -> Result<Option<String>> {
        let live = server
            .get(o.gvk(), o.namespace(), o.name())
            .await
            .with_context(|| format!("reading {}", o.key()))?;
        let problem = match live {
            None => Some(format!("{} not found", o.key())),
            Some(live) if !deployment_available(&live) => Some(format!("{} not available", o.key())),
            Some(_) => None,
        };
        Ok(problem)
    }
}

#[async_trait::async_trait]
impl Status for BasicStatus {
    async fn compute(&self, server: &dyn ResourceServer, owner: &DeclarativeObject, objects: &ObjectSet) -> Result<CommonStatus> {
        let mut errors = Vec::new();
        for o in objects.iter().filter(|o| o.group() == "apps" && o.kind() == "Deployment") {
            if let Some(problem) = self.check(server, o).await? {
                errors.push(problem);
            }
        }
        let healthy = errors.is_empty();
        let version = if healthy {
            owner.declared_version().map(str::to_string)
        } else {
            owner.status().version
        };
        let phase = if healthy { PHASE_READY } else { PHASE_PROGRESSING };
        debug!(owner = %owner.key(), healthy, unavailable = errors.len(), "computed status");
        Ok(CommonStatus { healthy, errors, phase: Some(phase.to_string()), version })
    }
}

/// Patch the owner's status sub-resource; skipped when nothing changed.
pub async fn persist_status(server: &dyn ResourceServer, owner: &DeclarativeObject, status: &CommonStatus) -> Result<()> {
    if owner.status() == *status {
        debug!(owner = %owner.key(), "status unchanged");
        return Ok(());
    }
    let body = serde_json::to_value(status).context("serializing status")?;
    server
        .patch_status(owner.gvk(), owner.namespace(), owner.name(), &body)
        .await
        .with_context(|| format!("updating status of {}", owner.key()))
}
