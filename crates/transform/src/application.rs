use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use declarative_core::{
    CommonStatus, DeclarativeObject, ObjectSet, APPLICATION_GROUP, APPLICATION_KIND, PHASE_FAILED,
};
use serde_json::{json, Value as Json};
use tracing::warn;

use crate::{LabelMaker, ObjectTransform};

/// `spec.assemblyPhase` of an Application descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyPhase {
    Pending,
    Succeeded,
    Failed,
}

impl AssemblyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyPhase::Pending => "Pending",
            AssemblyPhase::Succeeded => "Succeeded",
            AssemblyPhase::Failed => "Failed",
        }
    }

    pub fn from_status(status: &CommonStatus) -> Self {
        if status.healthy {
            AssemblyPhase::Succeeded
        } else if status.phase.as_deref() == Some(PHASE_FAILED) {
            AssemblyPhase::Failed
        } else {
            AssemblyPhase::Pending
        }
    }
}

impl fmt::Display for AssemblyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Keeps the set's single Application descriptor in step with the owner:
/// selector, component kinds, version and assembly phase.
#[derive(Clone)]
pub struct ManagedApplication {
    labels: Arc<dyn LabelMaker>,
}

impl ManagedApplication {
    pub fn new(labels: Arc<dyn LabelMaker>) -> Self { Self { labels } }
}

impl ObjectTransform for ManagedApplication {
    fn name(&self) -> &str { "managed-application" }

    fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()> {
        let apps: Vec<usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.group() == APPLICATION_GROUP && o.kind() == APPLICATION_KIND)
            .map(|(i, _)| i)
            .collect();
        let index = match apps.as_slice() {
            [] => return Ok(()),
            [one] => *one,
            _ => {
                warn!(owner = %owner.key(), count = apps.len(), "multiple Application objects in manifest; not updating any");
                return Ok(());
            }
        };

        let selector: serde_json::Map<String, Json> =
            self.labels.labels(owner).into_iter().map(|(k, v)| (k, Json::String(v))).collect();
        let kinds: Vec<Json> = objects
            .unique_group_kinds()
            .into_iter()
            .map(|gk| json!({ "group": gk.group, "kind": gk.kind }))
            .collect();
        let phase = AssemblyPhase::from_status(&owner.status());

        let app = &mut objects.items[index];
        let key = app.key();
        app.set_nested(json!({ "matchLabels": selector }), &["spec", "selector"])
            .and_then(|_| app.set_nested(Json::Array(kinds), &["spec", "componentGroupKinds"]))
            .and_then(|_| match owner.declared_version() {
                Some(v) => app.set_nested(Json::String(v.to_string()), &["spec", "descriptor", "version"]),
                None => Ok(()),
            })
            .and_then(|_| app.set_nested(Json::String(phase.as_str().to_string()), &["spec", "assemblyPhase"]))
            .with_context(|| format!("updating application {}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedLabels;
    use declarative_core::parse;
    use std::collections::BTreeMap;

    const MANIFEST: &str = r#"
apiVersion: app.k8s.io/v1beta1
kind: Application
metadata: {name: dash}
spec:
  descriptor: {type: dashboard}
---
apiVersion: v1
kind: Service
metadata: {name: dash}
---
apiVersion: apps/v1
kind: Deployment
metadata: {name: dash}
---
apiVersion: v1
kind: ConfigMap
metadata: {name: dash-config}
"#;

    fn owner(status: Json) -> DeclarativeObject {
        DeclarativeObject::from_json(json!({
            "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
            "metadata": {"name": "dash", "namespace": "ops"},
            "spec": {"version": "1.8.3"},
            "status": status,
        }))
        .unwrap()
    }

    fn transform() -> ManagedApplication {
        ManagedApplication::new(Arc::new(FixedLabels(BTreeMap::from([("app".to_string(), "dash".to_string())]))))
    }

    #[test]
    fn single_application_is_synchronised() {
        let mut set = parse(MANIFEST).unwrap();
        transform().transform(&owner(json!({"healthy": true})), &mut set).unwrap();
        let app = &set.items[0];
        assert_eq!(app.nested(&["spec", "selector"]), Some(&json!({"matchLabels": {"app": "dash"}})));
        assert_eq!(
            app.nested(&["spec", "componentGroupKinds"]),
            Some(&json!([
                {"group": "app.k8s.io", "kind": "Application"},
                {"group": "", "kind": "ConfigMap"},
                {"group": "apps", "kind": "Deployment"},
                {"group": "", "kind": "Service"},
            ]))
        );
        assert_eq!(app.nested_str(&["spec", "descriptor", "version"]), Some("1.8.3"));
        assert_eq!(app.nested_str(&["spec", "descriptor", "type"]), Some("dashboard"));
        assert_eq!(app.nested_str(&["spec", "assemblyPhase"]), Some("Succeeded"));
    }

    #[test]
    fn phase_follows_owner_health() {
        assert_eq!(AssemblyPhase::from_status(&CommonStatus::default()), AssemblyPhase::Pending);
        assert_eq!(AssemblyPhase::from_status(&CommonStatus::failed("boom", None)), AssemblyPhase::Failed);

        let mut set = parse(MANIFEST).unwrap();
        transform().transform(&owner(json!({"healthy": false, "phase": "Failed"})), &mut set).unwrap();
        assert_eq!(set.items[0].nested_str(&["spec", "assemblyPhase"]), Some("Failed"));
    }

    #[test]
    fn two_applications_are_left_alone() {
        let text = format!(
            "{}\n---\napiVersion: app.k8s.io/v1beta1\nkind: Application\nmetadata: {{name: other}}\n",
            MANIFEST
        );
        let mut set = parse(&text).unwrap();
        let before = set.clone();
        transform().transform(&owner(json!({"healthy": true})), &mut set).unwrap();
        assert_eq!(set, before);
    }

    #[test]
    fn no_application_is_a_no_op() {
        let mut set = parse("apiVersion: v1\nkind: Service\nmetadata: {name: s}\n").unwrap();
        let before = set.clone();
        transform().transform(&owner(json!({})), &mut set).unwrap();
        assert_eq!(set, before);
    }
}
