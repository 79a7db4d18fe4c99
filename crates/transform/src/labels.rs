use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use declarative_core::{DeclarativeObject, ObjectSet};

use crate::{LabelMaker, ObjectTransform};

/// The same labels for every owner.
#[derive(Debug, Clone, Default)]
pub struct FixedLabels(pub BTreeMap<String, String>);

impl LabelMaker for FixedLabels {
    fn labels(&self, _owner: &DeclarativeObject) -> BTreeMap<String, String> { self.0.clone() }
}

/// `{<group>/<lowercased kind>: <owner name>}`, e.g.
/// `addons.example.org/dashboard: dash`. Identifies every object a given
/// owner materialized; the key alone identifies objects of any owner of the
/// managed kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceLabels;

impl SourceLabels {
    pub fn key(owner: &DeclarativeObject) -> String {
        let gvk = owner.gvk();
        let group = if gvk.group.is_empty() { "declarative.dev" } else { gvk.group.as_str() };
        format!("{}/{}", group, gvk.kind.to_lowercase())
    }
}

impl LabelMaker for SourceLabels {
    fn labels(&self, owner: &DeclarativeObject) -> BTreeMap<String, String> {
        BTreeMap::from([(Self::key(owner), owner.name().to_string())])
    }
}

/// Merge labels into every object; existing labels stay, injected keys win.
#[derive(Clone)]
pub struct AddLabels {
    maker: Arc<dyn LabelMaker>,
}

impl AddLabels {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self { maker: Arc::new(FixedLabels(labels)) }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Labels computed per owner.
    pub fn from_maker(maker: Arc<dyn LabelMaker>) -> Self {
        Self { maker }
    }
}

impl ObjectTransform for AddLabels {
    fn name(&self) -> &str { "add-labels" }

    fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()> {
        let labels = self.maker.labels(owner);
        for o in objects.iter_mut() {
            let key = o.key();
            o.add_labels(&labels).with_context(|| format!("labelling {}", key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative_core::parse;
    use serde_json::json;

    fn owner() -> DeclarativeObject {
        DeclarativeObject::from_json(json!({
            "apiVersion": "addons.example.org/v1alpha1", "kind": "Dashboard",
            "metadata": {"name": "dash", "namespace": "ops"}
        }))
        .unwrap()
    }

    #[test]
    fn injected_labels_merge_and_take_precedence() {
        let mut set = parse(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: s\n  labels:\n    app: old\n    keep: yes-please\n",
        )
        .unwrap();
        AddLabels::from_pairs([("app", "dashboard"), ("team", "ops")]).transform(&owner(), &mut set).unwrap();
        let labels = set.items[0].labels();
        assert_eq!(labels.get("app").map(String::as_str), Some("dashboard"));
        assert_eq!(labels.get("team").map(String::as_str), Some("ops"));
        assert_eq!(labels.get("keep").map(String::as_str), Some("yes-please"));
    }

    #[test]
    fn labels_field_that_is_not_a_map_fails() {
        let mut set = parse("apiVersion: v1\nkind: Service\nmetadata:\n  name: s\n  labels: nope\n").unwrap();
        let err = AddLabels::from_pairs([("a", "b")]).transform(&owner(), &mut set).unwrap_err();
        assert!(format!("{:#}", err).contains("metadata.labels"), "err={:#}", err);
    }

    #[test]
    fn source_labels_key_by_group_and_kind() {
        let labels = SourceLabels.labels(&owner());
        assert_eq!(labels.get("addons.example.org/dashboard").map(String::as_str), Some("dash"));
    }
}
