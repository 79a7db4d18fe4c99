use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use declarative_core::{GroupVersionKind, ObjectKey};
use serde_json::Value as Json;

use crate::{selector_matches, ResourceServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    List,
    Delete,
    PatchStatus,
}

/// In-memory resource server: records every call and can be told to fail
/// specific ones. Used by tests and by `declctl render --dry-run` style flows.
#[derive(Default)]
pub struct MemoryServer {
    objects: Mutex<BTreeMap<ObjectKey, Json>>,
    calls: Mutex<Vec<(Verb, String)>>,
    failures: Mutex<BTreeSet<(Verb, String)>>,
}

fn key_of(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    ObjectKey {
        group: gvk.group.clone(),
        kind: gvk.kind.clone(),
        namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        name: name.to_string(),
    }
}

fn labels_of(obj: &Json) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|l| l.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

impl MemoryServer {
    pub fn new() -> Self { Self::default() }

    /// Seed an object directly, bypassing call recording.
    pub fn insert(&self, obj: Json) -> Result<()> {
        let key = ObjectKey::from_json(&obj).ok_or_else(|| anyhow!("object missing apiVersion/kind/metadata.name"))?;
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(key, obj);
        Ok(())
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Json> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<(Verb, String)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).iter().filter(|(v, _)| *v == verb).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Make `verb` fail for objects called `name` (for `List`, the kind).
    pub fn fail_on(&self, verb: Verb, name: &str) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).insert((verb, name.to_string()));
    }

    fn record(&self, verb: Verb, subject: String, name: &str) -> Result<()> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((verb, subject.clone()));
        if self.failures.lock().unwrap_or_else(|e| e.into_inner()).contains(&(verb, name.to_string())) {
            return Err(anyhow!("injected {:?} failure for {}", verb, subject));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceServer for MemoryServer {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<Json>> {
        let key = key_of(gvk, namespace, name);
        self.record(Verb::Get, key.to_string(), name)?;
        Ok(self.object(&key))
    }

    async fn create(&self, _gvk: &GroupVersionKind, obj: &Json) -> Result<()> {
        let key = ObjectKey::from_json(obj).ok_or_else(|| anyhow!("object missing apiVersion/kind/metadata.name"))?;
        self.record(Verb::Create, key.to_string(), &key.name)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        if objects.contains_key(&key) {
            return Err(anyhow!("{} already exists", key));
        }
        objects.insert(key, obj.clone());
        Ok(())
    }

    async fn update(&self, _gvk: &GroupVersionKind, obj: &Json) -> Result<()> {
        let key = ObjectKey::from_json(obj).ok_or_else(|| anyhow!("object missing apiVersion/kind/metadata.name"))?;
        self.record(Verb::Update, key.to_string(), &key.name)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let live = objects.get_mut(&key).ok_or_else(|| anyhow!("{} not found", key))?;
        // status is owned by the server side
        let status = live.get("status").cloned();
        *live = obj.clone();
        if let (Some(status), Some(map)) = (status, live.as_object_mut()) {
            map.insert("status".to_string(), status);
        }
        Ok(())
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: &str) -> Result<Vec<Json>> {
        self.record(Verb::List, format!("{} ({})", gvk.key(), label_selector), &gvk.kind)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .iter()
            .filter(|(k, _)| k.group == gvk.group && k.kind == gvk.kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, v)| selector_matches(label_selector, &labels_of(v)))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = key_of(gvk, namespace, name);
        self.record(Verb::Delete, key.to_string(), name)?;
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        Ok(())
    }

    async fn patch_status(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str, status: &Json) -> Result<()> {
        let key = key_of(gvk, namespace, name);
        self.record(Verb::PatchStatus, key.to_string(), name)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let live = objects.get_mut(&key).ok_or_else(|| anyhow!("{} not found", key))?;
        let map = live.as_object_mut().ok_or_else(|| anyhow!("{} is not a map", key))?;
        let current = map.entry("status").or_insert_with(|| Json::Object(Default::default()));
        match (current.as_object_mut(), status.as_object()) {
            (Some(cur), Some(patch)) => {
                for (k, v) in patch {
                    if v.is_null() { cur.remove(k); } else { cur.insert(k.clone(), v.clone()); }
                }
            }
            _ => *current = status.clone(),
        }
        Ok(())
    }
}
