//! Manifest objects: parsed resource descriptors and the ordered set of them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::gvk::{GroupKind, GroupVersionKind};

/// Kinds whose pod template the image-registry rewrite touches.
pub const WORKLOAD_KINDS: [&str; 5] = ["Deployment", "DaemonSet", "StatefulSet", "Job", "CronJob"];

const DEFAULT_MAX_MANIFEST_BYTES: usize = 1 << 20; // 1 MiB
const DEFAULT_MAX_MANIFEST_NODES: usize = 100_000;

fn max_manifest_bytes() -> usize {
    std::env::var("DECL_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_MANIFEST_BYTES)
}

fn max_manifest_nodes() -> usize {
    std::env::var("DECL_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_MANIFEST_NODES)
}

/// True when `v` has more than `max` nodes; a document of exactly `max` passes.
fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail as soon as the budget is passed
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "map",
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("manifest too large ({size} bytes > {max})")]
    TooLarge { size: usize, max: usize },
    #[error("document {index}: too complex (>{max} nodes)")]
    TooComplex { index: usize, max: usize },
    #[error("document {index}: invalid YAML: {source}")]
    Yaml { index: usize, #[source] source: serde_yaml::Error },
    #[error("document {index}: cannot convert to JSON: {source}")]
    Convert { index: usize, #[source] source: serde_json::Error },
    #[error("document {index}: expected a mapping, found {found}")]
    NotAMapping { index: usize, found: &'static str },
    #[error("document {index}: missing {field}")]
    Missing { index: usize, field: &'static str },
    #[error("duplicate object {0} in manifest")]
    Duplicate(ObjectKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("empty field path")]
    EmptyPath,
    #[error("field {path}: expected a map, found {found}")]
    NotAMap { path: String, found: &'static str },
    #[error("field {path}: expected a list, found {found}")]
    NotAList { path: String, found: &'static str },
    #[error("{kind} has no pod template at {path}")]
    NoPodTemplate { kind: String, path: String },
}

/// Identity of an object within a set: group, kind, namespace, name.
/// Version is not part of identity; the same object may be served at several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Build a key from a raw API object (as returned by a list call).
    pub fn from_json(v: &Json) -> Option<Self> {
        let api_version = v.get("apiVersion")?.as_str()?;
        let kind = v.get("kind")?.as_str()?;
        let meta = v.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let namespace = meta.get("namespace").and_then(|n| n.as_str()).filter(|n| !n.is_empty());
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        Some(Self { group: gvk.group, kind: gvk.kind, namespace: namespace.map(str::to_string), name: name.to_string() })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = GroupKind { group: self.group.clone(), kind: self.kind.clone() };
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", gk, ns, self.name),
            None => write!(f, "{} {}", gk, self.name),
        }
    }
}

/// One resource descriptor from a manifest. The JSON tree is the single
/// source of truth; the GVK is cached because `apiVersion`/`kind` never change
/// after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    gvk: GroupVersionKind,
    raw: Map<String, Json>,
}

impl Object {
    /// Wrap a JSON mapping; requires `apiVersion`, `kind` and `metadata.name`.
    pub fn from_json(v: Json) -> Result<Self, ParseError> {
        Self::from_document(0, v)
    }

    fn from_document(index: usize, v: Json) -> Result<Self, ParseError> {
        let raw = match v {
            Json::Object(map) => map,
            other => return Err(ParseError::NotAMapping { index, found: type_name(&other) }),
        };
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
            .ok_or(ParseError::Missing { index, field: "apiVersion" })?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
            .ok_or(ParseError::Missing { index, field: "kind" })?;
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        let has_name = raw
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .map(|n| !n.is_empty())
            .unwrap_or(false);
        if !has_name {
            return Err(ParseError::Missing { index, field: "metadata.name" });
        }
        Ok(Self { gvk, raw })
    }

    pub fn gvk(&self) -> &GroupVersionKind { &self.gvk }
    pub fn group(&self) -> &str { &self.gvk.group }
    pub fn version(&self) -> &str { &self.gvk.version }
    pub fn kind(&self) -> &str { &self.gvk.kind }
    pub fn group_kind(&self) -> GroupKind { self.gvk.group_kind() }

    pub fn name(&self) -> &str {
        self.nested_str(&["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.nested_str(&["metadata", "namespace"]).filter(|ns| !ns.is_empty())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            group: self.gvk.group.clone(),
            kind: self.gvk.kind.clone(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(Json::Object(map)) = self.nested(&["metadata", "labels"]) {
            for (k, v) in map {
                if let Some(s) = v.as_str() { out.insert(k.clone(), s.to_string()); }
            }
        }
        out
    }

    /// Merge `labels` into `metadata.labels`; existing keys are overwritten.
    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) -> Result<(), FieldError> {
        if labels.is_empty() { return Ok(()); }
        let map = self.map_at(&["metadata", "labels"])?;
        for (k, v) in labels {
            map.insert(k.clone(), Json::String(v.clone()));
        }
        Ok(())
    }

    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), FieldError> {
        self.set_nested(Json::String(namespace.to_string()), &["metadata", "namespace"])
    }

    pub fn nested(&self, path: &[&str]) -> Option<&Json> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.raw.get(*first)?;
        for seg in rest {
            cur = cur.as_object()?.get(*seg)?;
        }
        Some(cur)
    }

    pub fn nested_str(&self, path: &[&str]) -> Option<&str> {
        self.nested(path).and_then(|v| v.as_str())
    }

    /// Set `value` at `path`, creating missing intermediate maps. A segment
    /// that exists but is not a map is an error; nothing is overwritten.
    pub fn set_nested(&mut self, value: Json, path: &[&str]) -> Result<(), FieldError> {
        let (last, parents) = path.split_last().ok_or(FieldError::EmptyPath)?;
        let map = self.map_at(parents)?;
        map.insert((*last).to_string(), value);
        Ok(())
    }

    /// Walk to (creating if absent) the map at `path`.
    fn map_at(&mut self, path: &[&str]) -> Result<&mut Map<String, Json>, FieldError> {
        let mut cur = &mut self.raw;
        for (i, seg) in path.iter().enumerate() {
            let entry = cur.entry((*seg).to_string()).or_insert_with(|| Json::Object(Map::new()));
            let found = type_name(entry);
            cur = match entry {
                Json::Object(child) => child,
                _ => return Err(FieldError::NotAMap { path: path[..=i].join("."), found }),
            };
        }
        Ok(cur)
    }

    /// Run `f` on the pod spec of a workload-shaped object.
    pub fn mutate_pod_spec<F>(&mut self, mut f: F) -> Result<(), FieldError>
    where
        F: FnMut(&mut Map<String, Json>) -> Result<(), FieldError>,
    {
        let path = pod_spec_path(self.kind());
        let kind = self.kind().to_string();
        let missing = || FieldError::NoPodTemplate { kind: kind.clone(), path: path.join(".") };
        let (first, rest) = path.split_first().ok_or_else(missing)?;
        let mut cur = self.raw.get_mut(*first).ok_or_else(missing)?;
        for seg in rest {
            cur = cur.as_object_mut().and_then(|m| m.get_mut(*seg)).ok_or_else(missing)?;
        }
        let found = type_name(cur);
        let spec = cur.as_object_mut().ok_or_else(|| FieldError::NotAMap { path: path.join("."), found })?;
        f(spec)
    }

    /// Run `f` on every entry of `containers` and `initContainers`.
    pub fn mutate_containers<F>(&mut self, mut f: F) -> Result<(), FieldError>
    where
        F: FnMut(&mut Map<String, Json>) -> Result<(), FieldError>,
    {
        self.mutate_pod_spec(|spec| {
            for field in ["initContainers", "containers"] {
                let Some(list) = spec.get_mut(field) else { continue };
                let found = type_name(list);
                let items = list.as_array_mut().ok_or_else(|| FieldError::NotAList { path: field.to_string(), found })?;
                for (i, c) in items.iter_mut().enumerate() {
                    let found = type_name(c);
                    let container = c
                        .as_object_mut()
                        .ok_or_else(|| FieldError::NotAMap { path: format!("{}[{}]", field, i), found })?;
                    f(container)?;
                }
            }
            Ok(())
        })
    }

    pub fn as_json(&self) -> &Map<String, Json> { &self.raw }

    pub fn to_json(&self) -> Json { Json::Object(self.raw.clone()) }

    pub fn into_json(self) -> Json { Json::Object(self.raw) }
}

fn pod_spec_path(kind: &str) -> &'static [&'static str] {
    match kind {
        "CronJob" => &["spec", "jobTemplate", "spec", "template", "spec"],
        "Pod" => &["spec"],
        _ => &["spec", "template", "spec"],
    }
}

/// Ordered objects of one manifest; document order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSet {
    pub items: Vec<Object>,
}

impl ObjectSet {
    /// Build a set, rejecting two objects with the same identity.
    pub fn new(items: Vec<Object>) -> Result<Self, ParseError> {
        let set = Self { items };
        set.check_unique()?;
        Ok(set)
    }

    /// Re-check identity uniqueness after a mutation that can change keys.
    pub fn check_unique(&self) -> Result<(), ParseError> {
        let mut seen = BTreeSet::new();
        for o in &self.items {
            let key = o.key();
            if !seen.insert(key.clone()) {
                return Err(ParseError::Duplicate(key));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, Object> { self.items.iter() }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Object> { self.items.iter_mut() }

    /// Distinct GVKs, sorted by canonical string form.
    pub fn unique_gvks(&self) -> Vec<GroupVersionKind> {
        self.items.iter().map(|o| o.gvk().clone()).collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Distinct GroupKinds, sorted by canonical string form.
    pub fn unique_group_kinds(&self) -> Vec<GroupKind> {
        self.items.iter().map(|o| o.group_kind()).collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Whether a live object with identity `key` is part of this set.
    /// Cluster-scoped objects come back from the server without a namespace
    /// even when the manifest (or namespace pinning) gave them one, so a live
    /// key without a namespace matches on group, kind and name alone. A
    /// namespaced live object must match the desired namespace exactly.
    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.items.iter().any(|o| {
            o.group() == key.group
                && o.kind() == key.kind
                && o.name() == key.name
                && (key.namespace.is_none() || o.namespace() == key.namespace.as_deref())
        })
    }

    /// Render back to multi-document YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut out = String::new();
        for (i, o) in self.items.iter().enumerate() {
            if i > 0 { out.push_str("---\n"); }
            out.push_str(&serde_yaml::to_string(&o.to_json())?);
        }
        Ok(out)
    }
}

impl<'a> IntoIterator for &'a ObjectSet {
    type Item = &'a Object;
    type IntoIter = std::slice::Iter<'a, Object>;
    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}

/// Parse multi-document manifest text. Empty documents are skipped and
/// `kind: List` documents are flattened into their items.
pub fn parse(text: &str) -> Result<ObjectSet, ParseError> {
    parse_with_limits(text, max_manifest_bytes(), max_manifest_nodes())
}

fn parse_with_limits(text: &str, max_bytes: usize, max_nodes: usize) -> Result<ObjectSet, ParseError> {
    if text.len() > max_bytes {
        return Err(ParseError::TooLarge { size: text.len(), max: max_bytes });
    }
    let mut items = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| ParseError::Yaml { index, source })?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).map_err(|source| ParseError::Convert { index, source })?;
        if node_budget_exceeded(&json, max_nodes) {
            return Err(ParseError::TooComplex { index, max: max_nodes });
        }
        if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
            let list = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
            for item in list {
                items.push(Object::from_document(index, item)?);
            }
            continue;
        }
        items.push(Object::from_document(index, json)?);
    }
    ObjectSet::new(items)
}
