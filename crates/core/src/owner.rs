//! The owner custom resource ("declarative object") and its common status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::gvk::GroupVersionKind;
use crate::object::ParseError;

/// Status fields every declarative object carries under `.status`.
/// All fields serialize (no skipping) so a merge patch also clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonStatus {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Ready, Progressing or Failed
    #[serde(default)]
    pub phase: Option<String>,
    /// Version that was last rolled out
    #[serde(default)]
    pub version: Option<String>,
}

pub const PHASE_READY: &str = "Ready";
pub const PHASE_PROGRESSING: &str = "Progressing";
pub const PHASE_FAILED: &str = "Failed";

impl CommonStatus {
    pub fn failed(error: impl Into<String>, version: Option<String>) -> Self {
        Self { healthy: false, errors: vec![error.into()], phase: Some(PHASE_FAILED.to_string()), version }
    }
}

/// Namespace/name of an owner; the key reconcile requests are queued under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The custom resource driving one reconciliation, held as raw JSON so the
/// engine works for any CRD.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclarativeObject {
    gvk: GroupVersionKind,
    raw: Json,
}

impl DeclarativeObject {
    pub fn from_json(raw: Json) -> Result<Self, ParseError> {
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str())
            .ok_or(ParseError::Missing { index: 0, field: "apiVersion" })?;
        let kind = raw.get("kind").and_then(|v| v.as_str())
            .ok_or(ParseError::Missing { index: 0, field: "kind" })?;
        let gvk = GroupVersionKind::from_api_version(api_version, kind);
        Self::with_gvk(gvk, raw)
    }

    /// Use when the payload may lack type metadata (e.g. list items).
    pub fn with_gvk(gvk: GroupVersionKind, raw: Json) -> Result<Self, ParseError> {
        if !raw.is_object() {
            return Err(ParseError::NotAMapping { index: 0, found: "non-map" });
        }
        let named = raw.get("metadata").and_then(|m| m.get("name")).and_then(|n| n.as_str()).is_some();
        if !named {
            return Err(ParseError::Missing { index: 0, field: "metadata.name" });
        }
        Ok(Self { gvk, raw })
    }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }

    pub fn gvk(&self) -> &GroupVersionKind { &self.gvk }
    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or_default() }
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace").filter(|ns| !ns.is_empty()) }
    pub fn uid(&self) -> Option<&str> { self.meta_str("uid").filter(|u| !u.is_empty()) }
    pub fn key(&self) -> OwnerKey { OwnerKey::new(self.namespace(), self.name()) }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|l| l.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    pub fn spec(&self) -> Option<&Json> { self.raw.get("spec") }

    /// `spec.version`, the version the user asked for.
    pub fn declared_version(&self) -> Option<&str> {
        self.spec().and_then(|s| s.get("version")).and_then(|v| v.as_str())
    }

    /// Status as last written; malformed or absent status reads as default.
    pub fn status(&self) -> CommonStatus {
        self.raw
            .get("status")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or_default()
    }

    pub fn with_status(mut self, status: &CommonStatus) -> Self {
        if let (Some(map), Ok(v)) = (self.raw.as_object_mut(), serde_json::to_value(status)) {
            map.insert("status".to_string(), v);
        }
        self
    }

    pub fn as_json(&self) -> &Json { &self.raw }
}
