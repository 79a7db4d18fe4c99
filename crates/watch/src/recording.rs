use std::collections::BTreeSet;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use declarative_core::{GroupVersionKind, OwnerKey};
use declarative_kubehub::{DynamicWatch, WatchFilter};

/// A [`DynamicWatch`] that only records registrations; kinds can be made to
/// fail by name.
#[derive(Default)]
pub struct RecordingWatch {
    adds: Mutex<Vec<(GroupVersionKind, WatchFilter, OwnerKey)>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingWatch {
    pub fn new() -> Self { Self::default() }

    pub fn adds(&self) -> Vec<(GroupVersionKind, WatchFilter, OwnerKey)> {
        self.adds.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_on(&self, kind: &str) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(kind.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait::async_trait]
impl DynamicWatch for RecordingWatch {
    async fn add(&self, kind: &GroupVersionKind, filter: &WatchFilter, target: &OwnerKey) -> Result<()> {
        // let other tasks interleave the way a real API round trip would
        tokio::task::yield_now().await;
        self.adds.lock().unwrap_or_else(|e| e.into_inner()).push((kind.clone(), filter.clone(), target.clone()));
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&kind.kind) {
            return Err(anyhow!("watch for {} refused", kind));
        }
        Ok(())
    }
}
