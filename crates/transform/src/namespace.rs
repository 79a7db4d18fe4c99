use anyhow::Context;
use declarative_core::{DeclarativeObject, ObjectSet};

use crate::ObjectTransform;

/// Overwrite every object's namespace with the owner's. Cluster-scoped
/// owners leave the manifest untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinNamespace;

impl ObjectTransform for PinNamespace {
    fn name(&self) -> &str { "pin-namespace" }

    fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()> {
        let Some(ns) = owner.namespace() else { return Ok(()) };
        for o in objects.iter_mut() {
            let key = o.key();
            o.set_namespace(ns).with_context(|| format!("setting namespace on {}", key))?;
        }
        objects.check_unique().with_context(|| format!("pinning objects to namespace {}", ns))?;
        Ok(())
    }
}
