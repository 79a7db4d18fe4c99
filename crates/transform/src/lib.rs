//! Declarative transform pipeline.
//!
//! A tick turns resolved manifest text into the object set to materialize:
//! raw-text operations run first (in registration order), the result is
//! parsed, then object transforms run (in registration order) against the
//! whole set so they can reason across objects. The first error stops the
//! pipeline; nothing is applied because apply happens strictly afterwards.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use declarative_core::{parse, DeclarativeObject, ObjectSet, ParseError};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

mod application;
mod image;
mod labels;
mod namespace;

pub use application::{AssemblyPhase, ManagedApplication};
pub use image::{rewrite_image, ImageRegistry};
pub use labels::{AddLabels, FixedLabels, SourceLabels};
pub use namespace::PinNamespace;

/// Rewrites raw manifest text before it is parsed.
pub trait ManifestOperation: Send + Sync {
    fn apply(&self, owner: &DeclarativeObject, manifest: String) -> anyhow::Result<String>;
}

/// Mutates the parsed object set. Implementations must be safe to re-run on
/// their own output.
pub trait ObjectTransform: Send + Sync {
    fn name(&self) -> &str { std::any::type_name::<Self>() }
    fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()>;
}

/// Fixed labels for a given owner; must be deterministic.
pub trait LabelMaker: Send + Sync {
    fn labels(&self, owner: &DeclarativeObject) -> BTreeMap<String, String>;
}

pub struct FnOperation<F>(F);

/// Wrap a closure as a [`ManifestOperation`].
pub fn operation_fn<F>(f: F) -> FnOperation<F>
where
    F: Fn(&DeclarativeObject, String) -> anyhow::Result<String> + Send + Sync,
{
    FnOperation(f)
}

impl<F> ManifestOperation for FnOperation<F>
where
    F: Fn(&DeclarativeObject, String) -> anyhow::Result<String> + Send + Sync,
{
    fn apply(&self, owner: &DeclarativeObject, manifest: String) -> anyhow::Result<String> { (self.0)(owner, manifest) }
}

pub struct FnTransform<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named [`ObjectTransform`].
pub fn transform_fn<F>(name: impl Into<String>, f: F) -> FnTransform<F>
where
    F: Fn(&DeclarativeObject, &mut ObjectSet) -> anyhow::Result<()> + Send + Sync,
{
    FnTransform { name: name.into(), f }
}

impl<F> ObjectTransform for FnTransform<F>
where
    F: Fn(&DeclarativeObject, &mut ObjectSet) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str { &self.name }
    fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> anyhow::Result<()> { (self.f)(owner, objects) }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("manifest operation #{index} failed: {source}")]
    Operation { index: usize, #[source] source: anyhow::Error },
    #[error("parsing manifest: {0}")]
    Parse(#[from] ParseError),
    #[error("transform {name} failed: {source}")]
    Transform { name: String, #[source] source: anyhow::Error },
}

/// Ordered raw operations and object transforms.
#[derive(Clone, Default)]
pub struct Pipeline {
    operations: Vec<Arc<dyn ManifestOperation>>,
    transforms: Vec<Arc<dyn ObjectTransform>>,
}

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    pub fn push_operation(&mut self, op: Arc<dyn ManifestOperation>) { self.operations.push(op); }
    pub fn push_transform(&mut self, t: Arc<dyn ObjectTransform>) { self.transforms.push(t); }

    pub fn with_operation(mut self, op: impl ManifestOperation + 'static) -> Self {
        self.push_operation(Arc::new(op));
        self
    }

    pub fn with_transform(mut self, t: impl ObjectTransform + 'static) -> Self {
        self.push_transform(Arc::new(t));
        self
    }

    pub fn transform_names(&self) -> Vec<&str> { self.transforms.iter().map(|t| t.name()).collect() }

    /// Raw operations, parse, object transforms; stops at the first error.
    pub fn run(&self, owner: &DeclarativeObject, manifest: String) -> Result<ObjectSet, TransformError> {
        let mut text = manifest;
        for (index, op) in self.operations.iter().enumerate() {
            text = op.apply(owner, text).map_err(|source| TransformError::Operation { index, source })?;
        }
        let mut objects = parse(&text)?;
        self.transform(owner, &mut objects)?;
        counter!("pipeline_runs_total", 1u64);
        Ok(objects)
    }

    /// Only the object-transform stage.
    pub fn transform(&self, owner: &DeclarativeObject, objects: &mut ObjectSet) -> Result<(), TransformError> {
        for t in &self.transforms {
            debug!(transform = %t.name(), objects = objects.len(), "applying transform");
            t.transform(owner, objects)
                .map_err(|source| TransformError::Transform { name: t.name().to_string(), source })?;
        }
        Ok(())
    }
}
