//! Declarative reconciler: resolves an owner's manifest, runs the transform
//! pipeline, materializes the result, reports status and feeds the dynamic
//! watch registry.
//!
//! A [`ReconcilerBuilder`] freezes all configuration once; the resulting
//! [`Reconciler`] is shared across ticks. [`Runner`] is a minimal serial work
//! loop with coalescing and exponential backoff for driving it.

#![forbid(unsafe_code)]

use declarative_apply::{ApplyError, ApplyReport};
use declarative_core::{OwnerKey, ParseError};
use declarative_transform::TransformError;
use thiserror::Error;

mod config;
mod reconciler;
mod resolver;
mod runner;

pub use config::{EngineConfig, ReconcilerBuilder, ReconcilerConfig};
pub use reconciler::Reconciler;
pub use resolver::{FileResolver, ManifestController, StaticResolver};
pub use runner::Runner;

pub use declarative_apply::{owner_selector_fn, OwnerSelector, SourceAsOwner};
pub use declarative_status::{BasicStatus, Status};
pub use declarative_transform::{
    operation_fn, transform_fn, AddLabels, FixedLabels, ImageRegistry, LabelMaker, ManifestOperation, ObjectTransform,
    SourceLabels,
};
pub use declarative_watch::{ReconcileRequest, Sink, WatchRegistry};

/// Everything a build or a tick can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid reconciler configuration: {0}")]
    Configuration(String),
    #[error("resolving manifest for {owner}: {source:#}")]
    Resolution { owner: OwnerKey, #[source] source: anyhow::Error },
    #[error("parsing manifest: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transform(TransformError),
    #[error(transparent)]
    Owner(ApplyError),
    #[error("apply failed: {0}")]
    Apply(ApplyReport),
    #[error(transparent)]
    PruneList(ApplyError),
    #[error("status: {0:#}")]
    Status(anyhow::Error),
    #[error("reading owner {owner}: {source:#}")]
    Fetch { owner: OwnerKey, #[source] source: anyhow::Error },
}

impl From<TransformError> for Error {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Parse(p) => Error::Parse(p),
            other => Error::Transform(other),
        }
    }
}

impl From<ApplyError> for Error {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Incomplete(report) => Error::Apply(report),
            ApplyError::PruneList { .. } => Error::PruneList(e),
            ApplyError::UnscopedPrune => Error::Configuration(e.to_string()),
            ApplyError::Owner { .. } | ApplyError::OwnerReference { .. } => Error::Owner(e),
        }
    }
}

impl Error {
    /// Whether retrying the same tick can help.
    pub fn is_retryable(&self) -> bool { !matches!(self, Error::Configuration(_)) }
}
