use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use declarative_core::DeclarativeObject;
use tracing::debug;

/// Turns an owner into raw manifest text.
#[async_trait::async_trait]
pub trait ManifestController: Send + Sync {
    async fn resolve_manifest(&self, owner: &DeclarativeObject) -> Result<String>;
}

/// The same manifest for every owner.
#[derive(Debug, Clone)]
pub struct StaticResolver(pub String);

#[async_trait::async_trait]
impl ManifestController for StaticResolver {
    async fn resolve_manifest(&self, _owner: &DeclarativeObject) -> Result<String> { Ok(self.0.clone()) }
}

/// Reads manifests from disk.
///
/// A file path is returned as is. For a directory, an owner that declares
/// `spec.version` reads `<dir>/<version>/manifest.yaml`; otherwise
/// `<dir>/manifest.yaml`.
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn path_for(&self, owner: &DeclarativeObject) -> PathBuf {
        if !self.root.is_dir() {
            return self.root.clone();
        }
        match owner.declared_version() {
            Some(version) => self.root.join(version).join("manifest.yaml"),
            None => self.root.join("manifest.yaml"),
        }
    }

    pub fn root(&self) -> &Path { &self.root }
}

#[async_trait::async_trait]
impl ManifestController for FileResolver {
    async fn resolve_manifest(&self, owner: &DeclarativeObject) -> Result<String> {
        let path = self.path_for(owner);
        debug!(owner = %owner.key(), path = %path.display(), "reading manifest");
        tokio::fs::read_to_string(&path).await.with_context(|| format!("reading manifest {}", path.display()))
    }
}
