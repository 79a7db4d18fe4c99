use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use declarative_apply::{Materializer, OwnerSelector, SourceAsOwner};
use declarative_core::{DeclarativeObject, GroupVersionKind};
use declarative_kubehub::{DynamicWatch, ResourceServer, WatchFilter};
use declarative_status::Status;
use declarative_transform::{
    AddLabels, ImageRegistry, LabelMaker, ManagedApplication, ManifestOperation, ObjectTransform, PinNamespace,
    Pipeline,
};
use declarative_watch::{Sink, WatchRegistry};

use crate::{Error, ManifestController, Reconciler};

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Process-level knobs read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Watch event channel capacity; also sizes the initial request queue.
    pub queue_cap: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub field_manager: String,
    pub private_registry: Option<String>,
    pub image_pull_secret: Option<String>,
    pub metrics_addr: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_cap: 1024,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            field_manager: "declarative".to_string(),
            private_registry: None,
            image_pull_secret: None,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_cap: env_parse("DECL_QUEUE_CAP", d.queue_cap),
            backoff_min: Duration::from_millis(env_parse("DECL_BACKOFF_MIN_MS", 500u64)),
            backoff_max: Duration::from_secs(env_parse("DECL_BACKOFF_MAX_SECS", 300u64)),
            field_manager: env_string("DECL_FIELD_MANAGER").unwrap_or(d.field_manager),
            private_registry: env_string("DECL_PRIVATE_REGISTRY"),
            image_pull_secret: env_string("DECL_IMAGE_PULL_SECRET"),
            metrics_addr: env_string("DECL_METRICS_ADDR"),
        }
    }

    /// Registry rewrite configured through the environment, if any.
    pub fn image_registry(&self) -> Option<ImageRegistry> {
        if self.private_registry.is_none() && self.image_pull_secret.is_none() {
            return None;
        }
        Some(ImageRegistry::new(
            self.private_registry.clone().unwrap_or_default(),
            self.image_pull_secret.clone().unwrap_or_default(),
        ))
    }
}

/// Frozen reconciler configuration, shared by every tick.
pub struct ReconcilerConfig {
    pub gvk: GroupVersionKind,
    pub pipeline: Pipeline,
    pub manifest: Arc<dyn ManifestController>,
    pub labels: Option<Arc<dyn LabelMaker>>,
    pub prune: bool,
    pub preserve_namespace: bool,
    pub status: Option<Arc<dyn Status>>,
    pub sink: Option<Arc<dyn Sink>>,
}

impl ReconcilerConfig {
    /// Labels identifying `owner`'s objects, when a label maker is set.
    pub fn labels_for(&self, owner: &DeclarativeObject) -> Option<BTreeMap<String, String>> {
        self.labels.as_ref().map(|m| m.labels(owner))
    }
}

enum Stage {
    Transform(Arc<dyn ObjectTransform>),
    Labels,
    Application,
}

/// Collects reconciler options. Mistakes are recorded and reported by
/// [`ReconcilerBuilder::build`].
#[derive(Default)]
pub struct ReconcilerBuilder {
    gvk: Option<GroupVersionKind>,
    operations: Vec<Arc<dyn ManifestOperation>>,
    stages: Vec<Stage>,
    manifest: Option<Arc<dyn ManifestController>>,
    labels: Option<Arc<dyn LabelMaker>>,
    owner_selector: Option<Arc<dyn OwnerSelector>>,
    prune: bool,
    preserve_namespace: bool,
    status: Option<Arc<dyn Status>>,
    sink: Option<Arc<dyn Sink>>,
    watch: Option<Arc<dyn DynamicWatch>>,
    problems: Vec<String>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self { Self::default() }

    /// The owner kind this reconciler manages. Exactly once.
    pub fn with_group_version_kind(mut self, gvk: GroupVersionKind) -> Self {
        match &self.gvk {
            Some(prev) => self.problems.push(format!("group version kind set twice ({} then {})", prev, gvk)),
            None => self.gvk = Some(gvk),
        }
        self
    }

    pub fn with_manifest_controller(mut self, c: impl ManifestController + 'static) -> Self {
        self.manifest = Some(Arc::new(c));
        self
    }

    /// Raw-text operation, run before parsing in registration order.
    pub fn with_raw_operation(mut self, op: impl ManifestOperation + 'static) -> Self {
        self.operations.push(Arc::new(op));
        self
    }

    /// Object transform, run after parsing in registration order.
    pub fn with_object_transform(mut self, t: impl ObjectTransform + 'static) -> Self {
        self.stages.push(Stage::Transform(Arc::new(t)));
        self
    }

    /// Label every object with the maker's labels; also scopes prune and
    /// dynamic watches.
    pub fn with_labels(mut self, maker: impl LabelMaker + 'static) -> Self {
        if self.labels.is_some() {
            self.problems.push("labels set twice".to_string());
            return self;
        }
        self.labels = Some(Arc::new(maker));
        self.stages.push(Stage::Labels);
        self
    }

    pub fn with_managed_application(mut self) -> Self {
        self.stages.push(Stage::Application);
        self
    }

    pub fn with_image_registry(self, registry: ImageRegistry) -> Self {
        self.with_object_transform(registry)
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Keep each object's own namespace instead of the owner's.
    pub fn with_preserve_namespace(mut self) -> Self {
        self.preserve_namespace = true;
        self
    }

    pub fn with_owner(mut self, selector: impl OwnerSelector + 'static) -> Self {
        self.owner_selector = Some(Arc::new(selector));
        self
    }

    pub fn with_status(mut self, status: impl Status + 'static) -> Self {
        self.status = Some(Arc::new(status));
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        if self.sink.is_some() || self.watch.is_some() {
            self.problems.push("sink set twice".to_string());
            return self;
        }
        self.sink = Some(sink);
        self
    }

    /// Use a [`WatchRegistry`] over `watch` as the sink; its filter selects
    /// on the label keys so one watch per kind serves every owner.
    pub fn with_dynamic_watch(mut self, watch: Arc<dyn DynamicWatch>) -> Self {
        if self.sink.is_some() || self.watch.is_some() {
            self.problems.push("sink set twice".to_string());
            return self;
        }
        self.watch = Some(watch);
        self
    }

    pub fn build(self, server: Arc<dyn ResourceServer>) -> Result<Reconciler, Error> {
        let mut problems = self.problems;
        if self.manifest.is_none() {
            problems.push("manifest controller is required".to_string());
        }
        if self.gvk.is_none() {
            problems.push("group version kind is required".to_string());
        }
        if self.prune && self.labels.is_none() {
            problems.push("prune requires labels".to_string());
        }
        let has_application = self.stages.iter().any(|s| matches!(s, Stage::Application));
        if has_application && self.labels.is_none() {
            problems.push("managed application requires labels".to_string());
        }
        let (Some(gvk), Some(manifest), true) = (self.gvk, self.manifest, problems.is_empty()) else {
            return Err(Error::Configuration(problems.join("; ")));
        };

        let mut pipeline = Pipeline::new();
        for op in self.operations {
            pipeline.push_operation(op);
        }
        if !self.preserve_namespace {
            pipeline.push_transform(Arc::new(PinNamespace));
        }
        for stage in self.stages {
            let t: Arc<dyn ObjectTransform> = match (stage, &self.labels) {
                (Stage::Transform(t), _) => t,
                (Stage::Labels, Some(maker)) => Arc::new(AddLabels::from_maker(maker.clone())),
                (Stage::Application, Some(maker)) => Arc::new(ManagedApplication::new(maker.clone())),
                (_, None) => continue,
            };
            pipeline.push_transform(t);
        }

        let sink = match (self.sink, self.watch) {
            (Some(sink), _) => Some(sink),
            (None, Some(watch)) => {
                let labels = self.labels.clone();
                let registry = WatchRegistry::new(watch).with_filter(move |owner| watch_filter(labels.as_deref(), owner));
                Some(Arc::new(registry) as Arc<dyn Sink>)
            }
            (None, None) => None,
        };

        let materializer = Materializer::new(server.clone())
            .with_owner_selector(self.owner_selector.unwrap_or_else(|| Arc::new(SourceAsOwner)))
            .with_preserve_namespace(self.preserve_namespace);

        let config = ReconcilerConfig {
            gvk,
            pipeline,
            manifest,
            labels: self.labels,
            prune: self.prune,
            preserve_namespace: self.preserve_namespace,
            status: self.status,
            sink,
        };
        Ok(Reconciler::new(Arc::new(config), materializer, server))
    }
}

/// Existence selector over the label keys, cluster wide.
pub(crate) fn watch_filter(labels: Option<&dyn LabelMaker>, owner: &DeclarativeObject) -> WatchFilter {
    let label_selector = labels
        .map(|m| m.labels(owner).into_keys().collect::<Vec<_>>().join(","))
        .unwrap_or_default();
    WatchFilter { label_selector, namespace: None }
}
