use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use declarative_core::{DeclarativeObject, GroupVersionKind, OwnerKey};
use declarative_kubehub::{DynamicWatch, KubeDynamicWatch, KubeServer, MemoryServer, WatchFilter};
use declarative_reconciler::{BasicStatus, EngineConfig, FileResolver, ReconcilerBuilder, Runner, SourceLabels};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "declctl", version, about = "Declarative reconciliation engine")]
struct Cli {
    /// Manifest file, or a directory of `<version>/manifest.yaml`
    #[arg(long = "manifest", global = true, env = "DECL_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Delete labelled objects that left the manifest
    #[arg(long = "prune", global = true, action = ArgAction::SetTrue)]
    prune: bool,

    /// Keep each object's own namespace
    #[arg(long = "preserve-namespace", global = true, action = ArgAction::SetTrue)]
    preserve_namespace: bool,

    /// Keep a single app.k8s.io Application in sync with the owner
    #[arg(long = "managed-application", global = true, action = ArgAction::SetTrue)]
    managed_application: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline for an owner file offline and print the objects
    Render {
        /// Owner object (YAML or JSON)
        owner: PathBuf,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
    /// Reconcile every owner of a kind against the current cluster
    Run {
        /// Owner kind, e.g. "addons.example.org/v1alpha1/Dashboard"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("DECL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(cfg: &EngineConfig) {
    let Some(addr) = cfg.metrics_addr.as_deref() else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => tracing::warn!(addr = %addr, "invalid DECL_METRICS_ADDR; expected host:port"),
    }
}

fn read_owner(path: &Path) -> Result<DeclarativeObject> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading owner {}", path.display()))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&text).context("parsing owner YAML")?;
    let json = serde_json::to_value(yaml).context("converting owner YAML to JSON")?;
    Ok(DeclarativeObject::from_json(json)?)
}

fn builder(cli: &Cli, cfg: &EngineConfig, gvk: GroupVersionKind) -> Result<ReconcilerBuilder> {
    let manifest = cli.manifest.clone().ok_or_else(|| anyhow!("--manifest (or DECL_MANIFEST) is required"))?;
    let mut b = ReconcilerBuilder::new()
        .with_group_version_kind(gvk)
        .with_manifest_controller(FileResolver::new(manifest))
        .with_labels(SourceLabels)
        .with_prune(cli.prune);
    if cli.preserve_namespace {
        b = b.with_preserve_namespace();
    }
    if let Some(registry) = cfg.image_registry() {
        b = b.with_image_registry(registry);
    }
    if cli.managed_application {
        b = b.with_managed_application();
    }
    Ok(b)
}

async fn render(cli: &Cli, cfg: &EngineConfig, owner_path: &Path, output: Output) -> Result<()> {
    let owner = read_owner(owner_path)?;
    let reconciler = builder(cli, cfg, owner.gvk().clone())?.build(Arc::new(MemoryServer::new()))?;
    let objects = reconciler.render(&owner).await?;
    match output {
        Output::Yaml => print!("{}", objects.to_yaml()?),
        Output::Json => {
            let items: Vec<_> = objects.iter().map(|o| o.to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

async fn run(cli: &Cli, cfg: &EngineConfig, key: &str) -> Result<()> {
    let gvk = GroupVersionKind::parse_key(key).ok_or_else(|| anyhow!("invalid gvk key {:?}", key))?;
    let server = KubeServer::try_default().await?.with_field_manager(cfg.field_manager.clone());
    let (watch, events) = KubeDynamicWatch::new(server.client(), cfg.queue_cap);
    let watch = Arc::new(watch);
    // owners themselves arrive on the same event channel
    watch
        .add(&gvk, &WatchFilter::default(), &OwnerKey::new(None, ""))
        .await
        .with_context(|| format!("watching {}", gvk))?;

    let reconciler = builder(cli, cfg, gvk.clone())?
        .with_status(BasicStatus)
        .with_dynamic_watch(watch.clone())
        .build(Arc::new(server))?;
    info!(gvk = %gvk, prune = cli.prune, "controller starting");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "listening for ctrl-c failed");
        }
    };
    Runner::new(Arc::new(reconciler), cfg).run(events, shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = EngineConfig::from_env();
    init_metrics(&cfg);
    let cli = Cli::parse();

    match &cli.command {
        Commands::Render { owner, output } => render(&cli, &cfg, owner, *output).await,
        Commands::Run { gvk } => run(&cli, &cfg, gvk).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn render_flags_parse() {
        let cli = Cli::try_parse_from(["declctl", "render", "owner.yaml", "--manifest", "m.yaml", "--prune", "-o", "json"]).unwrap();
        assert!(cli.prune);
        assert_eq!(cli.manifest.as_deref(), Some(Path::new("m.yaml")));
        assert!(matches!(cli.command, Commands::Render { output: Output::Json, .. }));
    }

    #[tokio::test]
    async fn render_runs_the_pipeline_offline() {
        let dir = std::env::temp_dir().join(format!("declctl-render-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = dir.join("manifest.yaml");
        let owner = dir.join("owner.yaml");
        std::fs::write(&manifest, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n").unwrap();
        std::fs::write(
            &owner,
            "apiVersion: addons.example.org/v1alpha1\nkind: Dashboard\nmetadata:\n  name: d\n  namespace: team\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from(["declctl", "render", owner.to_str().unwrap(), "--manifest", manifest.to_str().unwrap()]).unwrap();
        let o = read_owner(&owner).unwrap();
        let r = builder(&cli, &EngineConfig::default(), o.gvk().clone()).unwrap().build(Arc::new(MemoryServer::new())).unwrap();
        let objects = r.render(&o).await.unwrap();
        assert_eq!(objects.items[0].namespace(), Some("team"));
        assert_eq!(objects.items[0].labels().get("addons.example.org/dashboard").map(String::as_str), Some("d"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
