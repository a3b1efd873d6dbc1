//! Foreman engine CLI
//!
//! Thin command-line front for the engine: `rollout` advances a release to
//! the current chart + values, `uninstall` removes everything a release's
//! persisted manifest owns.
//!
//! ```bash
//! foreman-engine rollout --name app1 --namespace ns1 --spec spec.yaml
//! RUST_LOG=debug foreman-engine uninstall --name app1 --namespace ns1
//! ```

use clap::{Parser, Subcommand};
use foreman_engine::config::{ClusterOptions, Plugin, RemoteValuesCache};
use foreman_engine::manifest::HelmRenderer;
use foreman_engine::storage::{ObjectStoreStorage, RemoteStorage};
use foreman_engine::{
    KubeClusterApi, Release, ReleaseOptions, ReleaseSpec, ResourceContext,
};
use kube::Client;
use object_store::gcp::GoogleCloudStorageBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Foreman application-lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "foreman-engine")]
#[command(version, about = "Chart rollouts with stateful-set rotation")]
struct Args {
    /// Name of the cluster options ConfigMap
    #[arg(long, default_value = "foreman-options")]
    config_name: String,

    /// Namespace of the cluster options ConfigMap
    #[arg(long, default_value = "foreman")]
    config_namespace: String,

    /// Optional YAML file with global-spec plugins
    #[arg(long)]
    plugins: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Roll a release out to the cluster
    Rollout {
        /// Release name
        #[arg(long)]
        name: String,

        /// Target namespace
        #[arg(long)]
        namespace: String,

        /// Release spec file (asset + app values)
        #[arg(long)]
        spec: PathBuf,

        /// Optional override values file
        #[arg(long)]
        values: Option<PathBuf>,

        /// Seconds to wait for rotated workloads to settle
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Remove a release and its persisted manifest
    Uninstall {
        /// Release name
        #[arg(long)]
        name: String,

        /// Target namespace
        #[arg(long)]
        namespace: String,

        /// Seconds to wait for removals
        #[arg(long)]
        wait: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");
    let cluster_api = Arc::new(KubeClusterApi::new(client));

    let (cluster, basepath) = ClusterOptions::read_identity(
        cluster_api.as_ref(),
        &args.config_name,
        &args.config_namespace,
    )
    .await?;
    info!(cluster = %cluster, basepath = %basepath, "Resolved cluster identity");

    let bucket = basepath
        .strip_prefix("gs://")
        .unwrap_or(&basepath)
        .to_string();
    let gcs = GoogleCloudStorageBuilder::from_env()
        .with_bucket_name(&bucket)
        .build()?;
    let storage: Arc<dyn RemoteStorage> =
        Arc::new(ObjectStoreStorage::new(Arc::new(gcs), "gs", &bucket));

    let cache = RemoteValuesCache::new();
    let options = ClusterOptions::load(
        cluster_api.as_ref(),
        &storage,
        &cache,
        &args.config_name,
        &args.config_namespace,
    )
    .await?;

    let plugins: Vec<Plugin> = match &args.plugins {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    match args.command {
        Command::Rollout {
            name,
            namespace,
            spec,
            values,
            wait,
        } => {
            let ctx = ResourceContext::new(
                cluster_api,
                storage,
                Arc::new(HelmRenderer::new("/tmp/.foreman/render")),
                options,
                &namespace,
            )
            .with_plugins(plugins);

            let spec: ReleaseSpec = serde_yaml::from_str(&std::fs::read_to_string(spec)?)?;
            let overrides = match values {
                Some(path) => Some(serde_yaml::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };

            let release = Release::new(&ctx, &name, spec).await?;
            release
                .rollout(
                    &ctx,
                    ReleaseOptions {
                        values: overrides,
                        wait: wait.map(Duration::from_secs),
                    },
                )
                .await?;
            info!(release = %name, namespace = %namespace, "Rollout complete");
        }
        Command::Uninstall {
            name,
            namespace,
            wait,
        } => {
            let ctx = ResourceContext::new(
                cluster_api,
                storage,
                Arc::new(HelmRenderer::new("/tmp/.foreman/render")),
                options,
                &namespace,
            )
            .with_plugins(plugins);

            foreman_engine::release::uninstall(
                &ctx,
                &name,
                ReleaseOptions {
                    values: None,
                    wait: wait.map(Duration::from_secs),
                },
            )
            .await?;
            info!(release = %name, namespace = %namespace, "Uninstall complete");
        }
    }

    Ok(())
}
