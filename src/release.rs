//! The release façade.
//!
//! A [`Release`] ties a name to an asset and its values spec. Rollout and
//! uninstall both run under the release's distributed lock so that only one
//! mutation per `(cluster, namespace, name)` is in flight at a time.

use crate::context::ResourceContext;
use crate::error::{EngineError, Result};
use crate::lock::DistributedLock;
use crate::rollout::{self, OperationOptions};
use crate::values::merge;
use crate::{asset::Asset, config};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const LOCK_WAIT: Duration = Duration::from_secs(30 * 60);

/// Which chart asset a release deploys.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AssetRef {
    #[serde(rename = "type")]
    pub typ: String,
    pub release: String,
}

/// The declared spec of a release: its asset plus the raw app values.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReleaseSpec {
    pub asset: AssetRef,
    #[serde(default)]
    pub app: Value,
}

/// Per-invocation options for rollout and uninstall.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    /// Override values deep-merged over the spec's app values.
    pub values: Option<Value>,
    /// Wait budget handed to the executor.
    pub wait: Option<Duration>,
}

/// A named, asset-backed deployable unit.
#[derive(Debug)]
pub struct Release {
    name: String,
    spec: ReleaseSpec,
    asset: Arc<Asset>,
    url: String,
}

impl Release {
    /// Validates inputs and resolves the asset (fetching it on first use).
    pub async fn new(ctx: &ResourceContext, name: &str, spec: ReleaseSpec) -> Result<Self> {
        if name.is_empty() {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        if spec.asset.typ.is_empty() || spec.asset.release.is_empty() {
            return Err(EngineError::EmptySpec(format!(
                "asset reference for {}",
                name
            )));
        }
        let asset = ctx.assets().load(&spec.asset.typ, &spec.asset.release).await?;
        let url = resource_url(ctx, name);
        Ok(Self {
            name: name.to_string(),
            spec,
            asset,
            url,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_url(&self) -> String {
        format!("{}.lock", self.url)
    }

    /// Advances the release to the current chart + values under its lock.
    pub async fn rollout(&self, ctx: &ResourceContext, opts: ReleaseOptions) -> Result<()> {
        let lock = DistributedLock::with_url(Arc::clone(ctx.storage()), &self.lock_url());
        lock.lock(LOCK_WAIT).await?;
        let result = self.rollout_locked(ctx, &opts).await;
        let _ = lock.unlock().await;
        result
    }

    async fn rollout_locked(&self, ctx: &ResourceContext, opts: &ReleaseOptions) -> Result<()> {
        let global = config::global_spec(
            ctx.options(),
            ctx.values_cache(),
            ctx.storage(),
            ctx.plugins(),
            &self.name,
            ctx.namespace(),
            &self.spec.app,
        )
        .await?;
        let ts = Utc::now().timestamp();
        let global = merge(
            &global,
            &json!({
                "name": self.name,
                "namespace": ctx.namespace(),
                "cluster": ctx.cluster(),
                "ts": ts,
                "deployTime": ts.to_string(),
            }),
        );
        let app = match &opts.values {
            Some(overrides) => merge(&self.spec.app, overrides),
            None => self.spec.app.clone(),
        };
        // Nothing touches the cluster before the app values validate.
        self.asset.validate(&app)?;

        let values = json!({"app": app, "global": global});
        rollout::rollout(
            ctx.cluster_api(),
            ctx.renderer(),
            &self.asset.chart_path(),
            &values,
            OperationOptions { wait: opts.wait },
        )
        .await
    }
}

/// Removes a release's resources and persisted manifest under its lock.
pub async fn uninstall(ctx: &ResourceContext, name: &str, opts: ReleaseOptions) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    let lock_url = format!("{}.lock", resource_url(ctx, name));
    let lock = DistributedLock::with_url(Arc::clone(ctx.storage()), &lock_url);
    lock.lock(LOCK_WAIT).await?;
    let result = rollout::uninstall(
        ctx.cluster_api(),
        name,
        ctx.namespace(),
        OperationOptions { wait: opts.wait },
    )
    .await;
    let _ = lock.unlock().await;
    result
}

fn resource_url(ctx: &ResourceContext, name: &str) -> String {
    format!(
        "{}/resources/{}/{}/{}.yaml",
        ctx.basepath(),
        ctx.cluster(),
        ctx.namespace(),
        name
    )
}
