//! Cluster-level configuration.
//!
//! The engine bootstraps from a cluster ConfigMap (`CLUSTER`, optional
//! `OP_BASEPATH`), pulls cluster-wide default values from object storage,
//! and augments the global spec with per-plugin remote fragments. Remote
//! YAML reads go through a refresh/TTL cache that serves stale values while
//! a refresh is failing.

use crate::cluster::ClusterApi;
use crate::error::{EngineError, Result};
use crate::storage::{normalize_url, RemoteStorage};
use crate::values::yaml_to_value;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const CACHE_REFRESH: Duration = Duration::from_secs(30 * 60);
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// A remote values fragment installed into the global spec under its name.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Plugin {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Options read once from the cluster ConfigMap.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub cluster: String,
    pub basepath: String,
    /// Cluster-wide default values (`global` key of the cluster file).
    pub values: Value,
}

impl ClusterOptions {
    /// Reads `CLUSTER` and `OP_BASEPATH` from the named ConfigMap and
    /// derives the basepath (`gs://fm-op-<cluster>` unless overridden).
    pub async fn read_identity(
        cluster_api: &dyn ClusterApi,
        name: &str,
        namespace: &str,
    ) -> Result<(String, String)> {
        let cm = cluster_api
            .get_configmap(name, namespace)
            .await?
            .ok_or_else(|| {
                EngineError::ConfigMissing(format!("configmap {}/{}", namespace, name))
            })?;
        let data = cm.data.unwrap_or_default();
        let cluster = data
            .get("CLUSTER")
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| EngineError::ConfigMissing("CLUSTER".to_string()))?;
        let basepath = match data.get("OP_BASEPATH").filter(|b| !b.is_empty()) {
            Some(bp) => format!("gs://fm-op-{}", bp),
            None => format!("gs://fm-op-{}", cluster),
        };
        Ok((cluster, basepath))
    }

    /// Reads the cluster identity and loads the cluster-wide defaults from
    /// storage.
    pub async fn load(
        cluster_api: &dyn ClusterApi,
        storage: &Arc<dyn RemoteStorage>,
        cache: &RemoteValuesCache,
        name: &str,
        namespace: &str,
    ) -> Result<Self> {
        let (cluster, basepath) = Self::read_identity(cluster_api, name, namespace).await?;

        let defaults_url = normalize_url(&format!("{}/../clusters/{}.yaml", basepath, cluster));
        let defaults = cache.get(storage, &defaults_url).await?;
        let values = defaults
            .get("global")
            .cloned()
            .ok_or_else(|| EngineError::ConfigMissing(format!("global in {}", defaults_url)))?;

        Ok(Self {
            cluster,
            basepath,
            values,
        })
    }
}

/// Cache for remote YAML documents: refreshed every 30 minutes, entries stay
/// usable for an hour when the refresh keeps failing.
#[derive(Default)]
pub struct RemoteValuesCache {
    entries: tokio::sync::Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    fetched_at: Instant,
    value: Value,
}

impl RemoteValuesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, storage: &Arc<dyn RemoteStorage>, url: &str) -> Result<Value> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(url) {
            if entry.fetched_at.elapsed() < CACHE_REFRESH {
                return Ok(entry.value.clone());
            }
        }
        match Self::fetch(storage, url).await {
            Ok(value) => {
                entries.insert(
                    url.to_string(),
                    CacheEntry {
                        fetched_at: Instant::now(),
                        value: value.clone(),
                    },
                );
                Ok(value)
            }
            Err(e) => match entries.get(url) {
                Some(entry) if entry.fetched_at.elapsed() < CACHE_TTL => {
                    warn!(url = %url, "refresh failed, serving stale value: {}", e);
                    Ok(entry.value.clone())
                }
                _ => Err(e),
            },
        }
    }

    async fn fetch(storage: &Arc<dyn RemoteStorage>, url: &str) -> Result<Value> {
        let bytes = storage.read(url).await?;
        let text = String::from_utf8_lossy(&bytes);
        yaml_to_value(&text)
    }
}

/// Assembles the global spec: cluster-wide defaults plus one projected
/// fragment per configured plugin.
pub async fn global_spec(
    options: &ClusterOptions,
    cache: &RemoteValuesCache,
    storage: &Arc<dyn RemoteStorage>,
    plugins: &[Plugin],
    name: &str,
    namespace: &str,
    app: &Value,
) -> Result<Value> {
    let mut spec = options.values.as_object().cloned().unwrap_or_default();

    for plugin in plugins {
        if plugin.name.is_empty() || plugin.url.is_empty() || plugin.keys.is_empty() {
            warn!(
                plugin = %plugin.name,
                "plugin not loaded because its name/url/keys are empty"
            );
            continue;
        }
        let mut url = plugin
            .url
            .replace("{cluster}", &options.cluster)
            .replace("{namespace}", namespace)
            .replace("{name}", name);
        for item in ["area", "mode", "context"] {
            let placeholder = format!("{{{}}}", item);
            if !url.contains(&placeholder) {
                continue;
            }
            let value = app
                .get(item)
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::PluginMissingValue(item.to_string()))?;
            url = url.replace(&placeholder, value);
        }

        let values = cache.get(storage, &url).await?;
        let mut projected = Map::new();
        for key in &plugin.keys {
            projected.insert(
                key.clone(),
                values.get(key).cloned().unwrap_or(Value::Null),
            );
        }
        spec.insert(plugin.name.clone(), Value::Object(projected));
    }

    Ok(Value::Object(spec))
}
