//! Chart assets.
//!
//! An asset is one `<type>/<release>` chart directory fetched from object
//! storage into a local cache, plus its compiled Draft-4 values schema. The
//! loader guarantees at most one concurrent fetch+compile per asset id and
//! hands out the cached result afterwards.

use crate::error::{EngineError, Result};
use crate::storage::RemoteStorage;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

const DEFAULT_WORK_PATH: &str = "/tmp/.foreman/cache/assets";

/// A fetched chart asset with its compiled values schema.
#[derive(Debug)]
pub struct Asset {
    id: String,
    local_path: PathBuf,
    url: String,
    schema: JSONSchema,
}

impl Asset {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path to the chart archive inside the local cache directory.
    pub fn chart_path(&self) -> PathBuf {
        self.local_path.join("chart.tgz")
    }

    /// Validates app values against the asset's schema.
    pub fn validate(&self, values: &Value) -> Result<()> {
        if let Err(errors) = self.schema.validate(values) {
            let detail = errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::SchemaInvalid(detail));
        }
        Ok(())
    }
}

/// Draft-4 rejects `required: []`, so strip every empty one before compiling.
fn remove_empty_required(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let remove = matches!(
                map.get("required"),
                Some(Value::Array(arr)) if arr.is_empty()
            );
            if remove {
                map.remove("required");
            }
            for v in map.values_mut() {
                remove_empty_required(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                remove_empty_required(item);
            }
        }
        _ => {}
    }
}

/// Fetches and caches assets, at most one in-flight initialization per id.
pub struct AssetLoader {
    storage: Arc<dyn RemoteStorage>,
    basepath: String,
    work_path: PathBuf,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<Asset>>>>>,
}

impl AssetLoader {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        basepath: &str,
        work_path: Option<PathBuf>,
    ) -> Self {
        Self {
            storage,
            basepath: basepath.to_string(),
            work_path: work_path.unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_PATH)),
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Loads (fetching and compiling on first use) the asset for
    /// `<typ>-<release>`.
    pub async fn load(&self, typ: &str, release: &str) -> Result<Arc<Asset>> {
        if typ.is_empty() || release.is_empty() {
            return Err(EngineError::InvalidName(format!(
                "asset type/release: {:?}/{:?}",
                typ, release
            )));
        }
        let id = format!("{}-{}", typ, release);
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            Arc::clone(cells.entry(id.clone()).or_default())
        };
        cell.get_or_try_init(|| async { self.fetch(typ, release, &id).await.map(Arc::new) })
            .await
            .cloned()
    }

    async fn fetch(&self, typ: &str, release: &str, id: &str) -> Result<Asset> {
        let local_path = self.work_path.join(typ).join(release);
        let url = format!("{}/assets/{}/releases/{}", self.basepath, typ, release);
        info!(asset = %id, url = %url, "fetching asset");

        tokio::fs::create_dir_all(&local_path)
            .await
            .map_err(|e| EngineError::AssetFetch(e.to_string()))?;
        let entries = self
            .storage
            .list(&url, false)
            .await
            .map_err(|e| EngineError::AssetFetch(format!("{}: {}", url, e)))?;
        if entries.is_empty() {
            return Err(EngineError::AssetFetch(format!("no objects under {}", url)));
        }
        for entry in &entries {
            let file_name = entry
                .strip_prefix(&url)
                .unwrap_or(entry)
                .trim_start_matches('/');
            let data = self
                .storage
                .read(entry)
                .await
                .map_err(|e| EngineError::AssetFetch(format!("{}: {}", entry, e)))?;
            tokio::fs::write(local_path.join(file_name), data)
                .await
                .map_err(|e| EngineError::AssetFetch(e.to_string()))?;
        }

        let schema = compile_schema(&local_path).await?;
        Ok(Asset {
            id: id.to_string(),
            local_path,
            url,
            schema,
        })
    }
}

async fn compile_schema(local_path: &Path) -> Result<JSONSchema> {
    let schema_path = local_path.join("schema.json");
    let data = tokio::fs::read(&schema_path)
        .await
        .map_err(|e| EngineError::AssetFetch(format!("schema.json: {}", e)))?;
    let mut schema_value: Value =
        serde_json::from_slice(&data).map_err(|e| EngineError::SchemaCompile(e.to_string()))?;
    remove_empty_required(&mut schema_value);
    tokio::fs::write(
        &schema_path,
        serde_json::to_vec(&schema_value).map_err(|e| EngineError::SchemaCompile(e.to_string()))?,
    )
    .await
    .map_err(|e| EngineError::SchemaCompile(e.to_string()))?;

    JSONSchema::options()
        .with_draft(Draft::Draft4)
        .compile(&schema_value)
        .map_err(|e| EngineError::SchemaCompile(e.to_string()))
}
