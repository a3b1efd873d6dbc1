//! Manifest items and chart rendering.
//!
//! A [`Resource`] is one rendered manifest document kept in raw tree form so
//! that diffing and rotation patching see exactly what the renderer emitted.
//! Typed views (StatefulSet, HPA) are parsed on demand from the same tree.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One manifest item: a Kubernetes object in raw tree form.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource(Value);

impl Resource {
    /// Wraps a decoded document. Fails when `kind` or `metadata.name` is
    /// absent — every applyable object carries both.
    pub fn from_value(value: Value) -> Result<Self> {
        let r = Resource(value);
        if r.kind().is_empty() {
            return Err(EngineError::Serialization(
                "manifest item without kind".to_string(),
            ));
        }
        if r.name().is_empty() {
            return Err(EngineError::Serialization(format!(
                "manifest item {} without metadata.name",
                r.kind()
            )));
        }
        Ok(r)
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.0
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Identity of a resource within one rollout.
    pub fn key(&self) -> String {
        format!("{}{}", self.kind(), self.name())
    }

    pub fn set_name(&mut self, name: &str) {
        self.ensure_object("/metadata")
            .insert("name".to_string(), Value::String(name.to_string()));
    }

    pub fn label(&self, key: &str) -> &str {
        self.0
            .pointer("/metadata/labels")
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn annotation(&self, key: &str) -> &str {
        self.0
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.ensure_object("/metadata/labels")
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Sets a label at an arbitrary pointer path, e.g. the pod template.
    pub fn set_label_at(&mut self, pointer: &str, key: &str, value: &str) {
        self.ensure_object(&format!("{}/labels", pointer))
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    /// Parses the raw tree into a typed `k8s-openapi` object.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    fn ensure_object(&mut self, pointer: &str) -> &mut serde_json::Map<String, Value> {
        let mut cur = &mut self.0;
        for seg in pointer.split('/').filter(|s| !s.is_empty()) {
            if !cur.is_object() {
                *cur = Value::Object(serde_json::Map::new());
            }
            let map = cur.as_object_mut().unwrap();
            cur = map
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
        cur.as_object_mut().unwrap()
    }
}

/// Decodes a multi-document YAML blob into manifest items.
///
/// Empty documents are skipped; any other undecodable document is an error.
pub fn decode_all(blob: &str) -> Result<Vec<Resource>> {
    use serde::Deserialize;

    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(blob) {
        let yaml = serde_yaml::Value::deserialize(document)?;
        let value = serde_json::to_value(yaml)?;
        if value.is_null() {
            continue;
        }
        out.push(Resource::from_value(value)?);
    }
    Ok(out)
}

/// Encodes manifest items back into a multi-document YAML blob.
pub fn encode_all(resources: &[Resource]) -> Result<String> {
    let mut out = String::new();
    for r in resources {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(r.value())?);
    }
    Ok(out)
}

/// Chart renderer capability.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Renders a chart with the given values tree into the parsed manifest
    /// list plus the verbatim serialized blob.
    async fn render(&self, chart: &Path, values: &Value) -> Result<(Vec<Resource>, String)>;
}

/// Renders charts by shelling out to `helm template`.
pub struct HelmRenderer {
    work_path: PathBuf,
}

impl HelmRenderer {
    pub fn new(work_path: impl Into<PathBuf>) -> Self {
        Self {
            work_path: work_path.into(),
        }
    }
}

#[async_trait]
impl Renderer for HelmRenderer {
    async fn render(&self, chart: &Path, values: &Value) -> Result<(Vec<Resource>, String)> {
        tokio::fs::create_dir_all(&self.work_path).await?;
        let values_file = self
            .work_path
            .join(format!("values-{:08x}.yaml", rand::random::<u32>()));
        tokio::fs::write(&values_file, serde_yaml::to_string(values)?).await?;

        debug!(chart = %chart.display(), values = %values_file.display(), "rendering chart");
        let output = tokio::process::Command::new("helm")
            .arg("template")
            .arg(chart)
            .arg("-f")
            .arg(&values_file)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&values_file).await;

        let output = output.map_err(|e| EngineError::Render(e.to_string()))?;
        if !output.status.success() {
            return Err(EngineError::Render(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let blob = String::from_utf8_lossy(&output.stdout).to_string();
        let resources =
            decode_all(&blob).map_err(|e| EngineError::Render(format!("bad manifest: {}", e)))?;
        Ok((resources, blob))
    }
}
