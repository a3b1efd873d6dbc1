//! Rollout and uninstall execution.
//!
//! A rollout renders the chart, diffs the result against the persisted
//! manifest, plans StatefulSet rotations, applies resources in declared
//! order (retargeting autoscalers at renamed workloads), removes what is
//! obsolete, and persists the new manifest. Uninstall walks the persisted
//! manifest in reverse: current generations and plain resources are removed
//! best-effort, the manifest ConfigMap itself fatally.

use crate::cluster::ClusterApi;
use crate::error::{EngineError, Result};
use crate::manifest::{decode_all, Renderer, Resource};
use crate::rotation::{self, Removal};
use crate::values;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const REMOVE_WAIT: Duration = Duration::from_secs(120);

/// Options shared by rollout and uninstall.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationOptions {
    /// How long to wait for workloads to settle. Only honored by a rollout
    /// when a rotation actually happened.
    pub wait: Option<Duration>,
}

impl OperationOptions {
    pub fn with_wait(wait: Duration) -> Self {
        Self { wait: Some(wait) }
    }
}

/// Reads the persisted manifest for a release. Absence and decode failures
/// both degrade to an empty list: a broken manifest never blocks a rollout.
async fn read_persisted_manifest(
    cluster: &dyn ClusterApi,
    name: &str,
    namespace: &str,
) -> Vec<Resource> {
    let cm_name = format!("{}-manifest", name);
    match cluster.get_configmap(&cm_name, namespace).await {
        Ok(Some(cm)) => {
            let blob = cm
                .data
                .as_ref()
                .and_then(|d| d.get("manifest"))
                .cloned()
                .unwrap_or_default();
            match decode_all(&blob) {
                Ok(list) => list,
                Err(e) => {
                    warn!(configmap = %cm_name, "persisted manifest undecodable: {}", e);
                    Vec::new()
                }
            }
        }
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(configmap = %cm_name, "persisted manifest unreadable: {}", e);
            Vec::new()
        }
    }
}

/// Strict variant for uninstall: the persisted manifest must exist and
/// decode, otherwise there is nothing trustworthy to remove.
async fn read_persisted_manifest_strict(
    cluster: &dyn ClusterApi,
    name: &str,
    namespace: &str,
) -> Result<Vec<Resource>> {
    let cm_name = format!("{}-manifest", name);
    let cm = cluster
        .get_configmap(&cm_name, namespace)
        .await?
        .ok_or_else(|| EngineError::Remove(format!("{}/{} not found", namespace, cm_name)))?;
    let blob = cm
        .data
        .as_ref()
        .and_then(|d| d.get("manifest"))
        .cloned()
        .unwrap_or_default();
    decode_all(&blob)
}

/// Applies a rolling update of the chart's resources.
pub async fn rollout(
    cluster: &dyn ClusterApi,
    renderer: &dyn Renderer,
    chart: &Path,
    values_tree: &Value,
    opts: OperationOptions,
) -> Result<()> {
    let (mut new_list, blob) = renderer.render(chart, values_tree).await?;
    if new_list.is_empty() {
        return Err(EngineError::EmptyManifest);
    }
    let name = values::chain_get_str(values_tree, &["global", "name"])?.to_string();
    let namespace = values::chain_get_str(values_tree, &["global", "namespace"])?.to_string();

    let old_list = read_persisted_manifest(cluster, &name, &namespace).await;
    let positions: HashMap<String, usize> = new_list
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key(), i))
        .collect();

    let mut to_removes: Vec<Removal> = Vec::new();
    let mut changed: HashMap<String, bool> = HashMap::new();
    let mut rotated = false;

    for old in &old_list {
        let key = old.key();
        let Some(&pos) = positions.get(&key) else {
            let ns = if old.namespace().is_empty() {
                namespace.clone()
            } else {
                old.namespace().to_string()
            };
            to_removes.push(Removal {
                name: old.name().to_string(),
                namespace: ns,
                kind: old.kind().to_string(),
            });
            continue;
        };
        let df = values::diff(old.value(), new_list[pos].value());
        changed.insert(key.clone(), !df.is_empty());
        debug!(key = %key, changed = !df.is_empty(), "classified resource");
        if old.kind() == "StatefulSet" {
            let current = rotation::current_rotation(cluster, old.name(), &namespace).await;
            let did_rotate = rotation::plan_rotation(
                old,
                &mut new_list[pos],
                current.as_ref(),
                &df,
                &namespace,
                &mut to_removes,
            )?;
            if did_rotate {
                rotated = true;
            }
        }
    }

    // The wait budget exists for generational rolls only.
    let wait = if rotated { opts.wait } else { None };
    apply(cluster, &mut new_list, &to_removes, wait, &mut changed).await?;

    write_manifest(cluster, &blob, new_list[0].name(), &namespace).await
}

/// The apply phase: first-time renames, autoscaler retargeting, ordered
/// applies with skip-unchanged, then the best-effort remove pass.
async fn apply(
    cluster: &dyn ClusterApi,
    new_list: &mut [Resource],
    to_removes: &[Removal],
    wait: Option<Duration>,
    changed: &mut HashMap<String, bool>,
) -> Result<()> {
    let mut sts_real_names: HashMap<String, String> = HashMap::new();
    rotation::rename_statefulsets(new_list, &mut sts_real_names);

    for r in new_list.iter_mut() {
        let key = r.key();
        if r.kind() == "HorizontalPodAutoscaler" {
            let target_kind = r
                .value()
                .pointer("/spec/scaleTargetRef/kind")
                .and_then(Value::as_str);
            if target_kind == Some("StatefulSet") {
                let target = r
                    .value()
                    .pointer("/spec/scaleTargetRef/name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if let Some(real_name) = sts_real_names.get(&target) {
                    if let Some(target_ref) = r
                        .value_mut()
                        .pointer_mut("/spec/scaleTargetRef")
                        .and_then(Value::as_object_mut)
                    {
                        target_ref
                            .insert("name".to_string(), Value::String(real_name.clone()));
                        changed.insert(key.clone(), true);
                    }
                }
            }
        }
        if let Some(false) = changed.get(&r.key()) {
            info!(key = %r.key(), "apply skipped for unchanged item");
            continue;
        }
        cluster.apply(r, wait).await?;
    }

    for removal in to_removes {
        if let Err(e) = cluster
            .remove(
                &removal.kind,
                &removal.name,
                &removal.namespace,
                Some(REMOVE_WAIT),
            )
            .await
        {
            warn!(
                kind = %removal.kind,
                namespace = %removal.namespace,
                name = %removal.name,
                "failed to remove: {}",
                e
            );
        }
    }
    Ok(())
}

/// Persists the rendered blob as the release's manifest ConfigMap, through
/// the same apply path as everything else.
async fn write_manifest(
    cluster: &dyn ClusterApi,
    blob: &str,
    name: &str,
    namespace: &str,
) -> Result<()> {
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "name".to_string(),
        Value::String(format!("{}-manifest", name)),
    );
    metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
    let mut data = serde_json::Map::new();
    data.insert("manifest".to_string(), Value::String(blob.to_string()));
    let mut root = serde_json::Map::new();
    root.insert("apiVersion".to_string(), Value::String("v1".to_string()));
    root.insert("kind".to_string(), Value::String("ConfigMap".to_string()));
    root.insert("metadata".to_string(), Value::Object(metadata));
    root.insert("data".to_string(), Value::Object(data));

    let cm = Resource::from_value(Value::Object(root))?;
    cluster.apply(&cm, None).await
}

/// Removes everything the persisted manifest says this release owns.
pub async fn uninstall(
    cluster: &dyn ClusterApi,
    name: &str,
    namespace: &str,
    opts: OperationOptions,
) -> Result<()> {
    let old_list = read_persisted_manifest_strict(cluster, name, namespace).await?;

    for r in &old_list {
        let ns = if r.namespace().is_empty() {
            namespace
        } else {
            r.namespace()
        };
        match r.kind() {
            "StatefulSet" => {
                match rotation::current_rotation(cluster, r.name(), namespace).await {
                    Some(current) => {
                        let physical = format!("{}---{}", r.name(), current.rotation);
                        if let Err(e) = cluster
                            .remove("StatefulSet", &physical, ns, opts.wait)
                            .await
                        {
                            warn!(
                                namespace = %ns,
                                name = %physical,
                                "failed to remove StatefulSet: {}",
                                e
                            );
                        }
                    }
                    None => {
                        warn!(
                            namespace = %namespace,
                            name = %r.name(),
                            "current rotation not found"
                        );
                    }
                }
            }
            kind => {
                if let Err(e) = cluster.remove(kind, r.name(), ns, opts.wait).await {
                    warn!(kind = %kind, namespace = %ns, name = %r.name(), "failed to remove: {}", e);
                }
            }
        }
    }

    cluster
        .remove(
            "ConfigMap",
            &format!("{}-manifest", name),
            namespace,
            opts.wait,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::MockClusterApi;
    use crate::manifest::encode_all;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockRenderer {
        resources: Vec<Resource>,
        blob: String,
    }

    impl MockRenderer {
        fn from_yaml(blob: &str) -> Self {
            Self {
                resources: decode_all(blob).unwrap(),
                blob: blob.to_string(),
            }
        }
    }

    #[async_trait]
    impl Renderer for MockRenderer {
        async fn render(
            &self,
            _chart: &Path,
            _values: &Value,
        ) -> Result<(Vec<Resource>, String)> {
            Ok((self.resources.clone(), self.blob.clone()))
        }
    }

    fn values_tree() -> Value {
        json!({
            "app": {},
            "global": {"name": "app1", "namespace": "ns1"}
        })
    }

    const FRESH_MANIFEST: &str = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
---
kind: StatefulSet
apiVersion: apps/v1
metadata:
  name: sts1
  namespace: ns1
  labels:
    app.kubernetes.io/name: sts1
spec:
  replicas: 2
  template:
    spec:
      containers:
      - image: 'haha:1'
---
kind: HorizontalPodAutoscaler
apiVersion: autoscaling/v2
metadata:
  name: sts1-hpa
  namespace: ns1
spec:
  scaleTargetRef:
    kind: StatefulSet
    name: sts1
  maxReplicas: 5
"#;

    #[tokio::test]
    async fn test_rollout_first_install() {
        let mock = MockClusterApi::default();
        let renderer = MockRenderer::from_yaml(FRESH_MANIFEST);
        rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &values_tree(),
            OperationOptions::default(),
        )
        .await
        .unwrap();

        let applied = mock.applied.lock().unwrap().clone();
        // Declared order: Service, renamed StatefulSet, HPA, then the
        // persisted manifest last.
        assert_eq!(applied.len(), 4);
        assert_eq!(applied[0].key(), "Serviceapp1");
        assert_eq!(applied[1].name(), "sts1---0");
        assert_eq!(applied[2].kind(), "HorizontalPodAutoscaler");
        assert_eq!(
            applied[2]
                .value()
                .pointer("/spec/scaleTargetRef/name")
                .and_then(Value::as_str),
            Some("sts1---0")
        );
        assert_eq!(applied[3].name(), "app1-manifest");
        assert!(mock.removed.lock().unwrap().is_empty());

        // The persisted blob decodes back to the rendered manifest.
        let cm = mock
            .get_configmap("app1-manifest", "ns1")
            .await
            .unwrap()
            .unwrap();
        let persisted = decode_all(&cm.data.unwrap()["manifest"]).unwrap();
        assert_eq!(persisted, renderer.resources);
    }

    #[tokio::test]
    async fn test_rollout_skips_unchanged_items() {
        let mock = MockClusterApi::default();
        let old_blob = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
---
kind: Deployment
apiVersion: apps/v1
metadata:
  name: app1-worker
  namespace: ns1
spec:
  replicas: 1
"#;
        let new_blob = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
---
kind: Deployment
apiVersion: apps/v1
metadata:
  name: app1-worker
  namespace: ns1
spec:
  replicas: 3
"#;
        mock.insert_configmap("ns1", "app1-manifest", "manifest", old_blob);
        let renderer = MockRenderer::from_yaml(new_blob);
        rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &values_tree(),
            OperationOptions::default(),
        )
        .await
        .unwrap();

        let keys = mock.applied_keys();
        assert!(!keys.contains(&"Serviceapp1".to_string()));
        assert!(keys.contains(&"Deploymentapp1-worker".to_string()));
        assert!(keys.contains(&"ConfigMapapp1-manifest".to_string()));
    }

    #[tokio::test]
    async fn test_rollout_rotation_bump_retargets_and_removes() {
        let old_blob = r#"---
kind: StatefulSet
apiVersion: apps/v1
metadata:
  name: sts1
  namespace: ns1
  labels:
    app.kubernetes.io/name: sts1
spec:
  replicas: 2
  template:
    spec:
      containers:
      - image: 'haha:1'
---
kind: HorizontalPodAutoscaler
apiVersion: autoscaling/v2
metadata:
  name: sts1-hpa
  namespace: ns1
spec:
  scaleTargetRef:
    kind: StatefulSet
    name: sts1
  maxReplicas: 5
"#;
        let new_blob = r#"---
kind: StatefulSet
apiVersion: apps/v1
metadata:
  name: sts1
  namespace: ns1
  labels:
    app.kubernetes.io/name: sts1
spec:
  replicas: 2
  serviceName: whocares
  template:
    spec:
      containers:
      - image: 'haha:1'
---
kind: HorizontalPodAutoscaler
apiVersion: autoscaling/v2
metadata:
  name: sts1-hpa
  namespace: ns1
spec:
  scaleTargetRef:
    kind: StatefulSet
    name: sts1
  maxReplicas: 5
"#;
        let mock = MockClusterApi::with_statefulsets(&[("ns1", "sts1---1")]);
        mock.insert_configmap("ns1", "app1-manifest", "manifest", old_blob);
        let renderer = MockRenderer::from_yaml(new_blob);
        rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &values_tree(),
            OperationOptions::with_wait(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let applied = mock.applied.lock().unwrap().clone();
        let sts = applied.iter().find(|r| r.kind() == "StatefulSet").unwrap();
        assert_eq!(sts.name(), "sts1---2");
        assert_eq!(sts.label(rotation::REALNAME_LABEL), "sts1---2");
        let hpa = applied
            .iter()
            .find(|r| r.kind() == "HorizontalPodAutoscaler")
            .unwrap();
        assert_eq!(
            hpa.value()
                .pointer("/spec/scaleTargetRef/name")
                .and_then(Value::as_str),
            Some("sts1---2")
        );
        assert_eq!(mock.removed_names(), vec!["sts1---1".to_string()]);
    }

    #[tokio::test]
    async fn test_rollout_empty_manifest() {
        let mock = MockClusterApi::default();
        let renderer = MockRenderer {
            resources: vec![],
            blob: String::new(),
        };
        let err = rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &values_tree(),
            OperationOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::EmptyManifest));
    }

    #[tokio::test]
    async fn test_rollout_missing_global() {
        let mock = MockClusterApi::default();
        let renderer = MockRenderer::from_yaml(FRESH_MANIFEST);
        let err = rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &json!({"app": {}}),
            OperationOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::MissingGlobal(_)));
    }

    #[tokio::test]
    async fn test_rollout_remove_failures_are_warnings() {
        let old_blob = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
---
kind: Service
apiVersion: v1
metadata:
  name: obsolete
  namespace: ns1
spec:
  ports:
  - port: 81
"#;
        let new_blob = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
"#;
        let mock = MockClusterApi::default();
        mock.insert_configmap("ns1", "app1-manifest", "manifest", old_blob);
        mock.fail_remove
            .lock()
            .unwrap()
            .push("obsolete".to_string());
        let renderer = MockRenderer::from_yaml(new_blob);
        rollout(
            &mock,
            &renderer,
            Path::new("/dev/null"),
            &values_tree(),
            OperationOptions::default(),
        )
        .await
        .unwrap();
        // The failed removal did not fail the rollout, and the manifest was
        // still persisted.
        assert!(mock
            .applied_keys()
            .contains(&"ConfigMapapp1-manifest".to_string()));
    }

    #[tokio::test]
    async fn test_uninstall_removes_current_generation_only() {
        let manifest = r#"---
kind: StatefulSet
apiVersion: apps/v1
metadata:
  name: sts1
  namespace: ns1
spec:
  replicas: 2
  template:
    spec:
      containers:
      - image: whocares
"#;
        let mock = MockClusterApi::with_statefulsets(&[("ns1", "sts1---0")]);
        mock.insert_configmap("ns1", "sts1-manifest", "manifest", manifest);
        uninstall(&mock, "sts1", "ns1", OperationOptions::default())
            .await
            .unwrap();
        let removed = mock.removed_names();
        assert!(removed.contains(&"sts1---0".to_string()));
        assert!(removed.contains(&"sts1-manifest".to_string()));
        assert!(!removed.contains(&"sts1".to_string()));
    }

    #[tokio::test]
    async fn test_uninstall_warns_on_member_failure_but_removes_manifest() {
        let manifest = r#"---
kind: Service
apiVersion: v1
metadata:
  name: app1
  namespace: ns1
spec:
  ports:
  - port: 80
"#;
        let mock = MockClusterApi::default();
        mock.insert_configmap("ns1", "app1-manifest", "manifest", manifest);
        mock.fail_remove.lock().unwrap().push("app1".to_string());
        uninstall(&mock, "app1", "ns1", OperationOptions::default())
            .await
            .unwrap();
        assert_eq!(mock.removed_names(), vec!["app1-manifest".to_string()]);
    }

    #[tokio::test]
    async fn test_uninstall_requires_persisted_manifest() {
        let mock = MockClusterApi::default();
        let err = uninstall(&mock, "ghost", "ns1", OperationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Remove(_)));
    }

    #[test]
    fn test_encode_decode_round_trip_preserves_order() {
        let resources = decode_all(FRESH_MANIFEST).unwrap();
        let blob = encode_all(&resources).unwrap();
        assert_eq!(decode_all(&blob).unwrap(), resources);
    }
}
