//! Kubernetes cluster access.
//!
//! The engine talks to the cluster through the [`ClusterApi`] capability:
//! apply (create-or-update), remove, ConfigMap reads, StatefulSet listings,
//! and pod watches. [`KubeClusterApi`] is the production implementation on
//! top of the `kube` client; tests swap in a recording mock.

use crate::error::{EngineError, Result};
use crate::manifest::Resource;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback invoked with a pod that became available or unavailable.
pub type PodHandler = Arc<dyn Fn(Pod) + Send + Sync>;

const FIELD_MANAGER: &str = "foreman-engine";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Typed cluster operations the engine depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetches a ConfigMap, returning `None` when it does not exist.
    async fn get_configmap(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>>;

    /// Lists StatefulSet names in a namespace whose name matches `pattern`.
    async fn list_statefulset_names(&self, namespace: &str, pattern: &Regex)
        -> Result<Vec<String>>;

    /// Creates or updates a resource. When `wait` is set, blocks until the
    /// workload reports ready or the wait elapses.
    async fn apply(&self, resource: &Resource, wait: Option<Duration>) -> Result<()>;

    /// Deletes a resource by kind and name. When `wait` is set, blocks
    /// until the object is gone or the wait elapses.
    async fn remove(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        wait: Option<Duration>,
    ) -> Result<()>;

    /// Watches pods in a namespace, invoking the handlers as matching pods
    /// become ready or go away. Runs until the watch stream ends.
    async fn watch_pods(
        &self,
        namespace: &str,
        pattern: &Regex,
        on_available: PodHandler,
        on_unavailable: PodHandler,
    ) -> Result<()>;
}

/// Production [`ClusterApi`] backed by the kube client.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let ar = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    async fn wait_until_ready(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        wait: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let ready = match kind {
                "StatefulSet" => {
                    let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                    api.get_opt(name)
                        .await?
                        .map(|s| statefulset_ready(&s))
                        .unwrap_or(false)
                }
                "Deployment" => {
                    let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                    api.get_opt(name)
                        .await?
                        .map(|d| deployment_ready(&d))
                        .unwrap_or(false)
                }
                // Only workloads have a readiness signal worth waiting on.
                _ => true,
            };
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(EngineError::Apply(format!(
                    "timed out waiting for {}/{} in {}",
                    kind, name, namespace
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn wait_until_gone(
        &self,
        api: &Api<DynamicObject>,
        kind: &str,
        name: &str,
        wait: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if api.get_opt(name).await?.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(EngineError::Remove(format!(
                    "timed out waiting for {}/{} to be removed",
                    kind, name
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_configmap(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_statefulset_names(
        &self,
        namespace: &str,
        pattern: &Regex,
    ) -> Result<Vec<String>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .map(|s| s.name_any())
            .filter(|n| pattern.is_match(n))
            .collect())
    }

    async fn apply(&self, resource: &Resource, wait: Option<Duration>) -> Result<()> {
        let kind = resource.kind().to_string();
        let name = resource.name().to_string();
        let namespace = resource.namespace().to_string();
        let api = self.dynamic_api(resource.api_version(), &kind, &namespace);

        let obj: DynamicObject = serde_json::from_value(resource.value().clone())?;
        match api.get_opt(&name).await? {
            Some(_existing) => {
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&obj),
                )
                .await
                .map_err(|e| EngineError::Apply(format!("{}/{}: {}", kind, name, e)))?;
            }
            None => {
                api.create(&PostParams::default(), &obj)
                    .await
                    .map_err(|e| EngineError::Apply(format!("{}/{}: {}", kind, name, e)))?;
            }
        }
        debug!(kind = %kind, name = %name, namespace = %namespace, "applied resource");

        if let Some(wait) = wait {
            if !wait.is_zero() {
                self.wait_until_ready(&kind, &name, &namespace, wait).await?;
            }
        }
        Ok(())
    }

    async fn remove(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        wait: Option<Duration>,
    ) -> Result<()> {
        let ar = builtin_api_resource(kind)
            .ok_or_else(|| EngineError::Remove(format!("unsupported kind: {}", kind)))?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(kind = %kind, name = %name, namespace = %namespace, "removed resource");
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(kind = %kind, name = %name, "resource already gone");
                return Ok(());
            }
            Err(e) => {
                return Err(EngineError::Remove(format!("{}/{}: {}", kind, name, e)));
            }
        }
        if let Some(wait) = wait {
            if !wait.is_zero() {
                self.wait_until_gone(&api, kind, name, wait).await?;
            }
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        pattern: &Regex,
        on_available: PodHandler,
        on_unavailable: PodHandler,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                    if !pattern.is_match(&pod.name_any()) {
                        continue;
                    }
                    if pod.metadata.deletion_timestamp.is_some() {
                        on_unavailable(pod);
                    } else if pod_ready(&pod) {
                        on_available(pod);
                    }
                }
                Ok(watcher::Event::Delete(pod)) => {
                    if pattern.is_match(&pod.name_any()) {
                        on_unavailable(pod);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(namespace = %namespace, "pod watch error: {}", e);
                }
            }
        }
        Ok(())
    }
}

/// Maps the kinds this engine manages to their API coordinates.
fn builtin_api_resource(kind: &str) -> Option<ApiResource> {
    let (group, version, plural) = match kind {
        "StatefulSet" => ("apps", "v1", "statefulsets"),
        "Deployment" => ("apps", "v1", "deployments"),
        "DaemonSet" => ("apps", "v1", "daemonsets"),
        "Service" => ("", "v1", "services"),
        "ConfigMap" => ("", "v1", "configmaps"),
        "Secret" => ("", "v1", "secrets"),
        "ServiceAccount" => ("", "v1", "serviceaccounts"),
        "HorizontalPodAutoscaler" => ("autoscaling", "v2", "horizontalpodautoscalers"),
        "PodDisruptionBudget" => ("policy", "v1", "poddisruptionbudgets"),
        "Ingress" => ("networking.k8s.io", "v1", "ingresses"),
        "Job" => ("batch", "v1", "jobs"),
        "CronJob" => ("batch", "v1", "cronjobs"),
        _ => return None,
    };
    Some(ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(group, version, kind),
        plural,
    ))
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status.as_ref().is_some_and(|s| {
        s.conditions.as_ref().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
    })
}

fn statefulset_ready(sts: &StatefulSet) -> bool {
    let generation = sts.metadata.generation.unwrap_or(0);
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    sts.status.as_ref().is_some_and(|s| {
        s.observed_generation.unwrap_or(0) >= generation
            && s.ready_replicas.unwrap_or(0) == replicas
            && s.updated_replicas.unwrap_or(0) == replicas
    })
}

fn deployment_ready(deploy: &Deployment) -> bool {
    let generation = deploy.metadata.generation.unwrap_or(0);
    let replicas = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    deploy.status.as_ref().is_some_and(|s| {
        s.observed_generation.unwrap_or(0) >= generation
            && s.ready_replicas.unwrap_or(0) == replicas
            && s.available_replicas.unwrap_or(0) == replicas
            && s.updated_replicas.unwrap_or(0) == replicas
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording mock shared by the rotation and rollout tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockClusterApi {
        /// ConfigMaps visible to `get_configmap`, keyed by (namespace, name).
        pub configmaps: Mutex<HashMap<(String, String), ConfigMap>>,
        /// StatefulSet names visible to listings, as (namespace, name).
        pub statefulsets: Mutex<Vec<(String, String)>>,
        /// Every resource passed to `apply`, in order.
        pub applied: Mutex<Vec<Resource>>,
        /// Every removal as (kind, namespace, name), in order.
        pub removed: Mutex<Vec<(String, String, String)>>,
        /// Names for which `remove` fails.
        pub fail_remove: Mutex<Vec<String>>,
    }

    impl MockClusterApi {
        pub fn with_statefulsets(names: &[(&str, &str)]) -> Self {
            let mock = Self::default();
            *mock.statefulsets.lock().unwrap() = names
                .iter()
                .map(|(ns, n)| (ns.to_string(), n.to_string()))
                .collect();
            mock
        }

        pub fn insert_configmap(&self, namespace: &str, name: &str, key: &str, value: &str) {
            let mut data = std::collections::BTreeMap::new();
            data.insert(key.to_string(), value.to_string());
            let cm = ConfigMap {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            self.configmaps
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), cm);
        }

        pub fn applied_keys(&self) -> Vec<String> {
            self.applied.lock().unwrap().iter().map(|r| r.key()).collect()
        }

        pub fn removed_names(&self) -> Vec<String> {
            self.removed
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, n)| n.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ClusterApi for MockClusterApi {
        async fn get_configmap(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>> {
            Ok(self
                .configmaps
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn list_statefulset_names(
            &self,
            namespace: &str,
            pattern: &Regex,
        ) -> Result<Vec<String>> {
            Ok(self
                .statefulsets
                .lock()
                .unwrap()
                .iter()
                .filter(|(ns, n)| ns == namespace && pattern.is_match(n))
                .map(|(_, n)| n.clone())
                .collect())
        }

        async fn apply(&self, resource: &Resource, _wait: Option<Duration>) -> Result<()> {
            if resource.kind() == "ConfigMap" {
                // Keep persisted manifests readable within the same test.
                let cm: ConfigMap = resource.parse()?;
                self.configmaps.lock().unwrap().insert(
                    (
                        resource.namespace().to_string(),
                        resource.name().to_string(),
                    ),
                    cm,
                );
            }
            self.applied.lock().unwrap().push(resource.clone());
            Ok(())
        }

        async fn remove(
            &self,
            kind: &str,
            name: &str,
            namespace: &str,
            _wait: Option<Duration>,
        ) -> Result<()> {
            if self.fail_remove.lock().unwrap().iter().any(|n| n == name) {
                return Err(EngineError::Remove(format!("injected failure for {}", name)));
            }
            self.removed.lock().unwrap().push((
                kind.to_string(),
                namespace.to_string(),
                name.to_string(),
            ));
            Ok(())
        }

        async fn watch_pods(
            &self,
            _namespace: &str,
            _pattern: &Regex,
            _on_available: PodHandler,
            _on_unavailable: PodHandler,
        ) -> Result<()> {
            Ok(())
        }
    }
}
