//! The explicit engine context.
//!
//! The original process-global options and caches are replaced by one value
//! threaded through every operation: cluster identity, base path, namespace,
//! the collaborator capabilities, and the cancellation root.

use crate::asset::AssetLoader;
use crate::cluster::ClusterApi;
use crate::config::{ClusterOptions, Plugin, RemoteValuesCache};
use crate::manifest::Renderer;
use crate::storage::RemoteStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an engine operation needs to reach the outside world.
pub struct ResourceContext {
    cluster_api: Arc<dyn ClusterApi>,
    storage: Arc<dyn RemoteStorage>,
    renderer: Arc<dyn Renderer>,
    assets: Arc<AssetLoader>,
    values_cache: Arc<RemoteValuesCache>,
    options: ClusterOptions,
    namespace: String,
    plugins: Vec<Plugin>,
    cancel: CancellationToken,
}

impl ResourceContext {
    pub fn new(
        cluster_api: Arc<dyn ClusterApi>,
        storage: Arc<dyn RemoteStorage>,
        renderer: Arc<dyn Renderer>,
        options: ClusterOptions,
        namespace: &str,
    ) -> Self {
        let assets = Arc::new(AssetLoader::new(
            Arc::clone(&storage),
            &options.basepath,
            None,
        ));
        Self {
            cluster_api,
            storage,
            renderer,
            assets,
            values_cache: Arc::new(RemoteValuesCache::new()),
            options,
            namespace: namespace.to_string(),
            plugins: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the asset cache directory (defaults to a tmp path).
    pub fn with_work_path(mut self, work_path: PathBuf) -> Self {
        self.assets = Arc::new(AssetLoader::new(
            Arc::clone(&self.storage),
            &self.options.basepath,
            Some(work_path),
        ));
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<Plugin>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn cluster_api(&self) -> &dyn ClusterApi {
        self.cluster_api.as_ref()
    }

    pub fn storage(&self) -> &Arc<dyn RemoteStorage> {
        &self.storage
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    pub fn assets(&self) -> &AssetLoader {
        &self.assets
    }

    pub fn values_cache(&self) -> &RemoteValuesCache {
        &self.values_cache
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn cluster(&self) -> &str {
        &self.options.cluster
    }

    pub fn basepath(&self) -> &str {
        &self.options.basepath
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
