//! Object storage access.
//!
//! All remote reads and writes go through the [`RemoteStorage`] capability
//! so that the engine never touches a concrete backend directly. The default
//! implementation wraps an [`object_store::ObjectStore`]; tests use the
//! crate's in-memory store.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions};
use std::sync::Arc;
use tracing::warn;

/// Storage capability keyed by full URLs (`gs://bucket/path/to/object`).
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Reads the object at `url` in full.
    async fn read(&self, url: &str) -> Result<Vec<u8>>;

    /// Lists object URLs under the `url` prefix. Non-recursive listings
    /// return only the immediate children.
    async fn list(&self, url: &str, recursive: bool) -> Result<Vec<String>>;

    /// Writes the object unconditionally.
    async fn put(&self, url: &str, data: Vec<u8>) -> Result<()>;

    /// Writes the object only when it does not exist yet. Returns `false`
    /// when another writer got there first.
    async fn put_if_absent(&self, url: &str, data: Vec<u8>) -> Result<bool>;

    /// Deletes the object. Deleting an absent object is not an error.
    async fn delete(&self, url: &str) -> Result<()>;
}

/// Resolves `.` and `..` segments in a URL path, clamped at the bucket root.
pub fn normalize_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => (rest, ""),
    };
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("{}://{}/{}", scheme, host, segments.join("/"))
}

/// [`RemoteStorage`] backed by an `object_store` implementation rooted at a
/// single bucket.
pub struct ObjectStoreStorage {
    inner: Arc<dyn ObjectStore>,
    scheme: String,
    bucket: String,
}

impl ObjectStoreStorage {
    pub fn new(inner: Arc<dyn ObjectStore>, scheme: &str, bucket: &str) -> Self {
        Self {
            inner,
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
        }
    }

    fn to_path(&self, url: &str) -> StorePath {
        let normalized = normalize_url(url);
        let path = match normalized.split_once("://") {
            Some((_, rest)) => match rest.split_once('/') {
                Some((host, p)) => {
                    if host != self.bucket {
                        warn!(url = %url, bucket = %self.bucket, "url bucket differs from configured bucket");
                    }
                    p.to_string()
                }
                None => String::new(),
            },
            None => normalized,
        };
        StorePath::from(path)
    }

    fn to_url(&self, path: &StorePath) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, path)
    }
}

#[async_trait]
impl RemoteStorage for ObjectStoreStorage {
    async fn read(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.to_path(url);
        let result = self.inner.get(&path).await?;
        Ok(result.bytes().await?.to_vec())
    }

    async fn list(&self, url: &str, recursive: bool) -> Result<Vec<String>> {
        let prefix = self.to_path(url);
        if recursive {
            let metas: Vec<_> = self.inner.list(Some(&prefix)).try_collect().await?;
            Ok(metas.iter().map(|m| self.to_url(&m.location)).collect())
        } else {
            let listing = self.inner.list_with_delimiter(Some(&prefix)).await?;
            Ok(listing
                .objects
                .iter()
                .map(|m| self.to_url(&m.location))
                .collect())
        }
    }

    async fn put(&self, url: &str, data: Vec<u8>) -> Result<()> {
        let path = self.to_path(url);
        self.inner.put(&path, data.into()).await?;
        Ok(())
    }

    async fn put_if_absent(&self, url: &str, data: Vec<u8>) -> Result<bool> {
        let path = self.to_path(url);
        match self
            .inner
            .put_opts(&path, data.into(), PutOptions::from(PutMode::Create))
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(EngineError::from(e)),
        }
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let path = self.to_path(url);
        match self.inner.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(EngineError::from(e)),
        }
    }
}
