//! Error types for the foreman engine

use std::fmt;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operations
#[derive(Debug)]
pub enum EngineError {
    /// Invalid release or resource name
    InvalidName(String),
    /// Release spec is missing or empty
    EmptySpec(String),
    /// Cluster-level configuration is missing or incomplete
    ConfigMissing(String),
    /// Asset could not be fetched from storage
    AssetFetch(String),
    /// Asset JSON schema failed to compile
    SchemaCompile(String),
    /// Values failed schema validation
    SchemaInvalid(String),
    /// Chart rendering failed
    Render(String),
    /// Required global value is missing from the values tree
    MissingGlobal(String),
    /// Rendered manifest contains no resources
    EmptyManifest,
    /// A rotation was required but no current rotation exists
    NoCurrentRotation(String),
    /// Applying a resource to the cluster failed
    Apply(String),
    /// Removing a resource from the cluster failed
    Remove(String),
    /// Distributed lock could not be acquired in time
    LockTimeout(String),
    /// A plugin URL placeholder has no matching app value
    PluginMissingValue(String),
    /// Kubernetes API error
    KubeApi(String),
    /// Serialization error
    Serialization(String),
    /// Object storage error
    Storage(String),
    /// Local filesystem or subprocess I/O error
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidName(msg) => write!(f, "invalid name: {}", msg),
            EngineError::EmptySpec(msg) => write!(f, "empty spec: {}", msg),
            EngineError::ConfigMissing(msg) => write!(f, "configuration missing: {}", msg),
            EngineError::AssetFetch(msg) => write!(f, "asset fetch failed: {}", msg),
            EngineError::SchemaCompile(msg) => write!(f, "schema compilation failed: {}", msg),
            EngineError::SchemaInvalid(msg) => write!(f, "schema validation failed: {}", msg),
            EngineError::Render(msg) => write!(f, "chart render failed: {}", msg),
            EngineError::MissingGlobal(msg) => write!(f, "missing global value: {}", msg),
            EngineError::EmptyManifest => write!(f, "nothing to rollout"),
            EngineError::NoCurrentRotation(msg) => write!(f, "no current rotation found: {}", msg),
            EngineError::Apply(msg) => write!(f, "apply failed: {}", msg),
            EngineError::Remove(msg) => write!(f, "remove failed: {}", msg),
            EngineError::LockTimeout(msg) => write!(f, "lock acquisition timed out: {}", msg),
            EngineError::PluginMissingValue(msg) => {
                write!(f, "plugin value missing: {}", msg)
            }
            EngineError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            EngineError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            EngineError::Storage(msg) => write!(f, "object storage error: {}", msg),
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<kube::Error> for EngineError {
    fn from(err: kube::Error) -> Self {
        EngineError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<object_store::Error> for EngineError {
    fn from(err: object_store::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}
