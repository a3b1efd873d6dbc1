//! Foreman application-lifecycle engine
//!
//! Renders Helm-style charts into concrete workload manifests, applies them
//! through a rollout that preserves stateful workloads by rotating them
//! under generational names, and schedules user-supplied jobs onto a
//! dynamically scaled worker-pod pool.
//!
//! ## Rollout
//!
//! ```text
//! values → merge(app, global) → schema.validate → chart.render
//!        → diff(old, new) → {rotate | in-place | remove} → apply → persist
//! ```
//!
//! ## Scheduling
//!
//! ```text
//! Schedule(jobs) → queue → runners.schedule(n) → operator.SpinUp
//!                → watch → runner.start → job(pod) → [retry | done]
//!                → idle → operator.TearDown
//! ```

pub mod asset;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod pods;
pub mod release;
pub mod rollout;
pub mod rotation;
pub mod storage;
pub mod values;

pub use cluster::{ClusterApi, KubeClusterApi};
pub use context::ResourceContext;
pub use error::{EngineError, Result};
pub use pods::{Group, GroupOptions, Job, Operator};
pub use release::{Release, ReleaseOptions, ReleaseSpec};
